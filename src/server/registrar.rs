//! Binding of capability implementations onto the gRPC dispatch table.
//!
//! The adapters in this module only translate: wire messages into domain values, domain
//! results back into wire messages, and [`ServiceError`]s into [`Status`] codes.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use metrics::counter;
use tonic::body::BoxBody;
use tonic::codegen::{http, Service};
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tonic::{Request, Response, Status};
use tonic_health::server::{health_reporter, HealthReporter};
use tracing::debug;

use crate::capability::{Authenticator, CallContext, FollowGraph, UserDirectory};
use crate::error::{Error, Result, ServiceError};
use crate::models::{Credentials, TokenPair, User, UserId};
use crate::proto::auth::auth_server::{Auth as AuthRpc, AuthServer};
use crate::proto::auth::{LoginRequest, RefreshTokensRequest, SignUpRequest, TokenPairResponse};
use crate::proto::follow::follow_graph_server::{FollowGraph as FollowGraphRpc, FollowGraphServer};
use crate::proto::follow::{FollowRequest, FollowResponse, RelationsRequest, RelationsResponse};
use crate::proto::userinfo::user_info_server::{UserInfo as UserInfoRpc, UserInfoServer};
use crate::proto::userinfo::{
    FindUsersByLoginRequest, GetUserRequest, GetUserResponse, GetUsersRequest, UsersExistRequest,
    UsersExistResponse, UsersResponse,
};

/// Name under which the standard health service is registered.
pub const HEALTH_SERVICE_NAME: &str = "grpc.health.v1.Health";

/// Services collected during composition, ready to be served.
pub struct ServiceBindings {
    /// Dispatch table, health service included.
    pub routes: Routes,
    /// Names of the registered capability services, in registration order.
    pub names: Vec<&'static str>,
    /// Handle used to flip the health status of every capability.
    pub health: HealthReporter,
}

/// Collects gRPC services, rejecting duplicate service names.
pub struct ServiceRegistrar {
    routes: RoutesBuilder,
    registered: BTreeSet<&'static str>,
    names: Vec<&'static str>,
    health: HealthReporter,
}

impl ServiceRegistrar {
    /// Creates a registrar that already carries the health service.
    pub fn new() -> Self {
        let (health, health_service) = health_reporter();
        let mut routes = RoutesBuilder::default();
        routes.add_service(health_service);

        Self {
            routes,
            registered: BTreeSet::from([HEALTH_SERVICE_NAME]),
            names: Vec::new(),
            health,
        }
    }

    /// Registers any named gRPC service.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateService`] if a service with the same name is already bound.
    pub fn add_service<S>(&mut self, service: S) -> Result<&mut Self>
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        if !self.registered.insert(S::NAME) {
            return Err(Error::DuplicateService(S::NAME));
        }

        self.routes.add_service(service);
        self.names.push(S::NAME);
        debug!(service = S::NAME, "registered gRPC service");
        Ok(self)
    }

    /// Binds the authentication capability as `auth.Auth`.
    pub fn register_auth(&mut self, auth: Arc<dyn Authenticator>) -> Result<&mut Self> {
        self.add_service(AuthServer::new(AuthAdapter { auth }))
    }

    /// Binds the user directory capability as `userinfo.UserInfo`.
    pub fn register_user_directory(
        &mut self,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<&mut Self> {
        self.add_service(UserInfoServer::new(UserInfoAdapter { directory }))
    }

    /// Binds the follow graph capability as `follow.FollowGraph`.
    pub fn register_follow_graph(&mut self, graph: Arc<dyn FollowGraph>) -> Result<&mut Self> {
        self.add_service(FollowGraphServer::new(FollowGraphAdapter { graph }))
    }

    /// Names of the capability services registered so far.
    pub fn service_names(&self) -> &[&'static str] {
        &self.names
    }

    /// Freezes the registrations.
    pub fn finish(self) -> ServiceBindings {
        ServiceBindings {
            routes: self.routes.routes(),
            names: self.names,
            health: self.health,
        }
    }
}

impl Default for ServiceRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the call context and refuses calls whose deadline already passed.
#[allow(clippy::result_large_err)]
fn call_context<T>(
    method: &'static str,
    request: &Request<T>,
) -> std::result::Result<CallContext, Status> {
    let ctx = CallContext::from_metadata(request.metadata());
    observe(method, ctx.ensure_active())?;
    Ok(ctx)
}

/// Records the outcome of a call and converts domain errors into statuses.
#[allow(clippy::result_large_err)]
fn observe<T>(
    method: &'static str,
    result: std::result::Result<T, ServiceError>,
) -> std::result::Result<T, Status> {
    let result = result.map_err(Status::from);
    let code = match &result {
        Ok(_) => tonic::Code::Ok,
        Err(status) => status.code(),
    };
    counter!("grpc.responses", "method" => method, "code" => code.description()).increment(1);
    result
}

fn to_ids(ids: Vec<u64>) -> BTreeSet<UserId> {
    ids.into_iter().map(UserId).collect()
}

impl From<TokenPair> for TokenPairResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        }
    }
}

impl From<User> for crate::proto::userinfo::User {
    fn from(user: User) -> Self {
        Self {
            id: user.id.0,
            login: user.login,
            email: user.email,
        }
    }
}

fn to_wire(users: Vec<User>) -> Vec<crate::proto::userinfo::User> {
    users.into_iter().map(Into::into).collect()
}

struct AuthAdapter {
    auth: Arc<dyn Authenticator>,
}

#[tonic::async_trait]
impl AuthRpc for AuthAdapter {
    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> std::result::Result<Response<TokenPairResponse>, Status> {
        const METHOD: &str = "auth.Auth/Login";
        let ctx = call_context(METHOD, &request)?;
        let req = request.into_inner();

        let credentials = Credentials::new(req.login, req.password);
        let tokens = observe(METHOD, ctx.run(self.auth.login(&ctx, credentials)).await)?;
        Ok(Response::new(tokens.into()))
    }

    async fn sign_up(
        &self,
        request: Request<SignUpRequest>,
    ) -> std::result::Result<Response<TokenPairResponse>, Status> {
        const METHOD: &str = "auth.Auth/SignUp";
        let ctx = call_context(METHOD, &request)?;
        let req = request.into_inner();

        let credentials = Credentials::new(req.login, req.password);
        let tokens = observe(
            METHOD,
            ctx.run(self.auth.sign_up(&ctx, req.email, credentials)).await,
        )?;
        Ok(Response::new(tokens.into()))
    }

    async fn refresh_tokens(
        &self,
        request: Request<RefreshTokensRequest>,
    ) -> std::result::Result<Response<TokenPairResponse>, Status> {
        const METHOD: &str = "auth.Auth/RefreshTokens";
        let ctx = call_context(METHOD, &request)?;
        let req = request.into_inner();

        let tokens = observe(
            METHOD,
            ctx.run(self.auth.refresh_tokens(&ctx, req.refresh_token)).await,
        )?;
        Ok(Response::new(tokens.into()))
    }
}

struct UserInfoAdapter {
    directory: Arc<dyn UserDirectory>,
}

#[tonic::async_trait]
impl UserInfoRpc for UserInfoAdapter {
    async fn get_user(
        &self,
        request: Request<GetUserRequest>,
    ) -> std::result::Result<Response<GetUserResponse>, Status> {
        const METHOD: &str = "userinfo.UserInfo/GetUser";
        let ctx = call_context(METHOD, &request)?;
        let id = UserId(request.into_inner().id);

        let user = observe(METHOD, ctx.run(self.directory.user(&ctx, id)).await)?;
        Ok(Response::new(GetUserResponse {
            user: Some(user.into()),
        }))
    }

    async fn get_users(
        &self,
        request: Request<GetUsersRequest>,
    ) -> std::result::Result<Response<UsersResponse>, Status> {
        const METHOD: &str = "userinfo.UserInfo/GetUsers";
        let ctx = call_context(METHOD, &request)?;
        let ids = to_ids(request.into_inner().ids);

        let users = observe(METHOD, ctx.run(self.directory.users(&ctx, ids)).await)?;
        Ok(Response::new(UsersResponse {
            users: to_wire(users),
        }))
    }

    async fn users_exist(
        &self,
        request: Request<UsersExistRequest>,
    ) -> std::result::Result<Response<UsersExistResponse>, Status> {
        const METHOD: &str = "userinfo.UserInfo/UsersExist";
        let ctx = call_context(METHOD, &request)?;
        let ids = to_ids(request.into_inner().ids);

        let exist = observe(METHOD, ctx.run(self.directory.users_exist(&ctx, ids)).await)?;
        Ok(Response::new(UsersExistResponse { exist }))
    }

    async fn find_users_by_login(
        &self,
        request: Request<FindUsersByLoginRequest>,
    ) -> std::result::Result<Response<UsersResponse>, Status> {
        const METHOD: &str = "userinfo.UserInfo/FindUsersByLogin";
        let ctx = call_context(METHOD, &request)?;
        let login = request.into_inner().login;

        let users = observe(
            METHOD,
            ctx.run(self.directory.users_by_login(&ctx, login)).await,
        )?;
        Ok(Response::new(UsersResponse {
            users: to_wire(users),
        }))
    }
}

struct FollowGraphAdapter {
    graph: Arc<dyn FollowGraph>,
}

#[tonic::async_trait]
impl FollowGraphRpc for FollowGraphAdapter {
    async fn follow(
        &self,
        request: Request<FollowRequest>,
    ) -> std::result::Result<Response<FollowResponse>, Status> {
        const METHOD: &str = "follow.FollowGraph/Follow";
        let ctx = call_context(METHOD, &request)?;
        let req = request.into_inner();

        observe(
            METHOD,
            ctx.run(self.graph.follow(&ctx, UserId(req.source_id), UserId(req.target_id)))
                .await,
        )?;
        Ok(Response::new(FollowResponse {}))
    }

    async fn unfollow(
        &self,
        request: Request<FollowRequest>,
    ) -> std::result::Result<Response<FollowResponse>, Status> {
        const METHOD: &str = "follow.FollowGraph/Unfollow";
        let ctx = call_context(METHOD, &request)?;
        let req = request.into_inner();

        observe(
            METHOD,
            ctx.run(self.graph.unfollow(&ctx, UserId(req.source_id), UserId(req.target_id)))
                .await,
        )?;
        Ok(Response::new(FollowResponse {}))
    }

    async fn followers(
        &self,
        request: Request<RelationsRequest>,
    ) -> std::result::Result<Response<RelationsResponse>, Status> {
        const METHOD: &str = "follow.FollowGraph/Followers";
        let ctx = call_context(METHOD, &request)?;
        let id = UserId(request.into_inner().id);

        let users = observe(METHOD, ctx.run(self.graph.followers(&ctx, id)).await)?;
        Ok(Response::new(RelationsResponse {
            users: to_wire(users),
        }))
    }

    async fn followees(
        &self,
        request: Request<RelationsRequest>,
    ) -> std::result::Result<Response<RelationsResponse>, Status> {
        const METHOD: &str = "follow.FollowGraph/Followees";
        let ctx = call_context(METHOD, &request)?;
        let id = UserId(request.into_inner().id);

        let users = observe(METHOD, ctx.run(self.graph.followees(&ctx, id)).await)?;
        Ok(Response::new(RelationsResponse {
            users: to_wire(users),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tonic::metadata::MetadataValue;
    use tonic::Code;

    use super::*;
    use crate::capability::GRPC_TIMEOUT_HEADER;

    #[derive(Default)]
    struct CountingAuth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn login(
            &self,
            _ctx: &CallContext,
            credentials: Credentials,
        ) -> std::result::Result<TokenPair, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if credentials.password == "right" {
                Ok(TokenPair {
                    access_token: "a".into(),
                    refresh_token: "r".into(),
                })
            } else {
                Err(ServiceError::InvalidCredentials)
            }
        }

        async fn sign_up(
            &self,
            _ctx: &CallContext,
            _email: String,
            _credentials: Credentials,
        ) -> std::result::Result<TokenPair, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::UserExists)
        }

        async fn refresh_tokens(
            &self,
            _ctx: &CallContext,
            _refresh_token: String,
        ) -> std::result::Result<TokenPair, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::InvalidRefreshToken)
        }
    }

    fn login_request(password: &str) -> Request<LoginRequest> {
        Request::new(LoginRequest {
            login: "alice".into(),
            password: password.into(),
        })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let auth: Arc<dyn Authenticator> = Arc::new(CountingAuth::default());
        let mut registrar = ServiceRegistrar::new();

        registrar.register_auth(Arc::clone(&auth)).unwrap();
        let err = registrar.register_auth(auth).err().unwrap();

        assert!(matches!(err, Error::DuplicateService("auth.Auth")));
        assert_eq!(registrar.service_names(), &["auth.Auth"]);
    }

    #[test]
    fn health_service_name_is_reserved() {
        let mut registrar = ServiceRegistrar::new();
        let (_, health_service) = health_reporter();

        let err = registrar.add_service(health_service).err().unwrap();
        assert!(matches!(err, Error::DuplicateService(HEALTH_SERVICE_NAME)));
    }

    #[test]
    fn finish_keeps_registration_order() {
        let auth: Arc<dyn Authenticator> = Arc::new(CountingAuth::default());
        let mut registrar = ServiceRegistrar::new();
        registrar.register_auth(auth).unwrap();

        let bindings = registrar.finish();
        assert_eq!(bindings.names, vec!["auth.Auth"]);
    }

    #[tokio::test]
    async fn domain_errors_map_to_status_codes() {
        let adapter = AuthAdapter {
            auth: Arc::new(CountingAuth::default()),
        };

        let ok = adapter.login(login_request("right")).await.unwrap().into_inner();
        assert_eq!(ok.access_token, "a");

        let denied = adapter.login(login_request("wrong")).await.unwrap_err();
        assert_eq!(denied.code(), Code::Unauthenticated);

        let exists = adapter
            .sign_up(Request::new(SignUpRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(exists.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn expired_calls_are_not_dispatched() {
        let auth = Arc::new(CountingAuth::default());
        let adapter = AuthAdapter {
            auth: Arc::clone(&auth) as Arc<dyn Authenticator>,
        };

        let mut request = login_request("right");
        request
            .metadata_mut()
            .insert(GRPC_TIMEOUT_HEADER, MetadataValue::from_static("0n"));

        let status = adapter.login(request).await.unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }
}
