use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::server::{GrpcServer, ServerConfig, ServiceRegistrar};
use crate::services::{AuthService, FollowService, TokenSigner, UserInfoService};
use crate::storage::MemoryStorage;

/// Fully wired application: one shared store, three capabilities, one server.
pub struct App {
    server: Arc<GrpcServer>,
    storage: Arc<MemoryStorage>,
}

impl App {
    /// Opens storage and wires the reference capabilities into a gRPC server.
    ///
    /// The server is returned in the `Constructed` state; nothing listens until
    /// [`GrpcServer::run`] is called.
    ///
    /// # Errors
    /// Fails if the storage location is unreachable or the listen address is invalid.
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let storage = Arc::new(MemoryStorage::open(&config.storage_path).await?);
        let signer = TokenSigner::new(
            config.secret.as_bytes(),
            config.access_token_ttl(),
            config.refresh_token_ttl(),
        );

        let mut registrar = ServiceRegistrar::new();
        registrar
            .register_auth(Arc::new(AuthService::new(Arc::clone(&storage), signer)))?
            .register_user_directory(Arc::new(UserInfoService::new(Arc::clone(&storage))))?
            .register_follow_graph(Arc::new(FollowService::new(Arc::clone(&storage))))?;

        let server = GrpcServer::from_settings(&config.grpc, registrar.finish())?;
        info!(
            storage = %config.storage_path,
            addr = %server.addr(),
            services = ?server.service_names(),
            "application assembled"
        );

        Ok(Self {
            server: Arc::new(server),
            storage,
        })
    }

    /// The gRPC server, shareable between the serving and the stopping task.
    pub fn server(&self) -> Arc<GrpcServer> {
        Arc::clone(&self.server)
    }

    /// The store shared by every capability.
    pub fn storage(&self) -> Arc<MemoryStorage> {
        Arc::clone(&self.storage)
    }
}
