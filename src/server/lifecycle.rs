//! Ownership of the listening socket and the serving loop.
//!
//! A [`GrpcServer`] moves through four states:
//!
//! ```text
//! Constructed ──run──▶ Listening ──bound──▶ Serving ──stop──▶ Stopped
//!      ▲                   │
//!      └──── bind failed ──┘
//! ```
//!
//! `stop` on a server that never ran moves it straight to `Stopped`, and a stopped server cannot
//! be run again. A `stop` issued while the listener is still binding is kept: if the bind then
//! fails, the server ends up `Stopped` rather than `Constructed`.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::{error, info};

use super::config::GrpcSettings;
use super::interceptor::InterceptorChain;
use super::registrar::ServiceBindings;
use crate::error::{Error, Result};

/// Position of a server in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built, never started (or started and failed to bind).
    Constructed,
    /// Claimed by `run`, binding the socket.
    Listening,
    /// Accepting calls.
    Serving,
    /// Shut down for good.
    Stopped,
}

impl LifecycleState {
    fn is_running(self) -> bool {
        matches!(self, Self::Listening | Self::Serving)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Constructed => "constructed",
            Self::Listening => "listening",
            Self::Serving => "serving",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// gRPC server with an explicit run/stop lifecycle.
///
/// `run` and `stop` take `&self` so the server can be shared through an `Arc` between the task
/// that serves and the task that shuts it down.
pub struct GrpcServer {
    addr: SocketAddr,
    timeout: Duration,
    chain: InterceptorChain,
    routes: Routes,
    health: HealthReporter,
    names: Vec<&'static str>,
    state: watch::Sender<LifecycleState>,
    stop_requested: watch::Sender<bool>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl GrpcServer {
    /// Creates a server that will listen on `addr` once run.
    pub fn new(
        addr: SocketAddr,
        timeout: Duration,
        chain: InterceptorChain,
        bindings: ServiceBindings,
    ) -> Self {
        Self {
            addr,
            timeout,
            chain,
            routes: bindings.routes,
            health: bindings.health,
            names: bindings.names,
            state: watch::Sender::new(LifecycleState::Constructed),
            stop_requested: watch::Sender::new(false),
            local_addr: watch::Sender::new(None),
        }
    }

    /// Creates a server from listener settings.
    pub fn from_settings(settings: &GrpcSettings, bindings: ServiceBindings) -> Result<Self> {
        let chain = InterceptorChain::new().with_request_logging(settings.request_logging);
        Ok(Self::new(settings.addr()?, settings.timeout(), chain, bindings))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address actually bound, while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.borrow()
    }

    /// Names of the capability services this server dispatches to.
    pub fn service_names(&self) -> &[&'static str] {
        &self.names
    }

    /// Waits until the server is serving and returns its bound address.
    ///
    /// Returns `None` if the server stops first. A failed bind returns the server to
    /// `Constructed` and does not resolve the wait; observe the result of `run` for that.
    pub async fn wait_serving(&self) -> Option<SocketAddr> {
        let mut state = self.state.subscribe();
        let serving = state
            .wait_for(|s| matches!(s, LifecycleState::Serving | LifecycleState::Stopped))
            .await
            .map(|s| *s == LifecycleState::Serving)
            .unwrap_or(false);

        if serving {
            self.local_addr()
        } else {
            None
        }
    }

    /// Binds the listener and serves until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    /// - [`Error::AlreadyRunning`] if another `run` is in progress
    /// - [`Error::AlreadyStopped`] if the server was stopped
    /// - [`Error::Bind`] if the address cannot be bound; the server returns to `Constructed`
    /// - [`Error::Transport`] if serving fails
    pub async fn run(&self) -> Result<()> {
        const OP: &str = "grpc_server.run";

        let mut claim = Ok(());
        self.state.send_if_modified(|state| match state {
            LifecycleState::Constructed => {
                *state = LifecycleState::Listening;
                self.stop_requested.send_replace(false);
                true
            }
            LifecycleState::Stopped => {
                claim = Err(Error::AlreadyStopped);
                false
            }
            LifecycleState::Listening | LifecycleState::Serving => {
                claim = Err(Error::AlreadyRunning);
                false
            }
        });
        claim?;

        info!(op = OP, addr = %self.addr, "starting gRPC server");

        let (listener, local_addr) = match bind(self.addr).await {
            Ok(bound) => bound,
            Err(e) => {
                let state = self.release_failed_bind();
                error!(op = OP, addr = %self.addr, error = %e, %state, "failed to bind listener");
                return Err(e);
            }
        };

        self.local_addr.send_replace(Some(local_addr));
        self.state.send_replace(LifecycleState::Serving);
        self.set_health(ServingStatus::Serving).await;

        info!(
            op = OP,
            addr = %local_addr,
            services = ?self.names,
            interceptors = ?self.chain.names(),
            "starting to serve"
        );

        let mut stop_requested = self.stop_requested.subscribe();
        let shutdown = async move {
            let _ = stop_requested.wait_for(|requested| *requested).await;
        };

        let result = Server::builder()
            .timeout(self.timeout)
            .layer(self.chain.layer())
            .add_routes(self.routes.clone())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await;

        self.local_addr.send_replace(None);
        self.state.send_replace(LifecycleState::Stopped);

        match result {
            Ok(()) => {
                info!(op = OP, "server stopped");
                Ok(())
            }
            Err(e) => {
                error!(op = OP, error = %e, "server terminated with an error");
                Err(e.into())
            }
        }
    }

    /// Like [`run`](Self::run), but panics if the server fails.
    pub async fn must_run(&self) {
        if let Err(e) = self.run().await {
            panic!("gRPC server failed: {e}");
        }
    }

    /// Stops the server, letting in-flight calls finish.
    ///
    /// Returns once the serving loop has exited. Calling `stop` on a server that never ran, or
    /// that already stopped, returns immediately.
    pub async fn stop(&self) {
        const OP: &str = "grpc_server.stop";

        let mut running = false;
        self.state.send_if_modified(|state| match state {
            LifecycleState::Constructed => {
                *state = LifecycleState::Stopped;
                true
            }
            LifecycleState::Stopped => false,
            LifecycleState::Listening | LifecycleState::Serving => {
                running = true;
                self.stop_requested.send_replace(true);
                false
            }
        });

        if !running {
            return;
        }

        info!(op = OP, addr = ?self.local_addr(), "stopping server");
        self.set_health(ServingStatus::NotServing).await;

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| !s.is_running()).await;
    }

    /// Leaves `Listening` after a failed bind, honouring a stop requested meanwhile.
    fn release_failed_bind(&self) -> LifecycleState {
        let mut released = LifecycleState::Constructed;
        self.state.send_modify(|state| {
            if *self.stop_requested.borrow() {
                released = LifecycleState::Stopped;
            }
            *state = released;
        });
        released
    }

    async fn set_health(&self, status: ServingStatus) {
        let mut health = self.health.clone();
        for name in &self.names {
            health.set_service_status(name, status).await;
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| Error::Bind { addr, source })?;
    Ok((listener, local_addr))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::server::ServiceRegistrar;

    fn server() -> GrpcServer {
        GrpcServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(5),
            InterceptorChain::new(),
            ServiceRegistrar::new().finish(),
        )
    }

    #[tokio::test]
    async fn stop_before_run_is_terminal() {
        let server = server();
        assert_eq!(server.state(), LifecycleState::Constructed);

        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);

        server.stop().await;
        assert!(matches!(server.run().await, Err(Error::AlreadyStopped)));
        assert_eq!(server.wait_serving().await, None);
    }

    #[test]
    fn settings_drive_the_chain() {
        let mut settings = crate::server::ServerConfig::default().grpc;
        settings.port = 0;
        settings.request_logging = true;

        let bindings = ServiceRegistrar::new().finish();
        let server = GrpcServer::from_settings(&settings, bindings).unwrap();
        assert_eq!(server.addr().port(), 0);
        assert_eq!(server.chain.names(), vec!["recovery", "request_log"]);
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn failed_bind_returns_to_constructed() {
        let server = server();
        server.state.send_replace(LifecycleState::Listening);

        assert_eq!(server.release_failed_bind(), LifecycleState::Constructed);
        assert_eq!(server.state(), LifecycleState::Constructed);
    }

    #[tokio::test]
    async fn stop_during_bind_survives_a_failed_bind() {
        let server = Arc::new(server());
        server.state.send_replace(LifecycleState::Listening);

        let stopping = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.stop().await }
        });
        server
            .stop_requested
            .subscribe()
            .wait_for(|requested| *requested)
            .await
            .unwrap();

        assert_eq!(server.release_failed_bind(), LifecycleState::Stopped);
        stopping.await.unwrap();

        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(matches!(server.run().await, Err(Error::AlreadyStopped)));
    }

    #[test]
    fn states_render_lowercase() {
        assert_eq!(LifecycleState::Serving.to_string(), "serving");
        assert!(!LifecycleState::Constructed.is_running());
        assert!(LifecycleState::Listening.is_running());
    }
}
