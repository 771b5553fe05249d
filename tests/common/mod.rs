//! Common test utilities shared across integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::Channel;
use userhub::{App, GrpcServer, InterceptorChain, ServerConfig, ServiceRegistrar};

/// Initialize test tracing (call once at the beginning of tests).
///
/// Only logs from the library are shown, filtering out HTTP/2 and tower noise.
/// Subsequent calls are safe and will be ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new("userhub=debug");

    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// A server running on an ephemeral port.
pub struct TestServer {
    pub server: Arc<GrpcServer>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<userhub::Result<()>>,
}

impl TestServer {
    /// `http://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Opens a channel to the server.
    pub async fn channel(&self) -> Channel {
        Channel::from_shared(self.url())
            .unwrap()
            .connect()
            .await
            .expect("Failed to connect to server")
    }

    /// Stops the server and returns the outcome of its `run` call.
    pub async fn shutdown(self) -> userhub::Result<()> {
        self.server.stop().await;
        self.handle.await.expect("server task panicked")
    }
}

/// Loopback address with an ephemeral port.
pub fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Builds a server on an ephemeral port around the given registrations.
pub fn build_server(registrar: ServiceRegistrar) -> GrpcServer {
    GrpcServer::new(
        any_port(),
        Duration::from_secs(10),
        InterceptorChain::new().with_request_logging(true),
        registrar.finish(),
    )
}

/// Spawns `run` and waits until the server accepts calls.
pub async fn spawn_server(server: GrpcServer) -> TestServer {
    let server = Arc::new(server);
    let handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let addr = tokio::time::timeout(Duration::from_secs(5), server.wait_serving())
        .await
        .expect("server did not start in time")
        .expect("server stopped before serving");

    TestServer {
        server,
        addr,
        handle,
    }
}

/// Starts a server with the given registrations.
pub async fn start_with(registrar: ServiceRegistrar) -> TestServer {
    init_tracing();
    spawn_server(build_server(registrar)).await
}

/// Starts the fully wired application on an ephemeral port with in-memory storage.
pub async fn start_app() -> TestServer {
    init_tracing();

    let mut config = ServerConfig::default();
    config.grpc.port = 0;
    config.grpc.request_logging = true;

    let app = App::new(&config).await.expect("Failed to build application");
    let server = app.server();
    let handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    let addr = tokio::time::timeout(Duration::from_secs(5), server.wait_serving())
        .await
        .expect("server did not start in time")
        .expect("server stopped before serving");

    TestServer {
        server,
        addr,
        handle,
    }
}
