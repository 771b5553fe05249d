//! Authentication, user directory, and follow-graph gRPC service.
//!
//! The crate is split along the boundaries the server is composed from:
//!
//! - [`capability`]: the traits the RPC layer talks to ([`Authenticator`], [`UserDirectory`],
//!   [`FollowGraph`]) together with the per-call [`CallContext`].
//! - [`server`]: the interceptor chain, the service registrar, and the [`GrpcServer`] lifecycle
//!   manager that owns the listener.
//! - [`services`] and [`storage`]: reference implementations of the capabilities and of the
//!   persistence collaborator they share.
//! - [`app`]: the composition root wiring everything together.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use userhub::{App, ServerConfig};
//!
//! # async fn run() -> userhub::Result<()> {
//! let app = App::new(&ServerConfig::default()).await?;
//! let server = app.server();
//!
//! let handle = tokio::spawn({
//!     let server = Arc::clone(&server);
//!     async move { server.run().await }
//! });
//!
//! server.stop().await;
//! handle.await.expect("server task")?;
//! # Ok(())
//! # }
//! ```

/// Composition root.
pub mod app;

/// Capability contracts and the per-call context.
pub mod capability;

/// Error types.
pub mod error;

/// Domain values shared by every capability.
pub mod models;

/// RPC server assembly and lifecycle.
pub mod server;

/// Reference capability implementations.
pub mod services;

/// Persistence collaborator.
pub mod storage;

/// Generated protobuf and gRPC code.
pub mod proto {
    /// `auth.Auth` service.
    pub mod auth {
        tonic::include_proto!("auth");
    }

    /// `userinfo.UserInfo` service.
    pub mod userinfo {
        tonic::include_proto!("userinfo");
    }

    /// `follow.FollowGraph` service.
    pub mod follow {
        tonic::include_proto!("follow");
    }
}

pub use app::App;
pub use capability::{Authenticator, CallContext, FollowGraph, UserDirectory};
pub use error::{Error, Result, ServiceError, StorageError};
pub use models::{Credentials, TokenPair, User, UserId};
pub use server::{GrpcServer, InterceptorChain, LifecycleState, ServerConfig, ServiceRegistrar};
