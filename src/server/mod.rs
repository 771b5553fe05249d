/// Server configuration.
pub mod config;

/// Middleware wrapped around every call.
pub mod interceptor;

/// Run/stop lifecycle of the gRPC listener.
pub mod lifecycle;

/// Binding of capabilities onto gRPC services.
pub mod registrar;

pub use config::{GrpcSettings, MetricsSettings, ServerConfig};
pub use interceptor::InterceptorChain;
pub use lifecycle::{GrpcServer, LifecycleState};
pub use registrar::{ServiceBindings, ServiceRegistrar};
