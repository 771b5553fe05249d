//! Middleware applied to every call before it reaches a service.
//!
//! The chain is fixed when the server is built:
//!
//! ```text
//! RecoveryLayer → [request log: TraceLayer] → gRPC routes → handler
//! ```
//!
//! Recovery is always the outermost layer so that a panic anywhere below it, the logging layer
//! included, turns into a single `INTERNAL` status instead of tearing down the connection.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http::{HeaderValue, Request, Response};
use metrics::counter;
use tonic::body::BoxBody;
use tonic::codegen::{empty_body, StdError};
use tonic::Code;
use tower::layer::util::{Identity, Stack};
use tower::util::{Either, MapResponseLayer};
use tower::{Layer, Service, ServiceBuilder};
use tower_http::classify::{GrpcEosErrorsAsFailures, GrpcErrorsAsFailures, SharedClassifier};
use tower_http::trace::{MakeSpan, OnRequest, OnResponse, ResponseBody, TraceLayer};
use tracing::{error, info, info_span, Span};

/// Message sent to callers whose call panicked.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

const GRPC_CONTENT_TYPE: &str = "application/grpc";

const RECOVERY: &str = "recovery";
const REQUEST_LOG: &str = "request_log";

type TracedBody = ResponseBody<BoxBody, GrpcEosErrorsAsFailures, (), (), ()>;
type UntraceBody = fn(Response<TracedBody>) -> Response<BoxBody>;
type GrpcClassifier = SharedClassifier<GrpcErrorsAsFailures>;

/// Request logging: a gRPC [`TraceLayer`] whose response body is boxed back into [`BoxBody`].
pub type RequestLogLayer = Stack<
    TraceLayer<GrpcClassifier, CallSpan, LogRequest, LogResponse, (), (), ()>,
    MapResponseLayer<UntraceBody>,
>;

/// Layer stack produced by [`InterceptorChain::layer`].
pub type ChainLayer = Stack<Either<RequestLogLayer, Identity>, Stack<RecoveryLayer, Identity>>;

/// Builder for the ordered middleware chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterceptorChain {
    request_logging: bool,
}

impl InterceptorChain {
    /// Chain with recovery only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables per-call request/response logging.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    /// Whether request/response logging is enabled.
    pub fn request_logging(&self) -> bool {
        self.request_logging
    }

    /// Interceptor names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = vec![RECOVERY];
        if self.request_logging {
            names.push(REQUEST_LOG);
        }
        names
    }

    /// Builds the tower layer installed on the server.
    pub fn layer(&self) -> ChainLayer {
        ServiceBuilder::new()
            .layer(RecoveryLayer)
            .option_layer(self.request_logging.then(request_log_layer))
            .into_inner()
    }
}

fn request_log_layer() -> RequestLogLayer {
    let trace = TraceLayer::new_for_grpc()
        .make_span_with(CallSpan)
        .on_request(LogRequest)
        .on_response(LogResponse)
        .on_body_chunk(())
        .on_eos(())
        .on_failure(());
    Stack::new(trace, MapResponseLayer::new(untrace_body as UntraceBody))
}

fn untrace_body(response: Response<TracedBody>) -> Response<BoxBody> {
    response.map(tonic::body::boxed)
}

/// Opens one span per call, carrying the gRPC method path.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallSpan;

impl<B> MakeSpan<B> for CallSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        info_span!("grpc_call", method = %request.uri().path())
    }
}

/// Logs the arrival of a call.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRequest;

impl<B> OnRequest<B> for LogRequest {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        info!(method = %request.uri().path(), "request received");
    }
}

/// Logs the gRPC status and latency of a call once its headers are sent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogResponse;

impl<B> OnResponse<B> for LogResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        info!(
            status = response_status(response),
            elapsed_ms = latency.as_millis() as u64,
            "response sent"
        );
    }
}

/// Status carried in the headers of a trailers-only response, `"0"` otherwise.
fn response_status<B>(response: &Response<B>) -> &str {
    response
        .headers()
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0")
}

/// Converts panics into `INTERNAL` statuses.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

/// Service produced by [`RecoveryLayer`].
#[derive(Clone, Debug)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: http_body::Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<StdError>,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let method = req.uri().path().to_string();
        counter!("grpc.requests", "method" => method.clone()).increment(1);

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(future) => future,
            Err(payload) => {
                let response = recover(&method, payload);
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result.map(|response| response.map(tonic::body::boxed)),
                Err(payload) => Ok(recover(&method, payload)),
            }
        })
    }
}

fn recover(method: &str, payload: Box<dyn Any + Send>) -> Response<BoxBody> {
    let panic = panic_message(payload.as_ref());
    error!(method, panic = %panic, "recovering from a panic");
    counter!("grpc.panics").increment(1);

    let mut response = Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(GRPC_CONTENT_TYPE),
    );
    headers.insert("grpc-status", HeaderValue::from(Code::Internal as i32));
    headers.insert(
        "grpc-message",
        HeaderValue::from_static(INTERNAL_ERROR_MESSAGE),
    );
    response
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "non-string panic payload".to_string()
    }
}
