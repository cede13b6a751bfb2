use std::time::{Duration, Instant};

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use tracing::{field, Instrument, Span};
use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Axum middleware that injects `X-Request-Id` headers and wraps each
/// request in an `http_request` span.
///
/// An incoming `X-Request-Id` is reused; otherwise a new trace ID is
/// generated. The response always carries the header, and the span records
/// the response status and latency once the handler returns.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_trace_id);

    if let Ok(val) = request_id.parse() {
        request.headers_mut().insert("x-request-id", val);
    }

    let span = tracing::info_span!(
        "http_request",
        trace_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        status = field::Empty,
        latency_ms = field::Empty,
    );
    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;

    span.record("status", response.status().as_u16());
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.in_scope(|| tracing::debug!("request finished"));

    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert("x-request-id", val);
    }

    response
}

/// Span covering one long-lived terminal connection.
///
/// Opened when the connection is upgraded; [`ConnectionSpan::finish`]
/// records how it ended and how long it lasted.
#[derive(Debug)]
pub struct ConnectionSpan {
    span: Span,
    trace_id: String,
    started: Instant,
}

impl ConnectionSpan {
    pub fn open(kind: &str, session_id: &str) -> Self {
        let trace_id = generate_trace_id();
        let span = tracing::info_span!(
            "connection",
            trace_id = %trace_id,
            span_id = %generate_span_id(),
            kind = %kind,
            session_id = %session_id,
            outcome = field::Empty,
            duration_ms = field::Empty,
        );
        span.in_scope(|| tracing::info!("connection opened"));
        Self {
            span,
            trace_id,
            started: Instant::now(),
        }
    }

    /// Handle for instrumenting the connection's futures.
    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Record the outcome and duration, log the close, and return the
    /// connection's lifetime.
    pub fn finish(self, outcome: &'static str) -> Duration {
        let elapsed = self.started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        self.span.record("outcome", outcome);
        self.span.record("duration_ms", duration_ms);
        tracing::info!(parent: &self.span, outcome, duration_ms, "connection finished");
        elapsed
    }
}
