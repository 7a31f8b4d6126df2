use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Response header carrying the handling time in seconds.
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Middleware that logs HTTP requests at INFO level and reports the handling
/// time in the `X-Process-Time` header.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", duration.as_secs_f64())) {
        response.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "HTTP request"
    );

    response
}
