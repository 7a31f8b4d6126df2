//! HTTP gateway in front of the WebSocket ingress.
//!
//! Every route shares one [`Client`] connected to the ingress. Encode routes
//! always answer HTTP 200 with an [`ApiResponse`] body; status routes return
//! the status objects as plain JSON.

mod error;
pub mod routes;
mod slots;

pub use error::{ApiResponse, GatewayError};
pub use slots::SlotPool;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use batchline_client::Client;
use batchline_common::Payload;

use crate::config::HttpConfig;
use crate::logging::request_logger;

/// Adds routes to the gateway at startup.
///
/// Implemented for any `Fn(Router, Client) -> Router`, so a closure works.
pub trait RouteExtension: Send + Sync {
    fn extend(&self, router: Router, client: Client) -> Router;
}

impl<F> RouteExtension for F
where
    F: Fn(Router, Client) -> Router + Send + Sync,
{
    fn extend(&self, router: Router, client: Client) -> Router {
        self(router, client)
    }
}

/// State shared by the gateway routes.
pub struct GatewayState {
    pub client: Client,
    pub slots: SlotPool,
    pub config: HttpConfig,
}

impl GatewayState {
    pub fn new(client: Client, config: HttpConfig) -> Self {
        let slots = SlotPool::new(
            config.max_connect,
            config.concurrent_retry_num,
            Duration::from_secs_f64(config.concurrent_retry_gap_secs.max(0.0)),
        );
        Self {
            client,
            slots,
            config,
        }
    }

    /// Run one encode call under a gateway slot.
    pub async fn call(&self, payload: Payload) -> Result<Value, GatewayError> {
        let _permit = self.slots.acquire().await?;
        let output = self.client.encode(payload).await?;
        Ok(payload_to_json(output))
    }
}

/// JSON view of a reply; arrays are reported with hex-encoded data.
pub fn payload_to_json(payload: Payload) -> Value {
    match payload {
        Payload::Object(value) => value,
        Payload::Array(arr) => json!({
            "dtype": arr.dtype().name(),
            "shape": arr.shape(),
            "data": hex::encode(arr.data()),
        }),
    }
}

/// Build the gateway router, then let each extension add its routes.
pub fn router(state: Arc<GatewayState>, extensions: &[Arc<dyn RouteExtension>]) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_bytes).unwrap_or(usize::MAX);
    let cors = cors_layer(&state.config.cors_origins);

    let mut app = Router::new()
        .route("/status/server", get(routes::server_status))
        .route("/status/client", get(routes::client_status))
        .route("/encode_json", post(routes::encode_json))
        .route("/encode_text", post(routes::encode_text))
        .route(
            "/encode_img_bytes",
            post(routes::encode_img_bytes_legacy).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/v1/encode_img_bytes",
            post(routes::encode_img_bytes).layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state.clone());

    for extension in extensions {
        app = extension.extend(app, state.client.clone());
    }

    app.layer(middleware::from_fn(request_logger)).layer(cors)
}

/// `*` allows any origin; otherwise a comma-separated list of origins.
pub fn cors_layer(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let list: Vec<HeaderValue> = origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(list))
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchline_common::{DType, NdArray};

    #[test]
    fn test_payload_to_json() {
        assert_eq!(payload_to_json(Payload::from(json!({"a": 1}))), json!({"a": 1}));

        let arr = NdArray::from_slice(vec![2], &[1u8, 255]).unwrap();
        let value = payload_to_json(Payload::from(arr));
        assert_eq!(value["dtype"], json!(DType::U8.name()));
        assert_eq!(value["shape"], json!([2]));
        assert_eq!(value["data"], json!("01ff"));
    }
}
