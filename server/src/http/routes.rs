use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, rejection::JsonRejection, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use batchline_common::Payload;

use super::{ApiResponse, GatewayError, GatewayState};

const IMAGE_FIELD: &str = "img_bytes";
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub async fn server_status(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    match state.client.server_status().await {
        Ok(status) => Json(serde_json::to_value(status).unwrap_or_else(|_| json!({}))),
        Err(e) => {
            tracing::warn!("Failed to fetch server status: {}", e);
            Json(json!({}))
        }
    }
}

pub async fn client_status(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(serde_json::to_value(state.client.status()).unwrap_or_else(|_| json!({})))
}

pub async fn encode_json(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Json<ApiResponse> {
    let result = match body {
        Ok(Json(value)) => state.call(Payload::from(value)).await,
        Err(_) => Err(GatewayError::BadRequest),
    };
    respond(result, false)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TextInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct EncodeTextRequest {
    pub text: TextInput,
}

pub async fn encode_text(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<EncodeTextRequest>, JsonRejection>,
) -> Json<ApiResponse> {
    let result = match body {
        Ok(Json(request)) => {
            let value = match request.text {
                TextInput::One(text) => Value::String(text),
                TextInput::Many(texts) => json!(texts),
            };
            state.call(Payload::from(value)).await
        }
        Err(_) => Err(GatewayError::BadRequest),
    };
    respond(result, false)
}

/// Multipart image upload. The size check runs before any body is read.
pub async fn encode_img_bytes(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Json<ApiResponse> {
    respond(upload_image(&state, &headers, multipart).await, true)
}

/// Unversioned upload route: same checks, but every failure is code `1`.
pub async fn encode_img_bytes_legacy(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Json<ApiResponse> {
    match upload_image(&state, &headers, multipart).await {
        Ok(data) => ApiResponse::success(data, false),
        Err(e) => {
            tracing::error!("Error when handling HTTP request: {}", e);
            ApiResponse::legacy_failure(&e)
        }
    }
}

async fn upload_image(
    state: &GatewayState,
    headers: &HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Value, GatewayError> {
    check_content_length(headers, state.config.max_upload_bytes)?;
    let mut multipart = multipart.map_err(|_| GatewayError::BadRequest)?;
    let bytes = read_image_field(&mut multipart, state.config.max_upload_bytes).await?;
    let content_type = sniff_image(&bytes).ok_or(GatewayError::UnsupportedInputFile)?;

    state
        .call(Payload::from(json!({
            "content_type": content_type,
            "bytes": hex::encode(&bytes),
        })))
        .await
}

fn respond(result: Result<Value, GatewayError>, v1: bool) -> Json<ApiResponse> {
    match result {
        Ok(data) => ApiResponse::success(data, v1),
        Err(e) => {
            if e.error_code(v1) == 500 || e.error_code(v1) == 1 {
                tracing::error!("Error when handling HTTP request: {}", e);
            }
            ApiResponse::failure(&e, v1)
        }
    }
}

/// Reject uploads with no `Content-Length` or one at or above `max`.
pub fn check_content_length(headers: &HeaderMap, max: u64) -> Result<u64, GatewayError> {
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(GatewayError::PayloadTooLarge(max))?;
    if length >= max {
        return Err(GatewayError::PayloadTooLarge(max));
    }
    Ok(length)
}

async fn read_image_field(multipart: &mut Multipart, max: u64) -> Result<Vec<u8>, GatewayError> {
    loop {
        let field = multipart.next_field().await.map_err(|e| multipart_error(e.status(), max))?;
        let Some(field) = field else {
            return Err(GatewayError::BadRequest);
        };
        if field.name() == Some(IMAGE_FIELD) {
            let bytes = field.bytes().await.map_err(|e| multipart_error(e.status(), max))?;
            return Ok(bytes.to_vec());
        }
    }
}

fn multipart_error(status: StatusCode, max: u64) -> GatewayError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge(max)
    } else {
        GatewayError::BadRequest
    }
}

/// MIME type of a JPEG or PNG image, from its leading bytes.
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(JPEG_MAGIC) {
        Some("image/jpeg")
    } else if bytes.starts_with(PNG_MAGIC) {
        Some("image/png")
    } else {
        None
    }
}
