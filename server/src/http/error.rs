//! Gateway errors and their `error_code` mapping.

use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use batchline_client::ClientError;
use batchline_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Wrong request parameter")]
    BadRequest,

    #[error("Wrong input file type, only accept jpg or png image")]
    UnsupportedInputFile,

    #[error("Content-Length must be present and below {0} bytes")]
    PayloadTooLarge(u64),

    #[error("Too many concurrent requests, gave up after {0} retries")]
    CapacityExceeded(u32),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest => ErrorKind::Protocol,
            Self::UnsupportedInputFile => ErrorKind::UnsupportedInputFile,
            Self::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            Self::CapacityExceeded(_) => ErrorKind::ConcurrencyExceeded,
            Self::Client(e) => e.kind(),
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Numeric code reported in the response body.
    ///
    /// Only the v1 routes distinguish internal failures with `500`; every
    /// other failure that is not an input problem reports `1`.
    pub fn error_code(&self, v1: bool) -> i32 {
        match self.kind() {
            ErrorKind::Protocol | ErrorKind::UnsupportedInputFile => 400,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::Internal if v1 => 500,
            _ => 1,
        }
    }

    fn message(&self, v1: bool) -> String {
        if self.error_code(v1) == 500 {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Body of every encode response; always sent with HTTP 200.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub error_code: i32,
    pub error_message: String,
    pub data: Value,
}

impl ApiResponse {
    pub fn success(data: Value, v1: bool) -> Json<Self> {
        let error_message = if v1 { "Successful." } else { "Success." };
        Json(Self {
            error_code: 0,
            error_message: error_message.to_string(),
            data,
        })
    }

    pub fn failure(err: &GatewayError, v1: bool) -> Json<Self> {
        Json(Self {
            error_code: err.error_code(v1),
            error_message: err.message(v1),
            data: json!({}),
        })
    }

    /// Failure body of the unversioned upload route, which reports every
    /// failure with code `1`.
    pub fn legacy_failure(err: &GatewayError) -> Json<Self> {
        Json(Self {
            error_code: 1,
            error_message: err.to_string(),
            data: json!({}),
        })
    }
}
