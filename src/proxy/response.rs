//! Prometheus API envelope handling and proxy-originated error responses.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// `errorType` value stamped on every error envelope the proxy emits.
const PROXY_ERROR_TYPE: &str = "prom-label-proxy";

/// The JSON envelope wrapping Prometheus API v1 responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

/// An error the proxy reports to the client, with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    /// Render the Prometheus-style error envelope for this error.
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = serde_json::to_vec(&serde_json::json!({
            "status": "error",
            "errorType": PROXY_ERROR_TYPE,
            "error": self.message,
        }))
        .expect("error envelope serializes");
        body.push(b'\n');
        body
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Unwrap a Prometheus API envelope, pass `data` through `process`, and
/// re-encode the whole envelope. Any decoding failure is a 502 since the
/// upstream broke the API contract.
pub fn modify_api_response(
    body: &[u8],
    process: impl FnOnce(Value) -> Result<Value, ApiError>,
) -> Result<Vec<u8>, ApiError> {
    let mut envelope: ApiResponse = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_gateway(format!("can't decode API response: {}", e)))?;
    if envelope.status != "success" {
        return Err(ApiError::bad_gateway(format!(
            "unexpected response status: {:?}",
            envelope.status
        )));
    }

    let data = envelope.data.take().unwrap_or(Value::Null);
    envelope.data = Some(process(data)?);

    let mut out = serde_json::to_vec(&envelope)
        .map_err(|e| ApiError::bad_gateway(format!("can't encode API response: {}", e)))?;
    out.push(b'\n');
    Ok(out)
}
