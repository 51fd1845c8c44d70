//! HTTP helpers for API Lambda functions.

use lambda_http::{Body, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;
use validator::Validate;

use crate::Error;

/// Standard API response wrapper.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Create a JSON response with the given status code and body.
pub fn json_response<T: Serialize>(status: u16, body: &T) -> Result<Response<Body>, lambda_http::Error> {
    let json = serde_json::to_string(body)?;
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(json))?)
}

pub fn error_response(status: u16, message: impl Into<String>) -> Result<Response<Body>, lambda_http::Error> {
    json_response(status, &ApiResponse::<()>::error(message))
}

/// Map a library error onto an API response. Server-side failures are logged
/// and reported without internal detail.
pub fn error_to_response(err: &Error) -> Result<Response<Body>, lambda_http::Error> {
    let status = err.status_code();
    if status >= 500 {
        error!(error = %err, "Request failed");
    }
    error_response(status, err.public_message())
}

/// Parse and validate a JSON request body.
///
/// Returns `Ok(Err(response))` with a 400 response when the body is not valid
/// JSON for `T` or fails its validation rules.
pub fn parse_json_body<T: DeserializeOwned + Validate>(
    body: &Body,
) -> Result<Result<T, Response<Body>>, lambda_http::Error> {
    let parsed: T = match serde_json::from_slice(body.as_ref()) {
        Ok(parsed) => parsed,
        Err(e) => return Ok(Err(error_response(400, format!("Invalid request body: {}", e))?)),
    };

    if let Err(e) = parsed.validate() {
        return Ok(Err(error_response(400, format!("Invalid request: {}", e))?));
    }

    Ok(Ok(parsed))
}

/// Parse the request body, returning early with a 400 response on failure.
///
/// ```ignore
/// let request: TriggerRunRequest = parse_body!(event.body());
/// ```
#[macro_export]
macro_rules! parse_body {
    ($body:expr) => {
        match $crate::http::parse_json_body($body)? {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        }
    };
}
