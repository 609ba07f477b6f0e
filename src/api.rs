use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::signing::{HttpMethod, SignedAuthorization};

pub const HEADER_DATE: &str = "X-SN-Date";
pub const HEADER_PRESIGNED_AUTHORIZATION: &str = "X-SN-PreSignedAuthorization";
pub const HEADER_AUTHORIZATION: &str = "Authorization";

/// Standard `{success, code, message, data}` response wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// The request never received a server answer.
    #[error("{0}")]
    Transport(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid JSON response: {0}")]
    Decode(String),
    /// Well-formed reply that reports failure or lacks expected fields.
    #[error("{}", unsuccessful_text(.message, .body))]
    Unsuccessful {
        message: Option<String>,
        body: String,
    },
}

fn unsuccessful_text(message: &Option<String>, body: &str) -> String {
    match message {
        Some(msg) if !msg.is_empty() => msg.clone(),
        _ => body.to_string(),
    }
}

/// Decode an envelope whose `data` must be present and whose `success` must be true.
pub fn decode_success<T: DeserializeOwned>(value: &Value) -> Result<T, ApiError> {
    let envelope: ApiResponse<T> =
        serde_json::from_value(value.clone()).map_err(|_| unsuccessful(value, None))?;
    if !envelope.success {
        return Err(unsuccessful(value, envelope.message));
    }
    envelope.data.ok_or_else(|| unsuccessful(value, envelope.message))
}

/// `success` flag of an envelope, tolerating a missing `data`.
pub fn is_success(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool).unwrap_or(false)
}

fn unsuccessful(value: &Value, message: Option<String>) -> ApiError {
    ApiError::Unsuccessful {
        message,
        body: value.to_string(),
    }
}

/// Where the authorization travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// Proof for a different SolarNet URL, forwarded by the relay.
    PreSigned,
    /// Authorization for this request itself.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub auth: SignedAuthorization,
    pub style: AuthStyle,
}

impl SignedRequest {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let auth_header = match self.style {
            AuthStyle::PreSigned => HEADER_PRESIGNED_AUTHORIZATION,
            AuthStyle::Direct => HEADER_AUTHORIZATION,
        };
        vec![
            (HEADER_DATE, self.auth.date_header.clone()),
            (auth_header, self.auth.header.clone()),
        ]
    }
}

/// Upper bound on one request, so a hung stop cannot hold up the reset.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes signed requests and returns parsed JSON.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self { client })
    }

    pub async fn execute(&self, request: &SignedRequest) -> Result<Value, ApiError> {
        info!("Requesting {} {}", request.method.as_str(), request.url);
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        builder = builder.header("Accept", "application/json");
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        debug!(status = status.as_u16(), "response body: {}", body);

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
