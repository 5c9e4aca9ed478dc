use novelgate_core::LanguageModelError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    /// Rate limiting is reported by status code or, for some gateways, only
    /// in the body.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            AdapterError::HttpStatus { status, body } => {
                let lower = body.to_ascii_lowercase();
                *status == StatusCode::TOO_MANY_REQUESTS
                    || lower.contains("quota")
                    || lower.contains("rate limit")
            }
            _ => false,
        }
    }
}

impl From<AdapterError> for LanguageModelError {
    fn from(err: AdapterError) -> Self {
        LanguageModelError::new(err)
    }
}
