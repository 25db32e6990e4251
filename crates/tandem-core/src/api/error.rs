use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Agent returned status {code}: {details}")]
    Status { code: u16, details: String },

    #[error("Stream error: {details}")]
    Stream { details: String },

    #[error("Invalid request: {details}")]
    InvalidRequest { details: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn stream(details: impl Into<String>) -> Self {
        Self::Stream {
            details: details.into(),
        }
    }
}
