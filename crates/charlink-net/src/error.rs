use thiserror::Error;

/// Errors from the generative backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// The API reported an error in an otherwise successful response.
    #[error("Backend error: {0}")]
    Remote(String),

    /// The prompt was refused by the backend's safety filter.
    #[error("Prompt blocked: {0}")]
    Blocked(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Empty response received")]
    EmptyResponse,

    #[error("Backend not configured: {0}")]
    NotConfigured(&'static str),
}

/// Errors from the image host.
#[derive(Error, Debug)]
pub enum ImageHostError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP Error: {0}")]
    Status(u16),

    #[error("Image host returned success=false")]
    Rejected,

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Image is empty")]
    EmptyImage,
}
