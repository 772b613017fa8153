use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use charlink_client::{ConversationError, CreationError, ErrorKind, FeedError};
use charlink_prompt::PromptError;
use charlink_shared::ValidationError;
use charlink_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or empty x-user-id header")]
    MissingUser,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("{0} is not configured on this server")]
    Unavailable(&'static str),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Creation(#[from] CreationError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for ServerError {
    fn from(e: ValidationError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl From<PromptError> for ServerError {
    fn from(e: PromptError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::MissingUser => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Conversation(e) => match (e, e.kind()) {
                (_, ErrorKind::Validation) => StatusCode::BAD_REQUEST,
                (ConversationError::Generation(_), _) | (_, ErrorKind::EmptyResult) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Creation(e) => match e {
                CreationError::Validation(ValidationError::TooLarge { .. }) => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                CreationError::Validation(_) => StatusCode::BAD_REQUEST,
                CreationError::Upload(_) => StatusCode::BAD_GATEWAY,
                CreationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ServerError::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ServerError::Feed(_) | ServerError::Store(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Storage and internal details stay in the logs.
        let message = match &self {
            ServerError::Store(_) if status.is_server_error() => "Storage error".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let ServerError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
