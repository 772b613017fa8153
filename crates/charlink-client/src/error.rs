use charlink_net::{BackendError, ImageHostError};
use charlink_prompt::PromptError;
use charlink_shared::ValidationError;
use charlink_store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Coarse classification shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input.  Reported before any I/O and never worth retrying as-is.
    Validation,
    /// A collaborator failed.  Retrying may help.
    Transport,
    /// The backend answered with nothing usable.
    EmptyResult,
}

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to load messages: {0}")]
    Subscribe(#[source] StoreError),

    #[error("Failed to send message: {0}")]
    Send(#[source] StoreError),

    #[error("Failed to delete message: {0}")]
    Delete(#[source] StoreError),

    #[error("AI Error: {0}")]
    Generation(#[source] BackendError),

    #[error("AI Error: Empty response received")]
    EmptyCompletion,

    #[error("Failed to save AI response: {0}")]
    SaveReply(#[source] StoreError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),
}

impl ConversationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Prompt(_) => ErrorKind::Validation,
            Self::EmptyCompletion => ErrorKind::EmptyResult,
            Self::Subscribe(_)
            | Self::Send(_)
            | Self::Delete(_)
            | Self::Generation(_)
            | Self::SaveReply(_) => ErrorKind::Transport,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Backend failures, with an explicit empty response folded into
    /// [`ConversationError::EmptyCompletion`].
    pub(crate) fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::EmptyResponse => Self::EmptyCompletion,
            other => Self::Generation(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum CreationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Image Upload Failed: {0}")]
    Upload(#[from] ImageHostError),

    #[error("Database Error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to load characters: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let validation = ConversationError::from(ValidationError::Blank("Message"));
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert_eq!(validation.to_string(), "Message cannot be empty");

        assert_eq!(
            ConversationError::from_backend(BackendError::EmptyResponse).kind(),
            ErrorKind::EmptyResult
        );
        assert_eq!(
            ConversationError::from_backend(BackendError::Remote("quota".into())).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            ConversationError::Send(StoreError::NotFound).kind(),
            ErrorKind::Transport
        );
    }
}
