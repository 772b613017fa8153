use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;

/// Text chunks in arrival order.  The stream ends after the last chunk or
/// after the first error.
pub type CompletionStream = BoxStream<'static, Result<String, BackendError>>;

/// Produces a persona reply for a fully rendered prompt.
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// The whole completion.  Implementations return
    /// [`BackendError::EmptyResponse`] rather than a blank string.
    async fn complete(&self, prompt: &str) -> Result<String, BackendError>;

    /// The completion as a finite stream of chunks.
    async fn complete_streaming(&self, prompt: &str) -> Result<CompletionStream, BackendError>;
}
