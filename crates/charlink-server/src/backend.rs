//! Outbound integrations chosen from configuration.

use std::sync::Arc;

use async_trait::async_trait;
use charlink_net::{
    BackendError, CompletionStream, GeminiClient, GeminiConfig, GenerativeBackend, ImageHost,
    ImgBbUploader,
};
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Stands in when no Gemini key is configured.  Conversations still load
/// and user messages are still stored; replies fail with a configuration
/// error.
pub struct MissingBackend;

#[async_trait]
impl GenerativeBackend for MissingBackend {
    async fn complete(&self, _prompt: &str) -> Result<String, BackendError> {
        Err(BackendError::NotConfigured("GEMINI_API_KEY"))
    }

    async fn complete_streaming(&self, _prompt: &str) -> Result<CompletionStream, BackendError> {
        Err(BackendError::NotConfigured("GEMINI_API_KEY"))
    }
}

pub fn generative_backend(config: &ServerConfig) -> anyhow::Result<Arc<dyn GenerativeBackend>> {
    let Some(api_key) = config.gemini_api_key.clone() else {
        warn!("GEMINI_API_KEY not set, persona replies are disabled");
        return Ok(Arc::new(MissingBackend));
    };

    let mut gemini = GeminiConfig::new(api_key);
    gemini.model = config.gemini_model.clone();
    gemini.base_url = config.gemini_base_url.clone();
    let client = GeminiClient::new(gemini)?;
    info!(model = client.model(), "Gemini backend ready");
    Ok(Arc::new(client))
}

pub fn image_host(config: &ServerConfig) -> anyhow::Result<Option<Arc<dyn ImageHost>>> {
    let Some(api_key) = config.imgbb_api_key.clone() else {
        warn!("IMGBB_API_KEY not set, character creation is disabled");
        return Ok(None);
    };
    Ok(Some(Arc::new(ImgBbUploader::new(api_key)?)))
}
