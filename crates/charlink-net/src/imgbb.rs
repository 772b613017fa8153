//! ImgBB avatar uploads.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::multipart::Form;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ImageHostError;

pub const DEFAULT_UPLOAD_URL: &str = "https://api.imgbb.com/1/upload";

/// Stores an image and hands back a public URL for it.
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn upload(&self, image: Bytes) -> Result<String, ImageHostError>;
}

pub struct ImgBbUploader {
    client: Client,
    api_key: String,
    upload_url: String,
}

impl ImgBbUploader {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ImageHostError> {
        Self::with_url(api_key, DEFAULT_UPLOAD_URL)
    }

    pub fn with_url(
        api_key: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Result<Self, ImageHostError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            upload_url: upload_url.into(),
        })
    }
}

#[async_trait]
impl ImageHost for ImgBbUploader {
    async fn upload(&self, image: Bytes) -> Result<String, ImageHostError> {
        if image.is_empty() {
            return Err(ImageHostError::EmptyImage);
        }

        let form = Form::new()
            .text("key", self.api_key.clone())
            .text("image", BASE64.encode(&image));

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "image upload failed");
            return Err(ImageHostError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let url = display_url(&body)?;
        debug!(size = image.len(), url = %url, "image uploaded");
        Ok(url)
    }
}

#[derive(Deserialize)]
struct ImgBbResponse {
    data: Option<ImgBbData>,
    #[serde(default)]
    success: bool,
}

#[derive(Deserialize)]
struct ImgBbData {
    display_url: String,
}

fn display_url(body: &str) -> Result<String, ImageHostError> {
    let response: ImgBbResponse = serde_json::from_str(body)?;
    match response.data {
        Some(data) if response.success => Ok(data.display_url),
        _ => Err(ImageHostError::Rejected),
    }
}
