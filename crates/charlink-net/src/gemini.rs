//! Gemini `generateContent` client.
//!
//! The whole prompt goes out as a single user turn.  The streaming variant
//! uses `streamGenerateContent?alt=sse` and yields each text delta as it
//! arrives.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::generative::{CompletionStream, GenerativeBackend};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            self.model,
            method
        )
    }
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, BackendError> {
        if config.api_key.trim().is_empty() {
            return Err(BackendError::NotConfigured("GEMINI_API_KEY"));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn post(&self, url: String, prompt: &str) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&GeminiRequest::single_turn(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Gemini API error");
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerativeBackend for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        let response = self.post(self.config.endpoint("generateContent"), prompt).await?;
        let body = response.text().await?;
        let text = extract_text(serde_json::from_str(&body)?)?;

        if text.trim().is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        debug!(model = %self.config.model, reply_len = text.len(), "completion received");
        Ok(text)
    }

    async fn complete_streaming(&self, prompt: &str) -> Result<CompletionStream, BackendError> {
        let url = format!("{}?alt=sse", self.config.endpoint("streamGenerateContent"));
        let response = self.post(url, prompt).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = SseLines::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(BackendError::Http(e));
                        return;
                    }
                };
                lines.push(&chunk);

                while let Some(line) = lines.next_line() {
                    match parse_sse_line(&line) {
                        Some(Ok(text)) if !text.is_empty() => {
                            yield Ok(text);
                        }
                        Some(Ok(_)) | None => {}
                        Some(Err(e)) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(Ok(text)) = parse_sse_line(&lines.finish()) {
                if !text.is_empty() {
                    yield Ok(text);
                }
            }
        };
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
}

impl<'a> GeminiRequest<'a> {
    fn single_turn(prompt: &'a str) -> Self {
        Self {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiTextPart { text: prompt }],
            }],
        }
    }
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiTextPart<'a>>,
}

#[derive(Serialize)]
struct GeminiTextPart<'a> {
    text: &'a str,
}

#[derive(Deserialize, Debug, Default)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiApiError>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
}

#[derive(Deserialize, Debug)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize, Debug)]
struct GeminiPartResponse {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiApiError {
    message: String,
}

/// Concatenated text of the first candidate.  May be empty.
fn extract_text(response: GeminiResponse) -> Result<String, BackendError> {
    if let Some(error) = response.error {
        return Err(BackendError::Remote(error.message));
    }
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(BackendError::Blocked(reason));
    }

    let text = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    Ok(text)
}

/// Splits a byte stream into lines.  Bytes are only decoded once a whole
/// line has arrived, so a character split across chunks stays intact.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left after the stream ended.
    fn finish(self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

/// One SSE line.  `None` for blank lines, comments and non-data fields.
fn parse_sse_line(line: &str) -> Option<Result<String, BackendError>> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(
        serde_json::from_str::<GeminiResponse>(data)
            .map_err(BackendError::from)
            .and_then(extract_text),
    )
}
