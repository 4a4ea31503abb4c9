//! Gemini `generateContent` client shared by the description and vision services.
//!
//! Text and inline-image parts go out in one request; replies are read from
//! the first candidate's text parts.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::GeminiConfig;
use crate::error::{ConfigError, GeminiError};

// ─── Request / response types ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_mime_type: String,
    pub response_schema: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Debug, Deserialize)]
struct ReplyPart {
    text: Option<String>,
}

impl GenerateRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![Part::Text { text: prompt.into() }],
            }],
            generation_config: None,
        }
    }

    /// Image part first, then the prompt, answered as schema-checked JSON.
    pub fn jpeg_with_schema(jpeg: &[u8], prompt: impl Into<String>, schema: Value) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![
                    Part::InlineData {
                        inline_data: Blob {
                            mime_type: "image/jpeg".into(),
                            data: B64.encode(jpeg),
                        },
                    },
                    Part::Text { text: prompt.into() },
                ],
            }],
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json".into(),
                response_schema: schema,
            }),
        }
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
    text_model: String,
    vision_model: String,
}

impl GeminiClient {
    /// Fails when no API key is configured.
    pub fn from_config(cfg: &GeminiConfig) -> Result<Self, ConfigError> {
        let api_key = cfg.require_api_key()?.to_string();
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            http,
            api_key,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            text_model: cfg.text_model.clone(),
            vision_model: cfg.vision_model.clone(),
        })
    }

    pub fn text_model(&self) -> &str {
        &self.text_model
    }

    pub fn vision_model(&self) -> &str {
        &self.vision_model
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    /// Send one request and return the concatenated reply text.
    pub async fn generate(&self, model: &str, request: &GenerateRequest) -> Result<String, GeminiError> {
        let url = self.endpoint(model);
        debug!("Gemini call → {}", url);

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(300).collect();
            return Err(GeminiError::Status { status, body: truncated });
        }

        let data: GenerateResponse = resp.json().await?;
        reply_text(data).ok_or(GeminiError::EmptyReply)
    }
}

fn reply_text(data: GenerateResponse) -> Option<String> {
    let text: String = data
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    (!text.is_empty()).then_some(text)
}
