//! Error taxonomy.
//!
//! Every remote failure either halts the session (description, camera) or
//! skips one detection cycle (vision). Nothing here is retried.

use thiserror::Error;

use crate::camera::CameraError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Gemini API key missing; set GEMINI_API_KEY or HERBVISION__GEMINI__API_KEY")]
    MissingApiKey,
    #[error("configuration could not be loaded: {0}")]
    Load(#[from] config::ConfigError),
    #[error("HTTP client could not be built: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// The local gate model could not be loaded. Fatal for the process.
#[derive(Debug, Error)]
#[error("local detector model '{path}' failed to load: {reason}")]
pub struct ModelLoadError {
    pub path: String,
    pub reason: String,
}

impl ModelLoadError {
    pub const USER_MESSAGE: &'static str = "无法加载本地 AI 模型。请检查模型文件后重新启动。";
}

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reply carried no text")]
    EmptyReply,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("feature store: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("feature store: {0}")]
    Io(#[from] std::io::Error),
    #[error("feature store value could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("Failed to parse herb details from AI response.")]
    Parse { raw: String },
    #[error("description request failed: {0}")]
    Remote(#[from] GeminiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("AI response was not valid JSON: {0}")]
    InvalidResponse(String),
    #[error("vision request failed: {0}")]
    Remote(#[from] GeminiError),
    #[error("frame could not be encoded: {0}")]
    Encode(#[from] image::ImageError),
}

/// Session operation failures. `Rejected` leaves the stage untouched.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Description(#[from] DescriptionError),
    #[error("{message}")]
    CameraAccess {
        message: &'static str,
        #[source]
        last_error: Option<CameraError>,
    },
    #[error("{0}")]
    Rejected(&'static str),
}
