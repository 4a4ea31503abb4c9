/// HerbVision configuration
///
/// Loaded from herbvision.toml (working directory) with env-var overrides.
/// Env format: HERBVISION__SECTION__KEY (double underscore separators).

use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_vision_model() -> String {
    "gemini-2.5-pro".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            text_model: default_text_model(),
            vision_model: default_vision_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Device indices standing in for "rear-facing" and "any" cameras.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_environment_index")]
    pub environment_index: i32,
    #[serde(default)]
    pub fallback_index: i32,
    /// Size of the overlay surface; the frame size is used when unset.
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
}

fn default_environment_index() -> i32 {
    1
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            environment_index: default_environment_index(),
            fallback_index: 0,
            display_width: None,
            display_height: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Floor applied inside the detector before the gate sees anything.
    #[serde(default = "default_score_floor")]
    pub score_floor: f32,
}

fn default_model_path() -> String {
    "models/yolov8n.onnx".to_string()
}
fn default_input_size() -> u32 {
    640
}
fn default_score_floor() -> f32 {
    0.25
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_size: default_input_size(),
            score_floor: default_score_floor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_gate_score_threshold")]
    pub gate_score_threshold: f32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_cooldown_ms() -> u64 {
    2500
}
fn default_frame_interval_ms() -> u64 {
    16
}
fn default_gate_score_threshold() -> f32 {
    0.5
}
fn default_jpeg_quality() -> u8 {
    80
}

impl DetectionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            gate_score_threshold: default_gate_score_threshold(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_speech_lang")]
    pub speech_lang: String,
    #[serde(default = "default_true")]
    pub tone_enabled: bool,
    #[serde(default = "default_true")]
    pub speech_enabled: bool,
    #[serde(default = "default_tone_volume")]
    pub tone_volume: f32,
    /// Boxes are drawn only above this confidence percentage.
    #[serde(default = "default_display_threshold")]
    pub display_threshold: u8,
}

fn default_speech_lang() -> String {
    "zh-CN".to_string()
}
fn default_true() -> bool {
    true
}
fn default_tone_volume() -> f32 {
    0.6
}
fn default_display_threshold() -> u8 {
    10
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            speech_lang: default_speech_lang(),
            tone_enabled: true,
            speech_enabled: true,
            tone_volume: default_tone_volume(),
            display_threshold: default_display_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_store_path() -> String {
    "features.db".to_string()
}
fn default_namespace() -> String {
    "herbvisionpro".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            namespace: default_namespace(),
        }
    }
}

/// Load configuration from herbvision.toml + environment variable overrides.
///
/// Search order:
///   1. ./.env (loaded into the process environment, never required)
///   2. ./herbvision.toml
///   3. Environment variables: HERBVISION__GEMINI__API_KEY, etc.
///   4. GEMINI_API_KEY / API_KEY when no key was configured above
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let _ = dotenvy::dotenv();

    let settings = config::Config::builder()
        .add_source(config::File::with_name("herbvision").required(false))
        .add_source(
            config::Environment::with_prefix("HERBVISION")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let mut app: AppConfig = settings.try_deserialize()?;

    if app.gemini.api_key.as_deref().map_or(true, str::is_empty) {
        app.gemini.api_key = ["GEMINI_API_KEY", "API_KEY"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|k| !k.is_empty()));
    }

    Ok(app)
}

impl GeminiConfig {
    /// The credential, or the fatal startup error when it is missing.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}
