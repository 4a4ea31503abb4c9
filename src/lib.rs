//! HerbVision: point a camera at plants and hear when the one you asked for
//! is in view.
//!
//! A name is resolved to visual features (cache first, Gemini otherwise), a
//! cheap on-device detector gates camera frames, and gated frames are
//! verified remotely at most once per cooldown window. Verdicts drive a
//! confidence tone, spoken summary and a box overlay.

pub mod camera;
pub mod config;
pub mod description;
pub mod detection_loop;
pub mod error;
pub mod feature_store;
pub mod feedback;
pub mod gate;
pub mod gemini;
pub mod logging;
pub mod overlay;
pub mod session;
pub mod tone;
pub mod tts;
pub mod types;
pub mod vision;

#[cfg(feature = "vision")]
pub mod detector;
