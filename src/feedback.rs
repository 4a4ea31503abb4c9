//! Feedback renderer: turns the latest verdict into a tone, speech and an
//! overlay plan.

use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::config::FeedbackConfig;
use crate::overlay::{plan_overlay, OverlayCanvas, OverlayPlan};
use crate::tone::EIGHTH_NOTE;
use crate::types::{BoundingBox, DetectionVerdict};

pub const STATUS_UPLOADING: &str = "检测到潜在目标，正在上传云端进行高精度比对...";
pub const STATUS_CLOUD_FAILED: &str = "云端比对失败，请检查网络连接。";

pub trait ToneSink: Send {
    fn play(&mut self, freq_hz: f32, duration: Duration);
}

pub trait Speaker: Send {
    fn speak(&mut self, text: &str, lang: &str);
}

/// Used when tone or speech output is disabled or unavailable.
pub struct Silent;

impl ToneSink for Silent {
    fn play(&mut self, _freq_hz: f32, _duration: Duration) {}
}

impl Speaker for Silent {
    fn speak(&mut self, _text: &str, _lang: &str) {}
}

/// Shared one-line status shown under the preview.
#[derive(Clone)]
pub struct StatusLine(Arc<watch::Sender<String>>);

impl StatusLine {
    pub fn new(initial: &str) -> Self {
        let (tx, _rx) = watch::channel(initial.to_string());
        Self(Arc::new(tx))
    }

    pub fn set(&self, text: impl Into<String>) {
        let text = text.into();
        info!("Status: {}", text);
        self.0.send_replace(text);
    }

    pub fn current(&self) -> String {
        self.0.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.0.subscribe()
    }
}

/// Beep pitch: 200 Hz at 0% rising 6 Hz per percentage point.
pub fn pitch_for(confidence: u8) -> f32 {
    200.0 + confidence as f32 * 6.0
}

/// Latest verdict as the renderer sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackState {
    pub bbox: Option<BoundingBox>,
    pub confidence: u8,
    pub summary: String,
}

pub struct FeedbackRenderer {
    tone: Box<dyn ToneSink>,
    speaker: Box<dyn Speaker>,
    canvas: Box<dyn OverlayCanvas>,
    status: StatusLine,
    lang: String,
    display_threshold: u8,
    display_size: Option<(u32, u32)>,
    state: FeedbackState,
}

impl FeedbackRenderer {
    pub fn new(
        cfg: &FeedbackConfig,
        tone: Box<dyn ToneSink>,
        speaker: Box<dyn Speaker>,
        canvas: Box<dyn OverlayCanvas>,
        status: StatusLine,
    ) -> Self {
        Self {
            tone,
            speaker,
            canvas,
            status,
            lang: cfg.speech_lang.clone(),
            display_threshold: cfg.display_threshold,
            display_size: None,
            state: FeedbackState::default(),
        }
    }

    /// Fixed overlay surface; otherwise each frame's own size is used.
    pub fn with_display_size(mut self, width: u32, height: u32) -> Self {
        self.display_size = Some((width, height));
        self
    }

    pub fn state(&self) -> &FeedbackState {
        &self.state
    }

    pub fn set_status(&self, text: impl Into<String>) {
        self.status.set(text);
    }

    /// A fresh verdict replaces the previous one and triggers feedback.
    pub fn apply_verdict(&mut self, verdict: DetectionVerdict) {
        let (bbox, confidence) = if verdict.found {
            (Some(verdict.bbox), verdict.confidence())
        } else {
            (None, 0)
        };
        self.set_status(format!("比对完成: {}", verdict.summary));
        self.state = FeedbackState {
            bbox,
            confidence,
            summary: verdict.summary,
        };
        info!(
            "Verdict applied: found={} confidence={}%",
            self.state.bbox.is_some(),
            confidence
        );
        self.emit_audio();
    }

    /// A failed remote call clears the box and confidence; the summary stays.
    pub fn apply_failure(&mut self) {
        self.set_status(STATUS_CLOUD_FAILED);
        self.state.bbox = None;
        self.state.confidence = 0;
        self.emit_audio();
    }

    pub fn reset(&mut self) {
        self.state = FeedbackState::default();
    }

    fn emit_audio(&mut self) {
        let confidence = self.state.confidence;
        if confidence == 0 {
            return;
        }
        self.tone.play(pitch_for(confidence), EIGHTH_NOTE);
        if !self.state.summary.is_empty() {
            self.speaker.speak(&self.state.summary, &self.lang);
        }
    }

    pub fn overlay_for(&self, frame_width: u32, frame_height: u32) -> OverlayPlan {
        let (w, h) = self.display_size.unwrap_or((frame_width, frame_height));
        plan_overlay(
            self.state.bbox.as_ref(),
            self.state.confidence,
            w,
            h,
            self.display_threshold,
        )
    }

    /// Redraw the canvas for `frame` with the current verdict.
    pub fn present(&mut self, frame: &RgbImage) {
        let plan = self.overlay_for(frame.width(), frame.height());
        self.canvas.present(frame, &plan);
    }
}
