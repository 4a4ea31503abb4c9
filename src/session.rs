//! Session controller: owns one subject search from name entry to scanning.
//!
//! Input → FetchingFeatures → ReadyToStream → Streaming, with `Error`
//! reachable from any step and `stop` returning to Input.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::camera::{acquire, CameraProvider, Facing, CONSTRAINT_CHAIN};
use crate::description::{resolve_subject, DescriptionService, Provenance};
use crate::detection_loop::{DetectionLoop, LoopHandle, LoopSettings};
use crate::error::SessionError;
use crate::feature_store::FeatureStore;
use crate::feedback::{FeedbackRenderer, FeedbackState, StatusLine};
use crate::gate::GateClassifier;
use crate::types::{SessionStage, SubjectDescriptor};
use crate::vision::VisionService;

pub const STATUS_IDLE: &str = "输入目标中药名称开始。";
pub const STATUS_FROM_CACHE: &str = "已从缓存加载特征。准备启动摄像头...";
pub const STATUS_FETCHED: &str = "特征检索成功！准备启动摄像头...";
pub const STATUS_FETCH_FAILED: &str = "特征检索失败。";
pub const STATUS_STARTING_CAMERA: &str = "正在启动摄像头...";
pub const STATUS_STREAMING: &str = "摄像头已启动，开始实时扫描...";

pub const MSG_EMPTY_NAME: &str = "请输入中药名称。";
pub const MSG_BUSY_STREAMING: &str = "正在扫描中，请先停止扫描。";
pub const MSG_NOT_READY: &str = "请先检索目标中药的特征。";
pub const MSG_DETECTOR_UNAVAILABLE: &str = "本地检测模块不可用，请重新启动。";

pub fn fetching_status(name: &str) -> String {
    format!("正在检索【{}】的特征...", name)
}

/// Everything a session needs, built once at startup.
pub struct SessionParts {
    pub store: FeatureStore,
    pub description: Arc<dyn DescriptionService>,
    pub vision: Arc<dyn VisionService>,
    pub camera: Box<dyn CameraProvider>,
    pub gate: Box<dyn GateClassifier>,
    pub feedback: FeedbackRenderer,
    pub status: StatusLine,
    pub settings: LoopSettings,
}

pub struct SessionController {
    stage: SessionStage,
    name: String,
    subject: Option<SubjectDescriptor>,
    error: Option<String>,
    status: StatusLine,
    store: FeatureStore,
    description: Arc<dyn DescriptionService>,
    vision: Arc<dyn VisionService>,
    camera: Box<dyn CameraProvider>,
    // Lent to the running loop and handed back on stop.
    gate: Option<Box<dyn GateClassifier>>,
    feedback: Option<FeedbackRenderer>,
    settings: LoopSettings,
    epoch: u64,
    running: Option<LoopHandle>,
}

impl SessionController {
    pub fn new(parts: SessionParts) -> Self {
        parts.status.set(STATUS_IDLE);
        Self {
            stage: SessionStage::Input,
            name: String::new(),
            subject: None,
            error: None,
            status: parts.status,
            store: parts.store,
            description: parts.description,
            vision: parts.vision,
            camera: parts.camera,
            gate: Some(parts.gate),
            feedback: Some(parts.feedback),
            settings: parts.settings,
            epoch: 0,
            running: None,
        }
    }

    pub fn stage(&self) -> SessionStage {
        self.stage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> Option<&SubjectDescriptor> {
        self.subject.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    /// Verdict state while no loop holds the renderer.
    pub fn feedback_state(&self) -> Option<&FeedbackState> {
        self.feedback.as_ref().map(|f| f.state())
    }

    pub fn is_streaming(&self) -> bool {
        self.running.is_some()
    }

    fn enter(&mut self, next: SessionStage) {
        if !self.stage.can_advance_to(next) {
            warn!("Unexpected session transition {:?} → {:?}", self.stage, next);
        }
        debug!("Session stage {:?} → {:?}", self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Session error: {}", message);
        self.error = Some(message);
        self.enter(SessionStage::Error);
    }

    /// Resolve `name` to a subject, from cache first.
    ///
    /// An empty name is rejected without touching the stage.
    pub async fn submit_name(&mut self, name: &str) -> Result<Provenance, SessionError> {
        let name = name.trim();
        if name.is_empty() {
            self.error = Some(MSG_EMPTY_NAME.to_string());
            return Err(SessionError::Rejected(MSG_EMPTY_NAME));
        }
        if !self.stage.accepts_input() {
            return Err(SessionError::Rejected(MSG_BUSY_STREAMING));
        }

        self.name = name.to_string();
        self.subject = None;
        self.error = None;
        self.enter(SessionStage::FetchingFeatures);
        self.status.set(fetching_status(name));

        match resolve_subject(&self.store, self.description.as_ref(), name).await {
            Ok((subject, provenance)) => {
                self.status.set(match provenance {
                    Provenance::Cache => STATUS_FROM_CACHE,
                    Provenance::Remote => STATUS_FETCHED,
                });
                self.subject = Some(subject);
                self.enter(SessionStage::ReadyToStream);
                Ok(provenance)
            }
            Err(e) => {
                self.fail(e.to_string());
                self.status.set(STATUS_FETCH_FAILED);
                Err(e.into())
            }
        }
    }

    /// Acquire a camera and start the detection loop for the current subject.
    pub fn start_streaming(&mut self) -> Result<Facing, SessionError> {
        if self.stage != SessionStage::ReadyToStream {
            return Err(SessionError::Rejected(MSG_NOT_READY));
        }
        let Some(subject) = self.subject.clone() else {
            return Err(SessionError::Rejected(MSG_NOT_READY));
        };

        self.enter(SessionStage::Streaming);
        self.status.set(STATUS_STARTING_CAMERA);
        self.error = None;

        let (mut source, facing) = match acquire(self.camera.as_ref(), &CONSTRAINT_CHAIN) {
            Ok(acquired) => acquired,
            Err(failure) => {
                let message = failure.user_message();
                self.fail(message);
                return Err(SessionError::CameraAccess {
                    message,
                    last_error: failure.last_error,
                });
            }
        };

        let (gate, feedback) = match (self.gate.take(), self.feedback.take()) {
            (Some(gate), Some(feedback)) => (gate, feedback),
            (gate, feedback) => {
                self.gate = gate;
                self.feedback = feedback;
                source.stop();
                self.fail(MSG_DETECTOR_UNAVAILABLE);
                return Err(SessionError::Rejected(MSG_DETECTOR_UNAVAILABLE));
            }
        };

        self.status.set(STATUS_STREAMING);
        self.epoch += 1;
        let detection = DetectionLoop::new(
            self.epoch,
            source,
            gate,
            Arc::clone(&self.vision),
            subject,
            feedback,
            self.settings.clone(),
        );
        self.running = Some(detection.spawn());
        info!("Streaming started for '{}' via {}", self.name, facing);
        Ok(facing)
    }

    /// Release the camera, stop the loop and clear the subject.
    ///
    /// Ends in `Input`, or in `Error` when the loop could not hand back the
    /// gate and renderer.
    pub async fn stop(&mut self) {
        let mut parts_lost = false;
        if let Some(handle) = self.running.take() {
            match handle.stop().await {
                Some(report) => {
                    self.gate = Some(report.gate);
                    self.feedback = Some(report.feedback);
                }
                None => parts_lost = true,
            }
        }
        if parts_lost {
            error!("Detection loop #{} ended without returning the local detector", self.epoch);
            self.name.clear();
            self.subject = None;
            self.status.set(MSG_DETECTOR_UNAVAILABLE);
            self.fail(MSG_DETECTOR_UNAVAILABLE);
            return;
        }
        if let Some(feedback) = self.feedback.as_mut() {
            feedback.reset();
        }
        self.name.clear();
        self.subject = None;
        self.error = None;
        self.status.set(STATUS_IDLE);
        debug!("Session stage {:?} → {:?}", self.stage, SessionStage::Input);
        self.stage = SessionStage::Input;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraError, CameraErrorKind, FrameSource};
    use crate::config::{DetectionConfig, FeedbackConfig};
    use crate::error::{DescriptionError, VisionError};
    use crate::feedback::Silent;
    use crate::gate::LocalDetection;
    use crate::overlay::LogCanvas;
    use crate::types::{Category, DetectionVerdict};
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Unreadable reply on the first call, a usable one afterwards.
    #[derive(Default)]
    struct FailsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DescriptionService for FailsOnce {
        async fn fetch(&self, _name: &str) -> Result<(Category, String), DescriptionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DescriptionError::Parse { raw: String::new() });
            }
            crate::description::parse_description("类别：草本\n视觉特征：\n- 叶：掌状复叶")
        }
    }

    struct NoVision;

    #[async_trait]
    impl VisionService for NoVision {
        async fn analyze(&self, _jpeg: &[u8], _features: &str) -> Result<DetectionVerdict, VisionError> {
            Err(VisionError::InvalidResponse("unused".into()))
        }
    }

    struct NoCamera;

    impl CameraProvider for NoCamera {
        fn open(&self, _facing: Facing) -> Result<Box<dyn FrameSource>, CameraError> {
            Err(CameraError::new(CameraErrorKind::NotFound, "none"))
        }
    }

    struct NoGate;

    impl GateClassifier for NoGate {
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<LocalDetection>> {
            Ok(Vec::new())
        }
    }

    fn session() -> SessionController {
        let status = StatusLine::new("");
        let feedback = FeedbackRenderer::new(
            &FeedbackConfig::default(),
            Box::new(Silent),
            Box::new(Silent),
            Box::new(LogCanvas::default()),
            status.clone(),
        );
        SessionController::new(SessionParts {
            store: FeatureStore::open_in_memory("herbvisionpro").unwrap(),
            description: Arc::new(FailsOnce::default()),
            vision: Arc::new(NoVision),
            camera: Box::new(NoCamera),
            gate: Box::new(NoGate),
            feedback,
            status,
            settings: LoopSettings::from(&DetectionConfig::default()),
        })
    }

    #[tokio::test]
    async fn empty_name_is_rejected_in_place() {
        let mut s = session();
        let err = s.submit_name("   ").await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(MSG_EMPTY_NAME)));
        assert_eq!(s.stage(), SessionStage::Input);
        assert_eq!(s.error_message(), Some(MSG_EMPTY_NAME));
        assert_eq!(s.status().current(), STATUS_IDLE);
    }

    #[tokio::test]
    async fn parse_failure_moves_to_error() {
        let mut s = session();
        assert!(s.submit_name("黄芪").await.is_err());
        assert_eq!(s.stage(), SessionStage::Error);
        assert_eq!(s.status().current(), STATUS_FETCH_FAILED);
        assert!(s.subject().is_none());
    }

    #[tokio::test]
    async fn streaming_requires_features() {
        let mut s = session();
        assert!(matches!(s.start_streaming(), Err(SessionError::Rejected(MSG_NOT_READY))));
        assert_eq!(s.stage(), SessionStage::Input);
    }

    #[tokio::test]
    async fn stop_from_error_resets_everything() {
        let mut s = session();
        let _ = s.submit_name("黄芪").await;
        s.stop().await;
        assert_eq!(s.stage(), SessionStage::Input);
        assert_eq!(s.name(), "");
        assert_eq!(s.error_message(), None);
        assert_eq!(s.status().current(), STATUS_IDLE);
    }

    #[tokio::test]
    async fn resubmitting_after_a_failure_fetches_again() {
        let mut s = session();
        assert!(s.submit_name("黄芪").await.is_err());
        assert_eq!(s.stage(), SessionStage::Error);

        assert_eq!(s.submit_name("人参").await.unwrap(), Provenance::Remote);
        assert_eq!(s.stage(), SessionStage::ReadyToStream);
        assert_eq!(s.error_message(), None);
        assert_eq!(s.subject().unwrap().name, "人参");
        assert_eq!(s.status().current(), STATUS_FETCHED);
    }
}
