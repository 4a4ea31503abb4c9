//! detection_loop.rs — Per-frame gate → throttled remote verification.
//!
//! Every tick grabs a frame, redraws the overlay and asks the local gate
//! whether a plausible subject is in view. That work runs on the blocking
//! pool so the stop signal stays responsive. A firing gate outside the
//! cooldown window spawns one remote vision call; the loop never waits for
//! it. Results come back over a flume channel tagged with the loop's epoch
//! and are applied between ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::camera::FrameSource;
use crate::config::DetectionConfig;
use crate::feedback::{FeedbackRenderer, STATUS_UPLOADING};
use crate::gate::{triggering_detection, GateClassifier};
use crate::types::{Category, DetectionVerdict, SubjectDescriptor};
use crate::vision::{encode_jpeg, VisionService};

// ─── Cooldown ───────────────────────────────────────────────────────────────

/// At most one remote call per `interval`. The first call is always allowed.
#[derive(Debug, Clone)]
pub struct Cooldown {
    interval: Duration,
    last_call: Option<Instant>,
}

impl Cooldown {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_call: None }
    }

    /// Claims the slot when strictly more than `interval` has passed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_call {
            Some(last) if now.saturating_duration_since(last) <= self.interval => false,
            _ => {
                self.last_call = Some(now);
                true
            }
        }
    }

    pub fn last_call(&self) -> Option<Instant> {
        self.last_call
    }
}

// ─── Loop types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEventKind {
    Verdict(DetectionVerdict),
    Failed(String),
}

/// Result of one spawned vision call.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopEvent {
    pub epoch: u64,
    pub kind: LoopEventKind,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Stopped,
    NotReady,
    NoTarget,
    CoolingDown,
    Triggered,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub cooldown: Duration,
    pub frame_interval: Duration,
    pub gate_score_threshold: f32,
    pub jpeg_quality: u8,
}

impl From<&DetectionConfig> for LoopSettings {
    fn from(cfg: &DetectionConfig) -> Self {
        Self {
            cooldown: cfg.cooldown(),
            frame_interval: cfg.frame_interval(),
            gate_score_threshold: cfg.gate_score_threshold,
            jpeg_quality: cfg.jpeg_quality,
        }
    }
}

/// Parts handed back to the session once the loop has stopped.
pub struct LoopReport {
    pub gate: Box<dyn GateClassifier>,
    pub feedback: FeedbackRenderer,
    pub remote_calls: u64,
}

// ─── Frame stage ────────────────────────────────────────────────────────────

/// Blocking half of a tick: camera read, overlay redraw, local gate and
/// JPEG encoding. Owned by the loop between ticks and moved onto the
/// blocking pool while a frame is processed.
pub struct FrameStage {
    source: Box<dyn FrameSource>,
    gate: Box<dyn GateClassifier>,
    feedback: FeedbackRenderer,
    cooldown: Cooldown,
    category: Category,
    gate_score_threshold: f32,
    jpeg_quality: u8,
}

/// What the blocking half decided for one frame.
#[derive(Debug)]
pub enum FrameStep {
    Skipped(TickOutcome),
    Upload(Vec<u8>),
}

impl FrameStage {
    pub fn step(&mut self, now: Instant) -> FrameStep {
        let frame = match self.source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return FrameStep::Skipped(TickOutcome::NotReady),
            Err(e) => {
                warn!("Frame read failed: {}", e);
                return FrameStep::Skipped(TickOutcome::NotReady);
            }
        };
        self.feedback.present(&frame);

        let detections = match self.gate.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                warn!("Local gate error: {}", e);
                return FrameStep::Skipped(TickOutcome::NoTarget);
            }
        };
        let Some(hit) =
            triggering_detection(&detections, Some(self.category), self.gate_score_threshold)
        else {
            return FrameStep::Skipped(TickOutcome::NoTarget);
        };

        if !self.cooldown.try_acquire(now) {
            return FrameStep::Skipped(TickOutcome::CoolingDown);
        }

        let jpeg = match encode_jpeg(&frame, self.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Frame encode failed, skipping remote check: {}", e);
                return FrameStep::Skipped(TickOutcome::NoTarget);
            }
        };

        info!(
            "Gate fired on '{}' ({:.2}); sending {} KB frame for verification",
            hit.class,
            hit.score,
            jpeg.len() / 1024
        );
        self.feedback.set_status(STATUS_UPLOADING);
        FrameStep::Upload(jpeg)
    }
}

// ─── Loop ───────────────────────────────────────────────────────────────────

/// How long `run` waits for an in-flight frame once stop is signalled.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct DetectionLoop {
    epoch: u64,
    state: LoopState,
    // `None` while a frame is on the blocking pool, or after it was lost.
    stage: Option<FrameStage>,
    vision: Arc<dyn VisionService>,
    subject: SubjectDescriptor,
    frame_interval: Duration,
    remote_calls: u64,
    events_tx: flume::Sender<LoopEvent>,
    events_rx: flume::Receiver<LoopEvent>,
}

impl DetectionLoop {
    pub fn new(
        epoch: u64,
        source: Box<dyn FrameSource>,
        gate: Box<dyn GateClassifier>,
        vision: Arc<dyn VisionService>,
        subject: SubjectDescriptor,
        feedback: FeedbackRenderer,
        settings: LoopSettings,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let stage = FrameStage {
            source,
            gate,
            feedback,
            cooldown: Cooldown::new(settings.cooldown),
            category: subject.category,
            gate_score_threshold: settings.gate_score_threshold,
            jpeg_quality: settings.jpeg_quality,
        };
        Self {
            epoch,
            state: LoopState::Idle,
            stage: Some(stage),
            vision,
            subject,
            frame_interval: settings.frame_interval,
            remote_calls: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn feedback(&self) -> Option<&FeedbackRenderer> {
        self.stage.as_ref().map(|stage| &stage.feedback)
    }

    pub fn remote_calls(&self) -> u64 {
        self.remote_calls
    }

    /// Idle → Polling.
    pub fn start(&mut self) {
        if self.state == LoopState::Idle {
            info!(
                "Detection loop #{} polling for '{}' ({})",
                self.epoch, self.subject.name, self.subject.category
            );
            self.state = LoopState::Polling;
        }
    }

    /// One frame processed on the calling thread.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.state != LoopState::Polling {
            return TickOutcome::Stopped;
        }
        let Some(stage) = self.stage.as_mut() else {
            return TickOutcome::Stopped;
        };
        let step = stage.step(now);
        self.finish_step(step)
    }

    fn finish_step(&mut self, step: FrameStep) -> TickOutcome {
        match step {
            FrameStep::Skipped(outcome) => outcome,
            FrameStep::Upload(jpeg) => {
                self.spawn_vision_call(jpeg);
                TickOutcome::Triggered
            }
        }
    }

    fn spawn_vision_call(&mut self, jpeg: Vec<u8>) {
        self.remote_calls += 1;
        let epoch = self.epoch;
        let vision = Arc::clone(&self.vision);
        let features = self.subject.features.clone();
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let kind = match vision.analyze(&jpeg, &features).await {
                Ok(verdict) => LoopEventKind::Verdict(verdict),
                Err(e) => {
                    warn!("Vision call failed: {}", e);
                    LoopEventKind::Failed(e.to_string())
                }
            };
            if tx.send_async(LoopEvent { epoch, kind }).await.is_err() {
                debug!("Loop #{} already stopped; vision result dropped", epoch);
            }
        });
    }

    /// Wait for the next result of a spawned call.
    pub async fn next_event(&self) -> Option<LoopEvent> {
        self.events_rx.recv_async().await.ok()
    }

    /// Apply a result to the feedback state. Stale or late results are
    /// discarded and `false` is returned.
    pub fn apply_event(&mut self, event: LoopEvent) -> bool {
        if event.epoch != self.epoch || self.state != LoopState::Polling {
            debug!(
                "Discarding vision result for loop #{} (current #{}, {:?})",
                event.epoch, self.epoch, self.state
            );
            return false;
        }
        let Some(stage) = self.stage.as_mut() else {
            return false;
        };
        match event.kind {
            LoopEventKind::Verdict(verdict) => stage.feedback.apply_verdict(verdict),
            LoopEventKind::Failed(_) => stage.feedback.apply_failure(),
        }
        true
    }

    /// Polling → Idle and release the camera.
    pub fn halt(&mut self) {
        if self.state == LoopState::Polling {
            self.state = LoopState::Idle;
            if let Some(stage) = self.stage.as_mut() {
                stage.source.stop();
            }
            info!(
                "Detection loop #{} stopped after {} remote call(s)",
                self.epoch, self.remote_calls
            );
        }
    }

    /// Poll until `stop_rx` flips to `true` or its sender is dropped.
    ///
    /// Frames are processed on the blocking pool one at a time; results are
    /// applied only while the stage is home. Returns `None` when the stage
    /// was lost to a panicking worker or to a frame still stuck after
    /// [`STOP_GRACE`].
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) -> Option<LoopReport> {
        self.start();
        let mut ticker = tokio::time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let events = self.events_rx.clone();
        let mut in_flight: Option<JoinHandle<(FrameStage, FrameStep)>> = None;

        while !*stop_rx.borrow() {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                joined = join_frame(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match joined {
                        Ok((stage, step)) => {
                            self.stage = Some(stage);
                            self.finish_step(step);
                        }
                        Err(e) => {
                            error!("Frame worker of loop #{} failed: {}", self.epoch, e);
                            break;
                        }
                    }
                }
                Ok(event) = events.recv_async(), if in_flight.is_none() => {
                    self.apply_event(event);
                }
                _ = ticker.tick(), if in_flight.is_none() => {
                    if let Some(mut stage) = self.stage.take() {
                        let now = Instant::now();
                        in_flight = Some(tokio::task::spawn_blocking(move || {
                            let step = stage.step(now);
                            (stage, step)
                        }));
                    }
                }
            }
        }

        if let Some(handle) = in_flight.take() {
            // A frame that finishes after stop is never uploaded.
            match tokio::time::timeout(STOP_GRACE, handle).await {
                Ok(Ok((stage, _))) => self.stage = Some(stage),
                Ok(Err(e)) => error!("Frame worker of loop #{} failed: {}", self.epoch, e),
                Err(_) => warn!(
                    "Frame worker of loop #{} still busy after {:?}; camera is released when it returns",
                    self.epoch, STOP_GRACE
                ),
            }
        }

        self.halt();
        let remote_calls = self.remote_calls;
        let stage = self.stage.take()?;
        Some(LoopReport {
            gate: stage.gate,
            feedback: stage.feedback,
            remote_calls,
        })
    }

    /// Run on the current runtime.
    pub fn spawn(self) -> LoopHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        LoopHandle { stop_tx, join }
    }
}

async fn join_frame<T>(
    in_flight: &mut Option<JoinHandle<T>>,
) -> Result<T, tokio::task::JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// A running loop that can be stopped via the stop signal.
pub struct LoopHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<Option<LoopReport>>,
}

impl LoopHandle {
    /// Signal the loop to stop and wait for its parts.
    pub async fn stop(self) -> Option<LoopReport> {
        let _ = self.stop_tx.send(true);
        match self.join.await {
            Ok(report) => report,
            Err(e) => {
                warn!("Detection loop task ended abnormally: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraError;
    use crate::config::FeedbackConfig;
    use crate::error::VisionError;
    use crate::feedback::{Silent, StatusLine};
    use crate::gate::LocalDetection;
    use crate::overlay::LogCanvas;
    use crate::types::BoundingBox;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StillFrame {
        ready: bool,
        stopped: Arc<AtomicBool>,
    }

    impl FrameSource for StillFrame {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
            Ok(self.ready.then(|| RgbImage::new(8, 8)))
        }
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Blocks like a camera waiting on the driver, then reports no frame.
    struct SlowFrame {
        delay: Duration,
        stopped: Arc<AtomicBool>,
    }

    impl FrameSource for SlowFrame {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
            std::thread::sleep(self.delay);
            Ok(None)
        }
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct CrashingGate;

    impl GateClassifier for CrashingGate {
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<LocalDetection>> {
            panic!("inference backend crashed");
        }
    }

    struct FixedGate(Vec<LocalDetection>);

    impl GateClassifier for FixedGate {
        fn detect(&mut self, _frame: &RgbImage) -> anyhow::Result<Vec<LocalDetection>> {
            Ok(self.0.clone())
        }
    }

    struct CountingVision {
        calls: AtomicUsize,
        reply: &'static str,
    }

    #[async_trait]
    impl VisionService for CountingVision {
        async fn analyze(&self, _jpeg: &[u8], _features: &str) -> Result<DetectionVerdict, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            crate::vision::parse_verdict(self.reply)
        }
    }

    const FOUND: &str =
        r#"{"found":true,"summary":"找到人参，置信度：80%","box":{"x_min":100,"y_min":100,"x_max":500,"y_max":500}}"#;

    fn subject() -> SubjectDescriptor {
        SubjectDescriptor {
            name: "人参".into(),
            category: Category::Herbaceous,
            features: "掌状复叶，红色浆果".into(),
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings::from(&DetectionConfig::default())
    }

    fn build(
        gate: Vec<LocalDetection>,
        reply: &'static str,
    ) -> (DetectionLoop, Arc<CountingVision>, Arc<AtomicBool>, watch::Receiver<String>) {
        let stopped = Arc::new(AtomicBool::new(false));
        let vision = Arc::new(CountingVision { calls: AtomicUsize::new(0), reply });
        let status = StatusLine::new("");
        let status_rx = status.subscribe();
        let feedback = FeedbackRenderer::new(
            &FeedbackConfig::default(),
            Box::new(Silent),
            Box::new(Silent),
            Box::new(LogCanvas::default()),
            status,
        );
        let lp = DetectionLoop::new(
            1,
            Box::new(StillFrame { ready: true, stopped: stopped.clone() }),
            Box::new(FixedGate(gate)),
            vision.clone(),
            subject(),
            feedback,
            settings(),
        );
        (lp, vision, stopped, status_rx)
    }

    fn plant(class: &str, score: f32) -> Vec<LocalDetection> {
        vec![LocalDetection { class: class.into(), score, bbox: [0.0, 0.0, 4.0, 4.0] }]
    }

    #[test]
    fn cooldown_is_strict() {
        let t0 = Instant::now();
        let mut c = Cooldown::new(Duration::from_millis(2500));
        assert!(c.try_acquire(t0));
        assert!(!c.try_acquire(t0 + Duration::from_millis(1)));
        assert!(!c.try_acquire(t0 + Duration::from_millis(2500)));
        assert!(c.try_acquire(t0 + Duration::from_millis(2501)));
        assert_eq!(c.last_call(), Some(t0 + Duration::from_millis(2501)));
    }

    #[tokio::test]
    async fn idle_loop_does_nothing() {
        let (mut lp, vision, _, _) = build(plant("potted plant", 0.8), FOUND);
        assert_eq!(lp.tick(Instant::now()), TickOutcome::Stopped);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn potted_plant_for_herb_triggers_exactly_one_call() {
        let (mut lp, vision, _, status) = build(plant("potted plant", 0.8), FOUND);
        lp.start();
        let t0 = Instant::now();
        assert_eq!(lp.tick(t0), TickOutcome::Triggered);
        assert_eq!(lp.tick(t0 + Duration::from_millis(16)), TickOutcome::CoolingDown);
        assert_eq!(lp.tick(t0 + Duration::from_millis(2400)), TickOutcome::CoolingDown);
        assert_eq!(*status.borrow(), STATUS_UPLOADING);

        let event = lp.next_event().await.unwrap();
        assert!(lp.apply_event(event));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(lp.remote_calls(), 1);
        assert_eq!(lp.feedback().unwrap().state().confidence, 80);
        assert_eq!(
            lp.feedback().unwrap().state().bbox,
            Some(BoundingBox { x_min: 100.0, y_min: 100.0, x_max: 500.0, y_max: 500.0 })
        );
    }

    #[tokio::test]
    async fn gate_below_threshold_or_wrong_class_never_calls() {
        let (mut lp, _, _, _) = build(plant("potted plant", 0.5), FOUND);
        lp.start();
        assert_eq!(lp.tick(Instant::now()), TickOutcome::NoTarget);

        let (mut lp, _, _, _) = build(plant("tree", 0.9), FOUND);
        lp.start();
        assert_eq!(lp.tick(Instant::now()), TickOutcome::NoTarget);
        assert_eq!(lp.remote_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_json_keeps_polling() {
        let (mut lp, _, _, status) = build(plant("flower", 0.9), "not json at all");
        lp.start();
        let t0 = Instant::now();
        assert_eq!(lp.tick(t0), TickOutcome::Triggered);
        let event = lp.next_event().await.unwrap();
        assert!(matches!(event.kind, LoopEventKind::Failed(_)));
        assert!(lp.apply_event(event));
        assert_eq!(lp.state(), LoopState::Polling);
        assert_eq!(*status.borrow(), crate::feedback::STATUS_CLOUD_FAILED);
        assert_eq!(lp.tick(t0 + Duration::from_millis(2600)), TickOutcome::Triggered);
    }

    #[tokio::test]
    async fn stale_and_late_results_are_discarded() {
        let (mut lp, _, _, _) = build(plant("flower", 0.9), FOUND);
        lp.start();
        let verdict = crate::vision::parse_verdict(FOUND).unwrap();
        assert!(!lp.apply_event(LoopEvent { epoch: 0, kind: LoopEventKind::Verdict(verdict.clone()) }));
        lp.halt();
        assert!(!lp.apply_event(LoopEvent { epoch: 1, kind: LoopEventKind::Verdict(verdict) }));
        assert_eq!(lp.feedback().unwrap().state().confidence, 0);
    }

    #[tokio::test]
    async fn frame_not_ready_is_skipped() {
        let mut lp = DetectionLoop::new(
            1,
            Box::new(StillFrame { ready: false, stopped: Arc::new(AtomicBool::new(false)) }),
            Box::new(FixedGate(plant("flower", 0.9))),
            Arc::new(CountingVision { calls: AtomicUsize::new(0), reply: FOUND }),
            subject(),
            renderer(),
            settings(),
        );
        lp.start();
        assert_eq!(lp.tick(Instant::now()), TickOutcome::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_stops_and_releases_camera() {
        let (lp, vision, stopped, _) = build(plant("potted plant", 0.8), FOUND);
        let handle = lp.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = handle.stop().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(report.remote_calls, 1);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.feedback.state().confidence, 80);
    }

    fn renderer() -> FeedbackRenderer {
        FeedbackRenderer::new(
            &FeedbackConfig::default(),
            Box::new(Silent),
            Box::new(Silent),
            Box::new(LogCanvas::default()),
            StatusLine::new(""),
        )
    }

    #[tokio::test]
    async fn slow_camera_does_not_stall_the_runtime() {
        let stopped = Arc::new(AtomicBool::new(false));
        let lp = DetectionLoop::new(
            1,
            Box::new(SlowFrame { delay: Duration::from_millis(300), stopped: stopped.clone() }),
            Box::new(FixedGate(Vec::new())),
            Arc::new(CountingVision { calls: AtomicUsize::new(0), reply: FOUND }),
            subject(),
            renderer(),
            settings(),
        );
        let handle = lp.spawn();
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(250));

        let report = handle.stop().await.unwrap();
        assert_eq!(report.remote_calls, 0);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn crashing_gate_loses_the_parts() {
        let lp = DetectionLoop::new(
            1,
            Box::new(StillFrame { ready: true, stopped: Arc::new(AtomicBool::new(false)) }),
            Box::new(CrashingGate),
            Arc::new(CountingVision { calls: AtomicUsize::new(0), reply: FOUND }),
            subject(),
            renderer(),
            settings(),
        );
        let handle = lp.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.stop().await.is_none());
    }
}
