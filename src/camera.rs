//! Camera acquisition with a prioritised constraint chain.
//!
//! The rear-facing (environment) camera is tried first, then any camera.
//! When every attempt fails, the last device error decides which user-facing
//! message the session shows.

use image::RgbImage;
use std::fmt;
use std::io;
use thiserror::Error;
use tracing::{info, warn};

/// One constraint in the acquisition chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Environment,
    Any,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Environment => f.write_str("facingMode=environment"),
            Facing::Any         => f.write_str("video=any"),
        }
    }
}

/// Rear camera first, then anything.
pub const CONSTRAINT_CHAIN: [Facing; 2] = [Facing::Environment, Facing::Any];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraErrorKind {
    NotFound,
    PermissionDenied,
    Busy,
    Unknown,
}

impl CameraErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            CameraErrorKind::NotFound         => "未找到可用的摄像头设备。",
            CameraErrorKind::PermissionDenied => "摄像头权限被拒绝。请在浏览器设置中允许访问。",
            CameraErrorKind::Busy             => "摄像头已被其他应用占用或硬件错误。",
            CameraErrorKind::Unknown          => "启动摄像头时发生未知错误。",
        }
    }

    /// Map a device-open failure onto the four user-facing kinds.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CameraErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => CameraErrorKind::PermissionDenied,
            // EBUSY
            _ if err.raw_os_error() == Some(16) => CameraErrorKind::Busy,
            _ => CameraErrorKind::Unknown,
        }
    }
}

/// Shown when no attempt recorded an error at all.
pub const GENERIC_ACCESS_MESSAGE: &str = "无法访问摄像头。";

#[derive(Debug, Clone, Error)]
#[error("camera {kind:?}: {detail}")]
pub struct CameraError {
    pub kind: CameraErrorKind,
    pub detail: String,
}

impl CameraError {
    pub fn new(kind: CameraErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// A live stream of RGB frames.
pub trait FrameSource: Send {
    /// `Ok(None)` while the device has no decodable frame yet.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError>;

    /// Release the device. Further reads return `Ok(None)`.
    fn stop(&mut self);
}

/// Opens a frame source for one constraint.
pub trait CameraProvider: Send + Sync {
    fn open(&self, facing: Facing) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Why no camera could be acquired: the last error seen, if any.
#[derive(Debug, Clone)]
pub struct AcquireFailure {
    pub last_error: Option<CameraError>,
}

impl AcquireFailure {
    pub fn user_message(&self) -> &'static str {
        self.last_error
            .as_ref()
            .map(|e| e.kind.user_message())
            .unwrap_or(GENERIC_ACCESS_MESSAGE)
    }
}

/// Try each constraint in order; the first stream that opens wins.
pub fn acquire(
    provider: &dyn CameraProvider,
    chain: &[Facing],
) -> Result<(Box<dyn FrameSource>, Facing), AcquireFailure> {
    let mut last_error = None;
    for &facing in chain {
        match provider.open(facing) {
            Ok(source) => {
                info!("Camera acquired with constraints {}", facing);
                return Ok((source, facing));
            }
            Err(e) => {
                warn!("Failed to get camera with constraints {}: {}", facing, e);
                last_error = Some(e);
            }
        }
    }
    warn!("Could not start camera stream: {:?}", last_error);
    Err(AcquireFailure { last_error })
}

#[cfg(feature = "vision")]
pub use opencv_camera::{OpenCvCamera, OpenCvCameraProvider};

#[cfg(feature = "vision")]
mod opencv_camera {
    use super::*;
    use opencv::{core::Mat, imgproc, prelude::*, videoio};

    /// V4L2/AVFoundation device through OpenCV's `VideoCapture`.
    pub struct OpenCvCamera {
        capture: Option<videoio::VideoCapture>,
        index: i32,
    }

    impl FrameSource for OpenCvCamera {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
            let Some(capture) = self.capture.as_mut() else {
                return Ok(None);
            };
            let mut frame = Mat::default();
            let grabbed = capture
                .read(&mut frame)
                .map_err(|e| CameraError::new(CameraErrorKind::Busy, e.to_string()))?;
            if !grabbed || frame.empty() {
                return Ok(None);
            }
            mat_to_rgb(&frame).map(Some)
        }

        fn stop(&mut self) {
            if let Some(mut capture) = self.capture.take() {
                if let Err(e) = capture.release() {
                    warn!("Failed to release camera {}: {}", self.index, e);
                }
                info!("Camera {} released", self.index);
            }
        }
    }

    impl Drop for OpenCvCamera {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn mat_to_rgb(bgr: &Mat) -> Result<RgbImage, CameraError> {
        let convert = |e: opencv::Error| CameraError::new(CameraErrorKind::Unknown, e.to_string());
        let mut rgb = Mat::default();
        imgproc::cvt_color(bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(convert)?;
        let (w, h) = (rgb.cols() as u32, rgb.rows() as u32);
        let bytes = rgb.data_bytes().map_err(convert)?.to_vec();
        RgbImage::from_raw(w, h, bytes)
            .ok_or_else(|| CameraError::new(CameraErrorKind::Unknown, "frame buffer size mismatch"))
    }

    /// Maps each constraint to a device index.
    pub struct OpenCvCameraProvider {
        pub environment_index: i32,
        pub fallback_index: i32,
    }

    impl OpenCvCameraProvider {
        fn index_for(&self, facing: Facing) -> i32 {
            match facing {
                Facing::Environment => self.environment_index,
                Facing::Any         => self.fallback_index,
            }
        }
    }

    impl CameraProvider for OpenCvCameraProvider {
        fn open(&self, facing: Facing) -> Result<Box<dyn FrameSource>, CameraError> {
            let index = self.index_for(facing);

            // Probe the device node first so permission / missing-device errors
            // keep their identity; VideoCapture only reports "not opened".
            #[cfg(target_os = "linux")]
            {
                let node = format!("/dev/video{}", index);
                if let Err(e) = std::fs::OpenOptions::new().read(true).open(&node) {
                    return Err(CameraError::new(CameraErrorKind::from_io(&e), format!("{node}: {e}")));
                }
            }

            let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)
                .map_err(|e| CameraError::new(CameraErrorKind::Unknown, e.to_string()))?;
            let opened = capture
                .is_opened()
                .map_err(|e| CameraError::new(CameraErrorKind::Unknown, e.to_string()))?;
            if !opened {
                return Err(CameraError::new(
                    CameraErrorKind::Busy,
                    format!("device {} exists but could not be opened", index),
                ));
            }

            Ok(Box::new(OpenCvCamera {
                capture: Some(capture),
                index,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        results: Mutex<Vec<Result<(), CameraErrorKind>>>,
        attempts: Mutex<Vec<Facing>>,
    }

    struct Blank;

    impl FrameSource for Blank {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, CameraError> {
            Ok(Some(RgbImage::new(4, 4)))
        }
        fn stop(&mut self) {}
    }

    impl CameraProvider for Scripted {
        fn open(&self, facing: Facing) -> Result<Box<dyn FrameSource>, CameraError> {
            self.attempts.lock().unwrap().push(facing);
            match self.results.lock().unwrap().remove(0) {
                Ok(()) => Ok(Box::new(Blank)),
                Err(kind) => Err(CameraError::new(kind, "scripted")),
            }
        }
    }

    fn scripted(results: Vec<Result<(), CameraErrorKind>>) -> Scripted {
        Scripted {
            results: Mutex::new(results),
            attempts: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn rear_camera_first() {
        let p = scripted(vec![Ok(())]);
        let (_, facing) = acquire(&p, &CONSTRAINT_CHAIN).unwrap();
        assert_eq!(facing, Facing::Environment);
        assert_eq!(*p.attempts.lock().unwrap(), vec![Facing::Environment]);
    }

    #[test]
    fn falls_back_to_any_camera() {
        let p = scripted(vec![Err(CameraErrorKind::NotFound), Ok(())]);
        let (_, facing) = acquire(&p, &CONSTRAINT_CHAIN).unwrap();
        assert_eq!(facing, Facing::Any);
    }

    #[test]
    fn last_error_decides_the_message() {
        let p = scripted(vec![Err(CameraErrorKind::NotFound), Err(CameraErrorKind::Busy)]);
        let failure = acquire(&p, &CONSTRAINT_CHAIN).err().unwrap();
        assert_eq!(failure.user_message(), "摄像头已被其他应用占用或硬件错误。");
    }

    #[test]
    fn empty_chain_gives_generic_message() {
        let p = scripted(vec![]);
        let failure = acquire(&p, &[]).err().unwrap();
        assert_eq!(failure.user_message(), GENERIC_ACCESS_MESSAGE);
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(CameraErrorKind::from_io(&denied), CameraErrorKind::PermissionDenied);
        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(CameraErrorKind::from_io(&missing), CameraErrorKind::NotFound);
        assert_eq!(CameraErrorKind::from_io(&io::Error::from_raw_os_error(16)), CameraErrorKind::Busy);
        assert_eq!(CameraErrorKind::from_io(&io::Error::other("x")), CameraErrorKind::Unknown);
    }
}
