//! Overlay geometry: verdict box in [0,1000] space → pixel rectangle on the
//! displayed frame, with confidence-scaled stroke and a percentage label.

use image::RgbImage;
use tracing::debug;

use crate::types::{BoundingBox, NORMALIZED_EXTENT};

/// rgba(50, 255, 50, a)
pub const STROKE_RGB: [u8; 3] = [50, 255, 50];
pub const LABEL_FONT_PX: f32 = 24.0;

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub line_width: f32,
    /// 0.0..=1.0
    pub opacity: f32,
    pub label: String,
    /// Horizontal centre and baseline of the label.
    pub label_x: f32,
    pub label_y: f32,
}

/// What one redraw puts on a cleared canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayPlan {
    pub width: u32,
    pub height: u32,
    pub rect: Option<OverlayRect>,
}

impl OverlayPlan {
    pub fn clear(width: u32, height: u32) -> Self {
        Self { width, height, rect: None }
    }
}

/// Build the overlay for the latest verdict state.
///
/// Nothing is drawn unless a box exists and `confidence > threshold`.
pub fn plan_overlay(
    bbox: Option<&BoundingBox>,
    confidence: u8,
    width: u32,
    height: u32,
    threshold: u8,
) -> OverlayPlan {
    let Some(b) = bbox.filter(|_| confidence > threshold) else {
        return OverlayPlan::clear(width, height);
    };

    let scale_x = width as f32 / NORMALIZED_EXTENT;
    let scale_y = height as f32 / NORMALIZED_EXTENT;
    let x = b.x_min * scale_x;
    let y = b.y_min * scale_y;
    let w = (b.x_max - b.x_min) * scale_x;
    let h = (b.y_max - b.y_min) * scale_y;

    let c = confidence as f32 / 100.0;
    let label_y = if y > 30.0 { y - 10.0 } else { y + h + 25.0 };

    OverlayPlan {
        width,
        height,
        rect: Some(OverlayRect {
            x,
            y,
            width: w,
            height: h,
            line_width: 2.0 + c * 8.0,
            opacity: c.min(1.0),
            label: format!("{}%", confidence),
            label_x: x + w / 2.0,
            label_y,
        }),
    }
}

/// Presents frames with the current overlay.
pub trait OverlayCanvas: Send {
    fn present(&mut self, frame: &RgbImage, plan: &OverlayPlan);
}

/// Headless canvas: logs overlay changes only.
#[derive(Default)]
pub struct LogCanvas {
    last: Option<OverlayPlan>,
}

impl OverlayCanvas for LogCanvas {
    fn present(&mut self, _frame: &RgbImage, plan: &OverlayPlan) {
        if self.last.as_ref() == Some(plan) {
            return;
        }
        match &plan.rect {
            Some(r) => debug!(
                "Overlay: box ({:.0},{:.0}) {:.0}x{:.0} line={:.1} opacity={:.2} label '{}' at ({:.0},{:.0})",
                r.x, r.y, r.width, r.height, r.line_width, r.opacity, r.label, r.label_x, r.label_y
            ),
            None => debug!("Overlay cleared ({}x{})", plan.width, plan.height),
        }
        self.last = Some(plan.clone());
    }
}

#[cfg(feature = "vision")]
pub use window::OpenCvWindow;

#[cfg(feature = "vision")]
mod window {
    use super::*;
    use opencv::{
        core::{self, Mat, Point, Rect, Scalar},
        highgui, imgproc,
        prelude::*,
    };
    use tracing::warn;

    /// Desktop preview window drawn with OpenCV.
    pub struct OpenCvWindow {
        name: String,
    }

    impl OpenCvWindow {
        pub fn new(name: &str) -> Self {
            Self { name: name.to_string() }
        }

        fn draw(&self, frame: &RgbImage, plan: &OverlayPlan) -> opencv::Result<()> {
            let mut rgb = Mat::new_rows_cols_with_default(
                frame.height() as i32,
                frame.width() as i32,
                core::CV_8UC3,
                Scalar::all(0.0),
            )?;
            rgb.data_bytes_mut()?.copy_from_slice(frame.as_raw());
            let mut bgr = Mat::default();
            imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;

            let mut display = Mat::default();
            imgproc::resize(
                &bgr,
                &mut display,
                core::Size::new(plan.width as i32, plan.height as i32),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;

            if let Some(r) = &plan.rect {
                let mut layer = display.try_clone()?;
                let color = Scalar::new(STROKE_RGB[2] as f64, STROKE_RGB[1] as f64, STROKE_RGB[0] as f64, 0.0);
                imgproc::rectangle(
                    &mut layer,
                    Rect::new(r.x as i32, r.y as i32, r.width as i32, r.height as i32),
                    color,
                    r.line_width.round() as i32,
                    imgproc::LINE_AA,
                    0,
                )?;
                let scale = LABEL_FONT_PX as f64 / 30.0;
                let mut baseline = 0;
                let size = imgproc::get_text_size(&r.label, imgproc::FONT_HERSHEY_DUPLEX, scale, 2, &mut baseline)?;
                imgproc::put_text(
                    &mut layer,
                    &r.label,
                    Point::new((r.label_x as i32) - size.width / 2, r.label_y as i32),
                    imgproc::FONT_HERSHEY_DUPLEX,
                    scale,
                    color,
                    2,
                    imgproc::LINE_AA,
                    false,
                )?;
                let alpha = r.opacity as f64;
                let mut blended = Mat::default();
                core::add_weighted(&layer, alpha, &display, 1.0 - alpha, 0.0, &mut blended, -1)?;
                display = blended;
            }

            highgui::imshow(&self.name, &display)?;
            highgui::wait_key(1)?;
            Ok(())
        }
    }

    impl OverlayCanvas for OpenCvWindow {
        fn present(&mut self, frame: &RgbImage, plan: &OverlayPlan) {
            if let Err(e) = self.draw(frame, plan) {
                warn!("Overlay draw failed: {}", e);
            }
        }
    }

    impl Drop for OpenCvWindow {
        fn drop(&mut self) {
            let _ = highgui::destroy_window(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BoundingBox {
        BoundingBox { x_min: 100.0, y_min: 200.0, x_max: 500.0, y_max: 600.0 }
    }

    #[test]
    fn low_confidence_draws_nothing() {
        for c in [0, 5, 10] {
            assert_eq!(plan_overlay(Some(&bbox()), c, 640, 480, 10).rect, None);
        }
    }

    #[test]
    fn missing_box_draws_nothing() {
        assert_eq!(plan_overlay(None, 90, 640, 480, 10).rect, None);
    }

    #[test]
    fn box_scales_to_display() {
        let r = plan_overlay(Some(&bbox()), 50, 1000, 500, 10).rect.unwrap();
        assert_eq!((r.x, r.y, r.width, r.height), (100.0, 100.0, 400.0, 200.0));
        assert_eq!(r.line_width, 6.0);
        assert_eq!(r.opacity, 0.5);
        assert_eq!(r.label, "50%");
        assert_eq!(r.label_x, 300.0);
        assert_eq!(r.label_y, 90.0);
    }

    #[test]
    fn label_goes_below_when_no_room_above() {
        let top = BoundingBox { x_min: 0.0, y_min: 20.0, x_max: 1000.0, y_max: 520.0 };
        let r = plan_overlay(Some(&top), 100, 1000, 1000, 10).rect.unwrap();
        assert_eq!(r.label_y, 20.0 + 500.0 + 25.0);
        assert_eq!(r.opacity, 1.0);
        assert_eq!(r.line_width, 10.0);
    }

    #[test]
    fn just_above_threshold_draws() {
        assert!(plan_overlay(Some(&bbox()), 11, 640, 480, 10).rect.is_some());
    }
}
