//! Gate detector — YOLOv8 (COCO) via ONNX Runtime
//!
//! Returns every detection above the score floor with its COCO label, so the
//! gate can apply per-category allow-lists. Letterboxing and tensor layout
//! follow the standard YOLOv8 export (input "images", output [1, 84, N]).

use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info};

use crate::error::ModelLoadError;
use crate::gate::{GateClassifier, LocalDetection};

/// COCO-80 label set in YOLOv8 class-id order.
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
    "boat", "traffic light", "fire hydrant", "stop sign", "parking meter", "bench",
    "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra",
    "giraffe", "backpack", "umbrella", "handbag", "tie", "suitcase", "frisbee",
    "skis", "snowboard", "sports ball", "kite", "baseball bat", "baseball glove",
    "skateboard", "surfboard", "tennis racket", "bottle", "wine glass", "cup",
    "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear",
    "hair drier", "toothbrush",
];

pub fn coco_label(id: usize) -> &'static str {
    COCO_LABELS.get(id).copied().unwrap_or("unknown")
}

/// YOLOv8 wrapper using ONNX Runtime.
pub struct Detector {
    session: Session,
    input_size: u32,
    score_floor: f32,
}

impl Detector {
    pub fn new(model_path: &str, input_size: u32, score_floor: f32) -> Result<Self, ModelLoadError> {
        let session = Session::builder()
            .map_err(|e| load_error(model_path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(model_path, e))?
            .with_intra_threads(2)
            .map_err(|e| load_error(model_path, e))?
            .commit_from_file(model_path)
            .map_err(|e| load_error(model_path, e))?;

        info!("Gate detector loaded from {} (input {}px)", model_path, input_size);

        Ok(Self {
            session,
            input_size,
            score_floor,
        })
    }

    /// Run inference on a full frame. Returns ALL detections above the floor.
    pub fn detect_frame(&mut self, frame: &RgbImage) -> Result<Vec<LocalDetection>> {
        let sz = self.input_size;
        let lb = letterbox(frame, sz);
        let data = rgb_to_chw_f32(&lb.image);
        let array = Array4::from_shape_vec((1, 3, sz as usize, sz as usize), data)?;
        let input = Tensor::from_array(array).map_err(|e| anyhow!("input tensor: {e}"))?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input])
            .map_err(|e| anyhow!("inference failed: {e}"))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to extract output tensor: {e}"))?;

        // YOLOv8 output: [1, 4 + classes, boxes]
        if shape.len() != 3 || shape[1] <= 4 {
            return Err(anyhow!("unexpected output shape {:?}", &shape[..]));
        }
        let rows = shape[1] as usize;
        let num_boxes = shape[2] as usize;
        let at = |row: usize, i: usize| data[row * num_boxes + i];

        let (orig_w, orig_h) = (frame.width() as f32, frame.height() as f32);
        let mut detections = Vec::new();
        for i in 0..num_boxes {
            let mut max_score = 0f32;
            let mut max_class = 0usize;
            for c in 0..rows - 4 {
                let score = at(4 + c, i);
                if score > max_score {
                    max_score = score;
                    max_class = c;
                }
            }
            if max_score <= self.score_floor {
                continue;
            }

            let (cx, cy, bw, bh) = (at(0, i), at(1, i), at(2, i), at(3, i));
            // Letterbox coords → frame pixels
            let x1 = ((cx - bw / 2.0 - lb.pad_x) / lb.scale).clamp(0.0, orig_w);
            let y1 = ((cy - bh / 2.0 - lb.pad_y) / lb.scale).clamp(0.0, orig_h);
            let x2 = ((cx + bw / 2.0 - lb.pad_x) / lb.scale).clamp(0.0, orig_w);
            let y2 = ((cy + bh / 2.0 - lb.pad_y) / lb.scale).clamp(0.0, orig_h);

            detections.push(LocalDetection {
                class: coco_label(max_class).to_string(),
                score: max_score,
                bbox: [x1, y1, x2 - x1, y2 - y1],
            });
        }

        debug!("Detector: {} candidates above {:.2}", detections.len(), self.score_floor);
        Ok(detections)
    }
}

impl GateClassifier for Detector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<LocalDetection>> {
        self.detect_frame(frame)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn load_error(path: &str, e: impl std::fmt::Display) -> ModelLoadError {
    ModelLoadError {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

struct Letterboxed {
    image: RgbImage,
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Letterbox resize: fit image into `target×target` with grey padding.
fn letterbox(src: &RgbImage, target: u32) -> Letterboxed {
    let (w, h) = (src.width().max(1), src.height().max(1));
    let scale = (target as f32 / w.max(h) as f32).min(1.0);
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);

    let resized = imageops::resize(src, new_w, new_h, FilterType::Triangle);
    let pad_x = (target - new_w) / 2;
    let pad_y = (target - new_h) / 2;

    // grey — standard YOLOv8 padding
    let mut padded = RgbImage::from_pixel(target, target, Rgb([114, 114, 114]));
    imageops::replace(&mut padded, &resized, pad_x as i64, pad_y as i64);

    Letterboxed {
        image: padded,
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    }
}

/// Convert HWC RGB bytes → CHW Vec<f32> normalised to [0,1].
fn rgb_to_chw_f32(img: &RgbImage) -> Vec<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let plane = w * h;
    let mut out = vec![0f32; 3 * plane];
    for (i, px) in img.pixels().enumerate() {
        for c in 0..3usize {
            out[c * plane + i] = px.0[c] as f32 / 255.0;
        }
    }
    out
}
