//! Local gate: a cheap on-device detector decides when a frame is worth a
//! remote vision call.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::types::Category;

/// One local detection. `bbox` is `[x, y, width, height]` in frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDetection {
    pub class: String,
    pub score: f32,
    pub bbox: [f32; 4],
}

/// Stateless per call; `&mut self` because inference sessions need it.
pub trait GateClassifier: Send {
    fn detect(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<LocalDetection>>;
}

const HERBACEOUS_CLASSES: &[&str] = &["potted plant", "flower"];
const WOODY_CLASSES: &[&str] = &["tree"];
const SHRUB_CLASSES: &[&str] = &["potted plant", "flower", "tree"];
const DEFAULT_CLASSES: &[&str] = &["plant", "potted plant", "flower"];

/// Local labels accepted as a plausible sighting of a subject in `category`.
pub fn trigger_classes(category: Option<Category>) -> &'static [&'static str] {
    match category {
        Some(Category::Herbaceous) => HERBACEOUS_CLASSES,
        Some(Category::Woody)      => WOODY_CLASSES,
        Some(Category::Shrub)      => SHRUB_CLASSES,
        None                       => DEFAULT_CLASSES,
    }
}

/// First detection that opens the gate, if any.
pub fn triggering_detection<'a>(
    detections: &'a [LocalDetection],
    category: Option<Category>,
    min_score: f32,
) -> Option<&'a LocalDetection> {
    let allowed = trigger_classes(category);
    detections
        .iter()
        .find(|d| d.score > min_score && allowed.contains(&d.class.as_str()))
}

pub fn should_trigger(detections: &[LocalDetection], category: Option<Category>, min_score: f32) -> bool {
    triggering_detection(detections, category, min_score).is_some()
}
