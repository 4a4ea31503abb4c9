//! Shared data model: subject descriptors, verdicts and session stages.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Coordinate space of every box returned by the vision model.
pub const NORMALIZED_EXTENT: f32 = 1000.0;

/// Growth habit of a subject, as answered by the description model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "草本")]
    Herbaceous,
    #[serde(rename = "木本")]
    Woody,
    #[serde(rename = "灌木")]
    Shrub,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Herbaceous => "草本",
            Category::Woody      => "木本",
            Category::Shrub      => "灌木",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The plant the user asked for, with the text the vision model matches against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDescriptor {
    pub name: String,
    pub category: Category,
    pub features: String,
}

/// Box in the vision model's [0, 1000] space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    /// Clamp every coordinate into [0, 1000] and fix inverted edges.
    pub fn normalized(self) -> Self {
        let clamp = |v: f32| {
            if v.is_finite() {
                v.clamp(0.0, NORMALIZED_EXTENT)
            } else {
                0.0
            }
        };
        let (x0, x1) = (clamp(self.x_min), clamp(self.x_max));
        let (y0, y1) = (clamp(self.y_min), clamp(self.y_max));
        Self {
            x_min: x0.min(x1),
            y_min: y0.min(y1),
            x_max: x0.max(x1),
            y_max: y0.max(y1),
        }
    }
}

/// Structured answer of one vision call. Replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionVerdict {
    pub found: bool,
    pub summary: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

fn confidence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"置信度\s*[：:]\s*(\d+)\s*%").expect("confidence pattern is a valid regex")
    })
}

impl DetectionVerdict {
    /// Percentage reported inside the summary (`置信度：NN%`), 0 when absent.
    pub fn confidence(&self) -> u8 {
        extract_confidence(&self.summary)
    }
}

/// Capped at 100. The pattern only captures digits, so a value too long
/// to parse is treated as over the cap.
pub fn extract_confidence(summary: &str) -> u8 {
    confidence_pattern()
        .captures(summary)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().parse::<u32>().map_or(100, |v| v.min(100)) as u8)
        .unwrap_or(0)
}

/// Linear progression of a session. `Error` can be entered from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionStage {
    Input,
    FetchingFeatures,
    ReadyToStream,
    Streaming,
    Error,
}

impl SessionStage {
    pub fn can_advance_to(self, next: SessionStage) -> bool {
        use SessionStage::*;
        matches!(
            (self, next),
            (_, Error)
                | (Input, FetchingFeatures)
                | (Error, FetchingFeatures)
                | (ReadyToStream, FetchingFeatures)
                | (FetchingFeatures, ReadyToStream)
                | (ReadyToStream, Streaming)
                | (Streaming, Input)
                | (Error, Input)
        )
    }

    /// Stages during which a new name may be submitted.
    pub fn accepts_input(self) -> bool {
        self != SessionStage::Streaming
    }
}
