//! Remote vision service: one JPEG frame + feature text → `DetectionVerdict`.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::VisionError;
use crate::gemini::{GeminiClient, GenerateRequest};
use crate::types::DetectionVerdict;

#[async_trait]
pub trait VisionService: Send + Sync {
    async fn analyze(&self, jpeg: &[u8], features: &str) -> Result<DetectionVerdict, VisionError>;
}

pub fn build_prompt(features: &str) -> String {
    format!(
        "这是一张摄像头实时拍摄的植物图片。请根据以下已知的目标植物视觉特征，判断图片中是否存在该植物。\n\
         ---\n\
         已知视觉特征:\n\
         {features}\n\
         ---\n\
         请严格按照 JSON 格式输出结果，包含是否找到(\"found\")，一个总结(\"summary\")，以及一个边界框(\"box\")。\
         总结中必须包含置信度百分比。边界框坐标必须是0-1000范围内的归一化整数。如果未找到，返回一个覆盖全图的默认框。"
    )
}

/// Response schema handed to the model; every field is required.
pub fn detection_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "found": { "type": "BOOLEAN" },
            "summary": { "type": "STRING" },
            "box": {
                "type": "OBJECT",
                "properties": {
                    "x_min": { "type": "NUMBER" },
                    "y_min": { "type": "NUMBER" },
                    "x_max": { "type": "NUMBER" },
                    "y_max": { "type": "NUMBER" }
                },
                "required": ["x_min", "y_min", "x_max", "y_max"]
            }
        },
        "required": ["found", "summary", "box"]
    })
}

/// Parse the model's JSON reply. Box coordinates are clamped to [0, 1000].
pub fn parse_verdict(text: &str) -> Result<DetectionVerdict, VisionError> {
    let body = strip_code_fence(text);
    let mut verdict: DetectionVerdict = serde_json::from_str(body).map_err(|e| {
        warn!("Failed to parse JSON response from Gemini: {}", e);
        VisionError::InvalidResponse(e.to_string())
    })?;
    verdict.bbox = verdict.bbox.normalized();
    Ok(verdict)
}

fn strip_code_fence(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Encode a frame the way it is uploaded (baseline JPEG at `quality`).
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, VisionError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(frame)?;
    Ok(buf)
}

#[async_trait]
impl VisionService for GeminiClient {
    async fn analyze(&self, jpeg: &[u8], features: &str) -> Result<DetectionVerdict, VisionError> {
        let request = GenerateRequest::jpeg_with_schema(jpeg, build_prompt(features), detection_schema());
        let reply = self.generate(self.vision_model(), &request).await?;
        parse_verdict(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schema_reply() {
        let v = parse_verdict(
            r#"{"found": true, "summary": "画面中央疑似人参，置信度：76%", "box": {"x_min": 120, "y_min": 300, "x_max": 640, "y_max": 910}}"#,
        )
        .unwrap();
        assert!(v.found);
        assert_eq!(v.confidence(), 76);
        assert_eq!(v.bbox.y_max, 910.0);
    }

    #[test]
    fn fenced_reply_is_accepted() {
        let v = parse_verdict("```json\n{\"found\":false,\"summary\":\"未找到\",\"box\":{\"x_min\":0,\"y_min\":0,\"x_max\":1000,\"y_max\":1000}}\n```").unwrap();
        assert!(!v.found);
    }

    #[test]
    fn out_of_range_box_is_clamped() {
        let v = parse_verdict(
            r#"{"found":true,"summary":"置信度：50%","box":{"x_min":-20,"y_min":10,"x_max":1400,"y_max":20}}"#,
        )
        .unwrap();
        assert_eq!(v.bbox.x_min, 0.0);
        assert_eq!(v.bbox.x_max, 1000.0);
    }

    #[test]
    fn malformed_json_is_invalid_response() {
        assert!(matches!(parse_verdict("{found: yes"), Err(VisionError::InvalidResponse(_))));
    }

    #[test]
    fn missing_required_field_is_invalid_response() {
        assert!(matches!(
            parse_verdict(r#"{"found":true,"summary":"置信度：50%"}"#),
            Err(VisionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn schema_requires_all_fields() {
        let s = detection_schema();
        assert_eq!(s["required"], json!(["found", "summary", "box"]));
        assert_eq!(s["properties"]["box"]["required"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let frame = RgbImage::from_pixel(8, 8, image::Rgb([40, 200, 40]));
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn prompt_embeds_features() {
        assert!(build_prompt("- 叶：掌状复叶").contains("已知视觉特征:\n- 叶：掌状复叶\n---"));
    }
}
