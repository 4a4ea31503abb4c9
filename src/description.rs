//! Remote description service: subject name → (category, visual features).
//!
//! The model answers in loose prose, so the reply is parsed by anchor
//! phrases rather than a schema.

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::DescriptionError;
use crate::feature_store::FeatureStore;
use crate::gemini::{GeminiClient, GenerateRequest};
use crate::types::{Category, SubjectDescriptor};

pub const CATEGORY_ANCHOR: &str = "类别：";
pub const FEATURES_ANCHOR: &str = "视觉特征：";

#[async_trait]
pub trait DescriptionService: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<(Category, String), DescriptionError>;
}

pub fn build_prompt(name: &str) -> String {
    format!(
        "你是一位中药植物视觉专家。请根据【{name}】，输出以下信息：\n\
         1. 类别： (请回答：草本、灌木 或 木本/树木)\n\
         2. 视觉特征： (请以列表形式输出茎、叶、花、果的肉眼可见形态)"
    )
}

/// Recover category and features from the model's free-text reply.
///
/// The category is searched between the category anchor line and the
/// features anchor line; keywords are tried in the order 草本, 木本/树木, 灌木.
pub fn parse_description(text: &str) -> Result<(Category, String), DescriptionError> {
    let lines: Vec<&str> = text.split('\n').collect();
    let category_idx = lines.iter().position(|l| l.contains(CATEGORY_ANCHOR));
    let features_idx = lines.iter().position(|l| l.contains(FEATURES_ANCHOR));

    let category = category_idx.and_then(|start| {
        let end = features_idx.unwrap_or(lines.len());
        let block = lines.get(start..end).unwrap_or_default().join("\n");
        if block.contains("草本") {
            Some(Category::Herbaceous)
        } else if block.contains("木本") || block.contains("树木") {
            Some(Category::Woody)
        } else if block.contains("灌木") {
            Some(Category::Shrub)
        } else {
            None
        }
    });

    let features = match (features_idx, category) {
        (Some(idx), _) => lines[idx + 1..].join("\n").trim().to_string(),
        (None, Some(cat)) => lines
            .iter()
            .position(|l| l.contains(cat.label()))
            .map(|idx| lines[idx + 1..].join("\n").trim().to_string())
            .unwrap_or_default(),
        (None, None) => String::new(),
    };

    match category {
        Some(category) if !features.is_empty() => Ok((category, features)),
        _ => {
            error!(
                "Failed to parse herb details from AI response. Raw text was:\n---\n{}\n---",
                text
            );
            Err(DescriptionError::Parse { raw: text.to_string() })
        }
    }
}

#[async_trait]
impl DescriptionService for GeminiClient {
    async fn fetch(&self, name: &str) -> Result<(Category, String), DescriptionError> {
        let request = GenerateRequest::text(build_prompt(name));
        let reply = self.generate(self.text_model(), &request).await?;
        parse_description(&reply)
    }
}

/// Where a resolved subject came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Cache,
    Remote,
}

/// Cache-first lookup: a stored subject never reaches the remote service.
pub async fn resolve_subject(
    store: &FeatureStore,
    service: &dyn DescriptionService,
    name: &str,
) -> Result<(SubjectDescriptor, Provenance), DescriptionError> {
    if let Some(cached) = store.get(name)? {
        info!("Subject '{}' loaded from feature cache ({})", name, cached.category);
        return Ok((
            SubjectDescriptor {
                name: name.to_string(),
                category: cached.category,
                features: cached.features,
            },
            Provenance::Cache,
        ));
    }

    let (category, features) = service.fetch(name).await?;
    store.put(name, category, &features)?;
    info!(
        "Subject '{}' described remotely: {} ({} chars of features)",
        name,
        category,
        features.chars().count()
    );

    Ok((
        SubjectDescriptor {
            name: name.to_string(),
            category,
            features,
        },
        Provenance::Remote,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_anchors() {
        let reply = "好的。\n1. 类别：草本\n2. 视觉特征：\n- 茎：直立\n- 叶：掌状复叶\n\n";
        let (cat, features) = parse_description(reply).unwrap();
        assert_eq!(cat, Category::Herbaceous);
        assert_eq!(features, "- 茎：直立\n- 叶：掌状复叶");
    }

    #[test]
    fn category_value_on_following_line() {
        let reply = "**类别：**\n木本（乔木）\n**视觉特征：**\n叶片扇形";
        let (cat, features) = parse_description(reply).unwrap();
        assert_eq!(cat, Category::Woody);
        assert_eq!(features, "叶片扇形");
    }

    #[test]
    fn herbaceous_wins_over_later_keywords() {
        let reply = "类别：草本，也有人误认为灌木\n视觉特征：\n矮小";
        assert_eq!(parse_description(reply).unwrap().0, Category::Herbaceous);
    }

    #[test]
    fn tree_keyword_maps_to_woody() {
        let reply = "类别：树木\n视觉特征：\n高大";
        assert_eq!(parse_description(reply).unwrap().0, Category::Woody);
    }

    #[test]
    fn keywords_after_features_anchor_are_ignored_for_category() {
        let reply = "类别：不确定\n视觉特征：\n草本状的叶";
        assert!(matches!(parse_description(reply), Err(DescriptionError::Parse { .. })));
    }

    #[test]
    fn falls_back_to_text_after_category_line() {
        let reply = "类别：灌木\n- 枝条多刺\n- 果实红色";
        let (cat, features) = parse_description(reply).unwrap();
        assert_eq!(cat, Category::Shrub);
        assert_eq!(features, "- 枝条多刺\n- 果实红色");
    }

    #[test]
    fn no_category_anchor_is_a_parse_error() {
        assert!(parse_description("我不知道").is_err());
    }

    #[test]
    fn empty_features_is_a_parse_error() {
        assert!(parse_description("类别：草本\n视觉特征：\n   ").is_err());
    }

    #[test]
    fn prompt_embeds_the_name() {
        let p = build_prompt("人参");
        assert!(p.contains("【人参】"));
        assert!(p.contains(CATEGORY_ANCHOR));
        assert!(p.contains(FEATURES_ANCHOR));
    }
}
