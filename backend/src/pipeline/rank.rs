use serde::{Deserialize, Serialize};
use shared::{Prediction, ScoreScale};

use super::classify::ClassScore;

/// Presentation options for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RankOptions {
    /// Keep only the first K entries after sorting; `None` keeps every class.
    pub top_k: Option<usize>,
    pub scale: ScoreScale,
    pub include_logits: bool,
}

impl RankOptions {
    pub fn top(k: usize) -> Self {
        Self {
            top_k: Some(k),
            ..Self::default()
        }
    }
}

/// Sort by probability (descending, stable), truncate, then scale and round.
///
/// Ordering uses full precision; rounding only touches the returned values.
pub fn rank(scored: &[ClassScore], options: &RankOptions) -> Vec<Prediction> {
    let mut order: Vec<&ClassScore> = scored.iter().collect();
    order.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    if let Some(k) = options.top_k {
        order.truncate(k);
    }

    order
        .into_iter()
        .map(|score| Prediction {
            class_name: score.label.clone(),
            probability: present(score.probability, options.scale),
            logit: options.include_logits.then_some(score.logit),
        })
        .collect()
}

fn present(probability: f32, scale: ScoreScale) -> f32 {
    let scaled = probability * scale.factor();
    let rounded = (scaled * 100.0).round() / 100.0;
    rounded.clamp(0.0, scale.max())
}
