// THEORY:
// The `ThresholdSelector` turns continuous anomaly scores into yes/no decisions. It
// runs once per granularity (image scores, pixel values) per evaluation pass, and the
// value it returns is fixed for that pass.
//
// Key architectural principles:
// 1.  **Manual passes through**: a manual threshold is returned exactly as given,
//     including "none", which means no binarization is applied.
// 2.  **Adaptive is a sweep**: every distinct observed score is a candidate. A score
//     counts as positive when it is `>=` the candidate. The candidate with the best
//     criterion (F1 or Youden's J) wins; ties go to the highest candidate, the
//     first maximum of a sweep that runs from the top score down.
// 3.  **No labels, no threshold**: an adaptive selection without labels, or with only
//     one class present, returns `None` and logs why instead of inventing a value.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdCriterion {
    #[default]
    F1,
    Youden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    #[default]
    Adaptive,
    Manual,
}

/// A resolved threshold setting for one granularity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdSetting {
    Manual(Option<f32>),
    Adaptive(ThresholdCriterion),
}

pub struct ThresholdSelector;

impl ThresholdSelector {
    /// Picks the threshold for `scores`. `labels[i]` is true for anomalous samples.
    pub fn select(scores: &[f32], labels: Option<&[bool]>, setting: ThresholdSetting) -> Option<f32> {
        match setting {
            ThresholdSetting::Manual(value) => value,
            ThresholdSetting::Adaptive(criterion) => {
                let Some(labels) = labels else {
                    tracing::warn!("adaptive threshold requested without labels; no threshold applied");
                    return None;
                };
                Self::adaptive(scores, labels, criterion)
            }
        }
    }

    fn adaptive(scores: &[f32], labels: &[bool], criterion: ThresholdCriterion) -> Option<f32> {
        if scores.len() != labels.len() {
            tracing::warn!(
                scores = scores.len(),
                labels = labels.len(),
                "score and label counts differ; no threshold applied"
            );
            return None;
        }
        let positives = labels.iter().filter(|&&l| l).count();
        let negatives = labels.len() - positives;
        if positives == 0 || negatives == 0 {
            tracing::warn!(positives, negatives, "single-class calibration set; no threshold applied");
            return None;
        }

        let mut pairs: Vec<(f32, bool)> = scores
            .iter()
            .copied()
            .zip(labels.iter().copied())
            .filter(|(s, _)| s.is_finite())
            .collect();
        pairs.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        // Walk candidates from the highest score down, accumulating the confusion counts
        // of "score >= candidate".
        let (p, n) = (positives as f64, negatives as f64);
        let (mut tp, mut fp) = (0.0f64, 0.0f64);
        let mut best: Option<(f64, f32)> = None;
        let mut i = 0;
        while i < pairs.len() {
            let candidate = pairs[i].0;
            while i < pairs.len() && pairs[i].0 == candidate {
                if pairs[i].1 {
                    tp += 1.0;
                } else {
                    fp += 1.0;
                }
                i += 1;
            }
            let value = match criterion {
                ThresholdCriterion::F1 => {
                    let fn_ = p - tp;
                    2.0 * tp / (2.0 * tp + fp + fn_)
                }
                ThresholdCriterion::Youden => tp / p - fp / n,
            };
            // Candidates descend, so `>` keeps the highest threshold on ties.
            if best.is_none_or(|(b, _)| value > b) {
                best = Some((value, candidate));
            }
        }
        best.map(|(_, threshold)| threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_threshold_is_returned_verbatim() {
        assert_eq!(ThresholdSelector::select(&[0.1], None, ThresholdSetting::Manual(Some(0.37))), Some(0.37));
        assert_eq!(ThresholdSelector::select(&[0.1], None, ThresholdSetting::Manual(None)), None);
    }

    #[test]
    fn f1_separates_perfectly_split_scores() {
        let scores = [0.1, 0.2, 0.3, 0.7, 0.8];
        let labels = [false, false, false, true, true];
        let t = ThresholdSelector::select(&scores, Some(&labels), ThresholdSetting::Adaptive(ThresholdCriterion::F1));
        assert_eq!(t, Some(0.7));
    }

    #[test]
    fn youden_ties_resolve_to_highest_threshold() {
        // Candidates 0.9 and 0.8 both give J = 0.5; 0.9 wins as the first maximum.
        let scores = [0.9, 0.85, 0.8, 0.1];
        let labels = [true, false, true, false];
        let t = ThresholdSelector::select(&scores, Some(&labels), ThresholdSetting::Adaptive(ThresholdCriterion::Youden));
        assert_eq!(t, Some(0.9));
    }

    #[test]
    fn single_class_or_missing_labels_yield_none() {
        let adaptive = ThresholdSetting::Adaptive(ThresholdCriterion::F1);
        assert_eq!(ThresholdSelector::select(&[0.1, 0.2], Some(&[false, false]), adaptive), None);
        assert_eq!(ThresholdSelector::select(&[0.1, 0.2], None, adaptive), None);
    }
}
