// Risk aggregation - turns detector results into one verdict.
//
// Pure and deterministic: no I/O, no clock, no randomness. Float addition is
// not associative, so contributions are sorted before summing; the same set
// of results yields bit-identical output whatever order it arrives in.

use super::engine_config::EngineConfig;
use super::moderation_models::{DetectorResult, RiskLevel};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub overall_risk: f64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
}

fn in_unit_range(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

/// Whether a result may contribute to the risk sum.
fn contributes(result: &DetectorResult) -> bool {
    !result.used_fallback && in_unit_range(result.score) && in_unit_range(result.confidence)
}

fn ordered_sum(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    values.into_iter().sum()
}

/// `overall_risk = min(1, sum(weight(category) * score))` over contributing
/// results; `confidence` is the mean confidence over all results, with
/// fallback and malformed entries counting as zero.
pub fn aggregate(results: &[DetectorResult], config: &EngineConfig) -> RiskAssessment {
    if results.is_empty() {
        return RiskAssessment {
            overall_risk: 0.0,
            risk_level: config.thresholds.classify(0.0),
            confidence: 0.0,
        };
    }

    let weighted: Vec<f64> = results
        .iter()
        .filter(|r| contributes(r))
        .map(|r| config.weight_for(r.category) * r.score)
        .collect();
    let overall_risk = ordered_sum(weighted).clamp(0.0, 1.0);

    let confidences: Vec<f64> = results
        .iter()
        .map(|r| if contributes(r) { r.confidence } else { 0.0 })
        .collect();
    let confidence = (ordered_sum(confidences) / results.len() as f64).clamp(0.0, 1.0);

    RiskAssessment {
        overall_risk,
        risk_level: config.thresholds.classify(overall_risk),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::engine_errors::ModerationError;
    use crate::core::moderation::health_monitor::CircuitState;
    use crate::core::moderation::moderation_models::DetectorCategory;

    fn scored(category: DetectorCategory, score: f64, confidence: f64) -> DetectorResult {
        DetectorResult {
            detector_name: category.to_string(),
            category,
            score,
            confidence,
            categories: Vec::new(),
            latency_ms: 12,
            used_fallback: false,
            error: None,
            circuit_state: CircuitState::Closed,
        }
    }

    fn fallback(category: DetectorCategory) -> DetectorResult {
        DetectorResult::fallback(
            category.as_str(),
            category,
            10_000,
            CircuitState::Closed,
            &ModerationError::DetectorTimeout {
                detector: category.to_string(),
                timeout_ms: 10_000,
            },
        )
    }

    #[test]
    fn test_saturating_sum_is_clamped_to_one() {
        let results = vec![
            scored(DetectorCategory::Toxicity, 0.9, 0.9),
            scored(DetectorCategory::Spam, 0.9, 0.9),
            scored(DetectorCategory::Nsfw, 0.9, 0.9),
            scored(DetectorCategory::Fraud, 0.9, 0.9),
        ];

        let weighted: f64 = 0.30 * 0.9 + 0.25 * 0.9 + 0.25 * 0.9 + 0.40 * 0.9;
        assert!((weighted - 1.08).abs() < 1e-9);

        let assessment = aggregate(&results, &EngineConfig::default());
        assert_eq!(assessment.overall_risk, 1.0);
        assert_eq!(assessment.risk_level, RiskLevel::Critical);
        assert!((assessment.confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_fallbacks_contribute_nothing_but_dilute_confidence() {
        let results = vec![
            scored(DetectorCategory::Toxicity, 0.5, 0.8),
            fallback(DetectorCategory::Spam),
        ];

        let assessment = aggregate(&results, &EngineConfig::default());
        assert!((assessment.overall_risk - 0.15).abs() < 1e-12);
        assert_eq!(assessment.risk_level, RiskLevel::Low);
        assert!((assessment.confidence - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_order_does_not_matter() {
        let mut results = vec![
            scored(DetectorCategory::Toxicity, 0.31, 0.71),
            scored(DetectorCategory::Spam, 0.17, 0.93),
            scored(DetectorCategory::ThreatPattern, 0.53, 0.44),
            scored(DetectorCategory::Behavioral, 0.29, 0.61),
            fallback(DetectorCategory::Nsfw),
        ];
        let config = EngineConfig::default();
        let expected = aggregate(&results, &config);

        for _ in 0..results.len() {
            results.rotate_left(1);
            assert_eq!(aggregate(&results, &config), expected);
        }
        results.reverse();
        assert_eq!(aggregate(&results, &config), expected);
    }

    #[test]
    fn test_malformed_entries_are_ignored() {
        let results = vec![
            scored(DetectorCategory::Toxicity, f64::NAN, 0.9),
            scored(DetectorCategory::Spam, 2.0, 0.9),
        ];
        let assessment = aggregate(&results, &EngineConfig::default());
        assert_eq!(assessment.overall_risk, 0.0);
        assert_eq!(assessment.confidence, 0.0);
        assert_eq!(assessment.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn test_empty_input_is_safe() {
        let assessment = aggregate(&[], &EngineConfig::default());
        assert_eq!(assessment.overall_risk, 0.0);
        assert_eq!(assessment.confidence, 0.0);
        assert_eq!(assessment.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn test_risk_always_in_unit_interval_and_matches_table() {
        let config = EngineConfig::default();
        for step in 0..=20 {
            let score = step as f64 / 20.0;
            let results = vec![
                scored(DetectorCategory::Fraud, score, 1.0),
                scored(DetectorCategory::ThreatPattern, score, 1.0),
                scored(DetectorCategory::Toxicity, score, 1.0),
            ];
            let a = aggregate(&results, &config);
            assert!((0.0..=1.0).contains(&a.overall_risk));
            assert_eq!(a.risk_level, config.thresholds.classify(a.overall_risk));
        }
    }
}
