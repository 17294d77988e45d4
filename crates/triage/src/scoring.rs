use std::collections::BTreeMap;

use crate::types::{
    Candidate, ClusterScore, Disposition, Features, SafetyFlags, ScoringResult,
    TemperatureScaling, Thresholds, Weights,
};
use crate::{Result, TriageError};

/// 聚类无法识别时使用的保留标签
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

const RAG_MISS_THRESHOLD: f64 = 0.10;

/// 限制到 `[0, 1]`，NaN 原样返回，交给评分阶段报告
pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// 越界特征只截断，不拒绝
pub fn validate_and_clamp_features(features: &Features) -> Features {
    let clamped = Features {
        ocr_confidence: clamp01(features.ocr_confidence),
        error_code_match: clamp01(features.error_code_match),
        cluster_prior: clamp01(features.cluster_prior),
        rag_similarity: clamp01(features.rag_similarity),
    };
    if features.has_nan() {
        log::warn!("[Triage] 特征包含 NaN: {:?}", features);
    } else if clamped != *features {
        log::warn!("[Triage] 特征越界，已截断: {:?}", features);
    }
    clamped
}

pub fn compute_raw_score(features: &Features, weights: &Weights, label: &str) -> f64 {
    weights.w1 * features.ocr_confidence
        + weights.w2 * features.error_code_match
        + weights.w3 * features.cluster_prior
        + weights.w4 * features.rag_similarity
        + weights.bias_for(label)
}

/// 先减去最大值再取指数；指数和下溢为 0 时返回均匀分布
pub fn softmax(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();

    if sum == 0.0 {
        let uniform = 1.0 / scores.len() as f64;
        return vec![uniform; scores.len()];
    }

    exps.into_iter().map(|e| e / sum).collect()
}

pub fn softmax_with_temperature(scores: &[f64], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = scores.iter().map(|s| s / temperature).collect();
    softmax(&scaled)
}

/// `1 - max(P)`，空分布返回 `1.0`
pub fn misclassification_probability(probabilities: &[f64]) -> f64 {
    if probabilities.is_empty() {
        return 1.0;
    }
    let max = probabilities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    1.0 - max
}

pub fn check_safety_rules(features: &Features, top: Option<&Candidate>) -> SafetyFlags {
    SafetyFlags {
        rag_miss: features.rag_similarity < RAG_MISS_THRESHOLD,
        unknown_error: top.map_or(false, |c| c.label == UNKNOWN_LABEL),
    }
}

/// 安全规则优先，命中任意一条直接升级
pub fn decide(p_mis: f64, thresholds: &Thresholds, flags: &SafetyFlags) -> Disposition {
    if flags.any() {
        return Disposition::Escalate;
    }

    if p_mis < thresholds.auto {
        Disposition::AutoResolve
    } else if p_mis < thresholds.escalate {
        Disposition::AskClarification
    } else {
        Disposition::Escalate
    }
}

pub fn score_clusters(
    candidates: &[Candidate],
    features: &Features,
    weights: &Weights,
    thresholds: &Thresholds,
    temperature: Option<&TemperatureScaling>,
) -> Result<ScoringResult> {
    let features = validate_and_clamp_features(features);

    let raw: Vec<f64> = candidates
        .iter()
        .map(|c| compute_raw_score(&features, weights, &c.label))
        .collect();

    if let Some(pos) = raw.iter().position(|s| !s.is_finite()) {
        return Err(TriageError::DegenerateScores(format!(
            "候选 {} 得分为 {}",
            candidates[pos].id, raw[pos]
        )));
    }

    let probabilities = match temperature.and_then(TemperatureScaling::effective) {
        Some(t) => softmax_with_temperature(&raw, t),
        None => softmax(&raw),
    };

    if probabilities.iter().any(|p| p.is_nan()) {
        return Err(TriageError::DegenerateScores(
            "softmax 结果包含 NaN".to_string(),
        ));
    }

    // 并列时取输入顺序中的第一个
    let top_index = probabilities
        .iter()
        .enumerate()
        .fold(None::<(usize, f64)>, |best, (i, &p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
        .map(|(i, _)| i);

    let top_candidate = top_index.map(|i| candidates[i].clone());
    let p_mis = misclassification_probability(&probabilities);
    let safety_flags = check_safety_rules(&features, top_candidate.as_ref());
    let decision = decide(p_mis, thresholds, &safety_flags);

    let scores: Vec<ClusterScore> = candidates
        .iter()
        .zip(raw.iter().zip(probabilities.iter()))
        .map(|(c, (&raw_score, &probability))| ClusterScore {
            candidate_id: c.id.clone(),
            candidate_label: c.label.clone(),
            raw_score,
            probability,
        })
        .collect();

    let all_scores: BTreeMap<String, f64> = scores
        .iter()
        .map(|s| (s.candidate_id.clone(), s.raw_score))
        .collect();
    let all_probabilities: BTreeMap<String, f64> = scores
        .iter()
        .map(|s| (s.candidate_id.clone(), s.probability))
        .collect();

    log::debug!(
        "[Triage] {} candidates, pMis={:.4}, flags={:?} -> {}",
        candidates.len(),
        p_mis,
        safety_flags,
        decision
    );

    Ok(ScoringResult {
        decision,
        top_score: top_index.map(|i| raw[i]),
        top_probability: top_index.map(|i| probabilities[i]),
        top_candidate,
        misclassification_prob: p_mis,
        scores,
        all_scores,
        all_probabilities,
        safety_flags,
        features,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-5;

    fn features(ocr: f64, err: f64, prior: f64, rag: f64) -> Features {
        Features {
            ocr_confidence: ocr,
            error_code_match: err,
            cluster_prior: prior,
            rag_similarity: rag,
        }
    }

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(0.5), 0.5);
        assert_eq!(clamp01(1.5), 1.0);
        assert!(clamp01(f64::NAN).is_nan());
    }

    #[test]
    fn test_clamp_features() {
        let f = validate_and_clamp_features(&features(1.2, -0.1, 0.4, 0.9));
        assert_eq!(f, features(1.0, 0.0, 0.4, 0.9));
    }

    #[test]
    fn test_raw_score() {
        let f = features(1.0, 0.5, 0.5, 1.0);
        let mut w = Weights::default();
        assert!((compute_raw_score(&f, &w, "x") - 0.75).abs() < EPS);
        w.per_candidate_biases.insert("x".into(), 0.25);
        assert!((compute_raw_score(&f, &w, "x") - 1.0).abs() < EPS);
    }

    #[test]
    fn test_softmax_properties() {
        let cases: Vec<Vec<f64>> = vec![
            vec![0.0],
            vec![1.0, 2.0, 3.0],
            vec![1000.0, 999.0, -1000.0],
            vec![-5.0, -5.0],
            vec![0.3, 0.31, 0.29, 0.0, 12.0],
        ];
        for scores in cases {
            let p = softmax(&scores);
            assert_eq!(p.len(), scores.len());
            let sum: f64 = p.iter().sum();
            assert!((sum - 1.0).abs() < EPS, "sum {} for {:?}", sum, scores);
            assert!(p.iter().all(|&x| (0.0..=1.0).contains(&x)));
        }
        assert!((softmax(&[42.0])[0] - 1.0).abs() < EPS);
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn test_softmax_temperature_flattens() {
        let scores = [1.0, 2.0];
        let sharp = softmax(&scores);
        let flat = softmax_with_temperature(&scores, 10.0);
        assert!(flat[1] < sharp[1]);
        assert!(flat[1] > 0.5);
    }

    #[test]
    fn test_misclassification_probability() {
        assert!((misclassification_probability(&[0.7, 0.2, 0.1]) - 0.3).abs() < EPS);
        assert!(misclassification_probability(&[1.0, 0.0, 0.0]).abs() < EPS);
        assert!((misclassification_probability(&[0.5, 0.5]) - 0.5).abs() < EPS);
        assert_eq!(misclassification_probability(&[]), 1.0);
    }

    #[test]
    fn test_decide() {
        let t = Thresholds::default();
        let none = SafetyFlags::default();
        assert_eq!(decide(0.10, &t, &none), Disposition::AutoResolve);
        assert_eq!(decide(0.30, &t, &none), Disposition::AskClarification);
        assert_eq!(decide(0.60, &t, &none), Disposition::Escalate);

        // 边界值归入更严格的一档
        assert_eq!(decide(0.15, &t, &none), Disposition::AskClarification);
        assert_eq!(decide(0.50, &t, &none), Disposition::Escalate);

        let rag = SafetyFlags { rag_miss: true, unknown_error: false };
        let unknown = SafetyFlags { rag_miss: false, unknown_error: true };
        assert_eq!(decide(0.05, &t, &rag), Disposition::Escalate);
        assert_eq!(decide(0.05, &t, &unknown), Disposition::Escalate);
    }

    #[test]
    fn test_safety_rules_are_independent() {
        let unknown = Candidate::new("c1", UNKNOWN_LABEL);
        let flags = check_safety_rules(&features(1.0, 1.0, 1.0, 0.05), Some(&unknown));
        assert!(flags.rag_miss && flags.unknown_error);

        let known = Candidate::new("c1", "error_001");
        let flags = check_safety_rules(&features(1.0, 1.0, 1.0, 0.5), Some(&known));
        assert!(!flags.any());
    }

    #[test]
    fn test_score_clusters_single_candidate() {
        let candidates = vec![Candidate::new("c1", "error_001")];
        let r = score_clusters(
            &candidates,
            &features(0.9, 0.9, 0.9, 0.9),
            &Weights::default(),
            &Thresholds::default(),
            None,
        )
        .unwrap();
        assert_eq!(r.decision, Disposition::AutoResolve);
        assert_eq!(r.top_candidate.unwrap().id, "c1");
        assert!((r.top_probability.unwrap() - 1.0).abs() < EPS);
        assert!(r.misclassification_prob.abs() < EPS);
    }

    #[test]
    fn test_score_clusters_bias_picks_top() {
        let candidates = vec![
            Candidate::new("a", "error_001"),
            Candidate::new("b", "error_002"),
        ];
        let mut w = Weights::default();
        w.per_candidate_biases.insert("error_002".into(), 5.0);
        let r = score_clusters(
            &candidates,
            &features(0.5, 0.5, 0.5, 0.5),
            &w,
            &Thresholds::default(),
            None,
        )
        .unwrap();
        assert_eq!(r.top_candidate.as_ref().unwrap().id, "b");
        assert_eq!(r.decision, Disposition::AutoResolve);
        assert_eq!(r.scores.len(), 2);
        assert_eq!(r.scores[0].candidate_id, "a");
        assert!((r.all_probabilities.values().sum::<f64>() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_score_clusters_tie_and_safety() {
        let candidates = vec![
            Candidate::new("a", UNKNOWN_LABEL),
            Candidate::new("b", "error_002"),
        ];
        let r = score_clusters(
            &candidates,
            &features(0.5, 0.5, 0.5, 0.5),
            &Weights::default(),
            &Thresholds::default(),
            None,
        )
        .unwrap();
        // 并列时取第一个，它是 UNKNOWN
        assert_eq!(r.top_candidate.as_ref().unwrap().id, "a");
        assert!((r.misclassification_prob - 0.5).abs() < EPS);
        assert!(r.safety_flags.unknown_error);
        assert_eq!(r.decision, Disposition::Escalate);
    }

    #[test]
    fn test_score_clusters_temperature() {
        let candidates = vec![
            Candidate::new("a", "error_001"),
            Candidate::new("b", "error_002"),
        ];
        let mut w = Weights::default();
        w.per_candidate_biases.insert("error_001".into(), 2.0);
        let f = features(0.5, 0.5, 0.5, 0.5);
        let plain = score_clusters(&candidates, &f, &w, &Thresholds::default(), None).unwrap();
        let scaling = TemperatureScaling {
            temperature: 4.0,
            enabled: true,
            last_calibrated: None,
        };
        let scaled =
            score_clusters(&candidates, &f, &w, &Thresholds::default(), Some(&scaling)).unwrap();
        assert!(scaled.misclassification_prob > plain.misclassification_prob);

        let disabled = TemperatureScaling {
            enabled: false,
            ..scaling
        };
        let same =
            score_clusters(&candidates, &f, &w, &Thresholds::default(), Some(&disabled)).unwrap();
        assert!((same.misclassification_prob - plain.misclassification_prob).abs() < EPS);
    }

    #[test]
    fn test_score_clusters_empty() {
        let r = score_clusters(
            &[],
            &features(0.9, 0.9, 0.9, 0.9),
            &Weights::default(),
            &Thresholds::default(),
            None,
        )
        .unwrap();
        assert!(r.top_candidate.is_none());
        assert_eq!(r.misclassification_prob, 1.0);
        assert_eq!(r.decision, Disposition::Escalate);
        assert!(r.all_scores.is_empty());
    }

    #[test]
    fn test_score_clusters_degenerate() {
        let candidates = vec![Candidate::new("a", "error_001")];
        let w = Weights {
            w1: f64::NAN,
            ..Weights::default()
        };
        let r = score_clusters(
            &candidates,
            &features(0.5, 0.5, 0.5, 0.5),
            &w,
            &Thresholds::default(),
            None,
        );
        assert!(matches!(r, Err(TriageError::DegenerateScores(_))));
    }

    #[test]
    fn test_nan_feature_is_degenerate() {
        let candidates = vec![Candidate::new("a", "error_001"), Candidate::new("b", "error_002")];
        let r = score_clusters(
            &candidates,
            &features(0.9, f64::NAN, 0.9, 0.9),
            &Weights::default(),
            &Thresholds::default(),
            None,
        );
        match r {
            Err(TriageError::DegenerateScores(msg)) => assert!(msg.contains("候选 a")),
            other => panic!("expected DegenerateScores, got {:?}", other),
        }
    }

    #[test]
    fn test_result_serializes_for_audit() {
        let candidates = vec![Candidate::new("b", "x"), Candidate::new("a", "y")];
        let r = score_clusters(
            &candidates,
            &features(0.5, 0.5, 0.5, 0.5),
            &Weights::default(),
            &Thresholds::default(),
            None,
        )
        .unwrap();
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["decision"], "ESCALATE");
        let keys: Vec<&String> = json["all_scores"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
