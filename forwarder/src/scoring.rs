//! Score computation for upstream quality.
//!
//! Each sub-metric maps to a normalized sub-score against its configured
//! reference value; the per-protocol score is a weighted geometric mean
//! of the sub-scores, scaled to [0, 100]. Utilization and bias apply as
//! multipliers on the per-protocol scores before the cross-protocol
//! blend.

use crate::config::{ProtoScoringConfig, UtilizationConfig};

/// Sub-score floor, keeping the geometric mean away from hard zero.
const SCORE_EPSILON: f64 = 1e-3;

/// Bias multiplier clamp range.
const BIAS_MULT_MIN: f64 = 0.67;
const BIAS_MULT_MAX: f64 = 1.5;

/// Inputs to one protocol's score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub bw_up_bps: f64,
    pub bw_down_bps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Retransmit rate (TCP) or loss rate (UDP).
    pub loss: f64,
}

/// Inputs substituted for a stale or never-measured protocol: bandwidth
/// halved from reference, latency/jitter/loss doubled. Stale upstreams
/// are outscored by fresh ones but stay selectable.
pub fn degraded_inputs(cfg: &ProtoScoringConfig) -> ScoreInputs {
    ScoreInputs {
        bw_up_bps: cfg.ref_bandwidth_up_bps / 2.0,
        bw_down_bps: cfg.ref_bandwidth_down_bps / 2.0,
        rtt_ms: cfg.ref_rtt_ms * 2.0,
        jitter_ms: cfg.ref_jitter_ms * 2.0,
        loss: cfg.ref_loss * 2.0,
    }
}

/// Bandwidth sub-score: saturating rise toward 1 at the reference.
fn bandwidth_subscore(bw_bps: f64, reference: f64) -> f64 {
    (1.0 - (-bw_bps.max(0.0) / reference).exp()).max(SCORE_EPSILON)
}

/// Decay sub-score for metrics where smaller is better.
fn decay_subscore(value: f64, reference: f64) -> f64 {
    (-value.max(0.0) / reference).exp().max(SCORE_EPSILON)
}

/// Weighted geometric mean of the sub-scores, scaled to [0, 100].
/// Weights are normalized to sum to 1.
pub fn protocol_score(inputs: &ScoreInputs, cfg: &ProtoScoringConfig) -> f64 {
    let weights = [
        cfg.weight_bandwidth_up,
        cfg.weight_bandwidth_down,
        cfg.weight_rtt,
        cfg.weight_jitter,
        cfg.weight_loss,
    ];
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }

    let subscores = [
        bandwidth_subscore(inputs.bw_up_bps, cfg.ref_bandwidth_up_bps),
        bandwidth_subscore(inputs.bw_down_bps, cfg.ref_bandwidth_down_bps),
        decay_subscore(inputs.rtt_ms, cfg.ref_rtt_ms),
        decay_subscore(inputs.jitter_ms, cfg.ref_jitter_ms),
        decay_subscore(inputs.loss, cfg.ref_loss),
    ];

    let mut score = 1.0;
    for (subscore, weight) in subscores.iter().zip(weights.iter()) {
        score *= subscore.powf(weight / total);
    }
    clamp_score(100.0 * score)
}

/// Penalty for carrying live traffic:
/// `m_min + (1 - m_min) * exp(-(u / u0)^p)`. Identity when disabled or
/// idle.
pub fn utilization_multiplier(utilization: f64, cfg: &UtilizationConfig) -> f64 {
    if !cfg.enabled || utilization <= 0.0 {
        return 1.0;
    }
    cfg.min_multiplier
        + (1.0 - cfg.min_multiplier) * (-(utilization / cfg.threshold).powf(cfg.exponent)).exp()
}

/// Operator preference: `clamp(exp(kappa * bias), 0.67, 1.5)`.
pub fn bias_multiplier(bias: f64, kappa: f64) -> f64 {
    (kappa * bias).exp().clamp(BIAS_MULT_MIN, BIAS_MULT_MAX)
}

/// Cross-protocol blend over the protocols that are fresh.
pub fn blend(
    tcp_score: Option<f64>,
    udp_score: Option<f64>,
    tcp_weight: f64,
    udp_weight: f64,
) -> f64 {
    let score = match (tcp_score, udp_score) {
        (Some(tcp), Some(udp)) => {
            let total = tcp_weight + udp_weight;
            if total <= 0.0 {
                0.0
            } else {
                (tcp_weight * tcp + udp_weight * udp) / total
            }
        }
        (Some(tcp), None) => tcp,
        (None, Some(udp)) => udp,
        (None, None) => 0.0,
    };
    clamp_score(score)
}

pub fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ProtoScoringConfig {
        ProtoScoringConfig::default_tcp()
    }

    fn good_inputs() -> ScoreInputs {
        ScoreInputs {
            bw_up_bps: 200_000_000.0,
            bw_down_bps: 800_000_000.0,
            rtt_ms: 5.0,
            jitter_ms: 1.0,
            loss: 0.0005,
        }
    }

    #[test]
    fn test_score_in_range() {
        let inputs = [
            good_inputs(),
            ScoreInputs {
                bw_up_bps: 0.0,
                bw_down_bps: 0.0,
                rtt_ms: 10_000.0,
                jitter_ms: 10_000.0,
                loss: 1.0,
            },
            degraded_inputs(&cfg()),
        ];
        for input in inputs {
            let score = protocol_score(&input, &cfg());
            assert!((0.0..=100.0).contains(&score), "score {} out of range", score);
        }
    }

    #[test]
    fn test_better_metrics_score_higher() {
        let good = protocol_score(&good_inputs(), &cfg());
        let mut worse = good_inputs();
        worse.rtt_ms = 100.0;
        let worse_score = protocol_score(&worse, &cfg());
        assert!(good > worse_score);

        let mut lossy = good_inputs();
        lossy.loss = 0.05;
        assert!(good > protocol_score(&lossy, &cfg()));

        let mut slow = good_inputs();
        slow.bw_up_bps = 1_000_000.0;
        assert!(good > protocol_score(&slow, &cfg()));
    }

    #[test]
    fn test_degraded_scores_below_reference() {
        let reference = ScoreInputs {
            bw_up_bps: cfg().ref_bandwidth_up_bps,
            bw_down_bps: cfg().ref_bandwidth_down_bps,
            rtt_ms: cfg().ref_rtt_ms,
            jitter_ms: cfg().ref_jitter_ms,
            loss: cfg().ref_loss,
        };
        let fresh = protocol_score(&reference, &cfg());
        let degraded = protocol_score(&degraded_inputs(&cfg()), &cfg());
        assert!(degraded < fresh);
        assert!(degraded > 0.0);
    }

    #[test]
    fn test_bias_multiplier_clamped() {
        let mut bias = -1.0;
        while bias <= 1.0 {
            let mult = bias_multiplier(bias, 0.4);
            assert!((BIAS_MULT_MIN..=BIAS_MULT_MAX).contains(&mult));
            bias += 0.05;
        }
        assert_eq!(bias_multiplier(0.0, 0.4), 1.0);
        assert!(bias_multiplier(1.0, 0.4) > 1.0);
        assert!(bias_multiplier(-1.0, 0.4) < 1.0);
        // Steep kappa saturates at the clamp.
        assert_eq!(bias_multiplier(1.0, 10.0), BIAS_MULT_MAX);
        assert_eq!(bias_multiplier(-1.0, 10.0), BIAS_MULT_MIN);
    }

    #[test]
    fn test_utilization_multiplier_shape() {
        let cfg = UtilizationConfig::default();
        assert_eq!(utilization_multiplier(0.0, &cfg), 1.0);
        let light = utilization_multiplier(0.1, &cfg);
        let heavy = utilization_multiplier(0.9, &cfg);
        assert!(light > heavy);
        assert!(heavy >= cfg.min_multiplier);
        assert!(light <= 1.0);

        let disabled = UtilizationConfig {
            enabled: false,
            ..UtilizationConfig::default()
        };
        assert_eq!(utilization_multiplier(0.9, &disabled), 1.0);
    }

    #[test]
    fn test_blend_freshness_cases() {
        assert_eq!(blend(Some(80.0), Some(60.0), 0.5, 0.5), 70.0);
        assert_eq!(blend(Some(80.0), None, 0.5, 0.5), 80.0);
        assert_eq!(blend(None, Some(60.0), 0.5, 0.5), 60.0);
        assert_eq!(blend(None, None, 0.5, 0.5), 0.0);
        // Uneven weights.
        assert_eq!(blend(Some(100.0), Some(0.0), 0.75, 0.25), 75.0);
    }

    #[test]
    fn test_identical_inputs_identical_scores() {
        let a = protocol_score(&good_inputs(), &cfg());
        let b = protocol_score(&good_inputs(), &cfg());
        assert_eq!(a, b);
    }
}
