//! Aggregation of per-interval server reports into a measurement result.
//!
//! Every bandwidth statistic here is derived only from
//! `SampleStopResult::intervals`, so two aggregations of identical
//! reports always agree.

use common::{Proto, SampleStopResult, INTERVAL_MS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Intervals that make up one sustained-peak window (1 s).
const PEAK_WINDOW_INTERVALS: usize = (1000 / INTERVAL_MS) as usize;

/// RTT summary from the control-channel sampler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RttStats {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    /// Population standard deviation of inter-sample differences.
    pub jitter_ms: f64,
    pub samples: usize,
}

/// Aggregated outcome of one probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Results {
    pub network: Proto,
    pub reverse: bool,
    /// Wall-clock duration of the whole run.
    pub duration: Duration,
    /// Samples that produced a report.
    pub samples: u32,
    pub total_bytes: u64,

    /// Mean of per-interval rates with the top and bottom deciles dropped.
    pub trimmed_mean_bps: f64,
    /// Best contiguous 1 s window.
    pub peak_1s_bps: f64,
    pub p80_bps: f64,
    pub p90_bps: f64,

    pub rtt: RttStats,

    /// TCP: retransmitted / sent segments over the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrans_rate: Option<f64>,
    /// UDP: lost / expected datagrams over the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_lost: Option<u64>,
}

/// Duration of interval `idx` within a report, milliseconds.
fn interval_ms(report: &SampleStopResult, idx: usize) -> u64 {
    if idx + 1 == report.intervals.len() && report.last_interval_ms > 0 {
        report.last_interval_ms
    } else {
        INTERVAL_MS
    }
}

/// Flatten all reports into per-interval rates, in order.
pub fn interval_rates(reports: &[SampleStopResult]) -> Vec<f64> {
    let mut rates = Vec::new();
    for report in reports {
        for (idx, interval) in report.intervals.iter().enumerate() {
            let ms = interval_ms(report, idx);
            if ms > 0 {
                rates.push(interval.bytes as f64 * 8.0 / (ms as f64 / 1000.0));
            }
        }
    }
    rates
}

/// Mean with the lowest and highest deciles dropped. Falls back to the
/// plain mean when trimming would consume everything.
pub fn trimmed_mean(rates: &[f64]) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    let mut sorted = rates.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let trim = sorted.len() / 10;
    let kept = &sorted[trim..sorted.len() - trim];
    let kept = if kept.is_empty() { &sorted[..] } else { kept };
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Nearest-rank percentile, `p` in (0, 100].
pub fn percentile(rates: &[f64], p: f64) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    let mut sorted = rates.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((p / 100.0 * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Best sustained 1 s window: the max rate over any run of
/// [`PEAK_WINDOW_INTERVALS`] consecutive intervals within one sample
/// (whole sample when shorter).
pub fn peak_1s(reports: &[SampleStopResult]) -> f64 {
    let mut peak: f64 = 0.0;
    for report in reports {
        let n = report.intervals.len();
        if n == 0 {
            continue;
        }
        let window = PEAK_WINDOW_INTERVALS.min(n);
        for start in 0..=(n - window) {
            let mut bytes = 0u64;
            let mut ms = 0u64;
            for idx in start..start + window {
                bytes += report.intervals[idx].bytes;
                ms += interval_ms(report, idx);
            }
            if ms > 0 {
                peak = peak.max(bytes as f64 * 8.0 / (ms as f64 / 1000.0));
            }
        }
    }
    peak
}

/// Min/mean/max plus jitter as the population standard deviation of the
/// differences between consecutive samples.
pub fn rtt_stats(samples: &[f64]) -> RttStats {
    if samples.is_empty() {
        return RttStats::default();
    }
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;

    let jitter = if samples.len() >= 2 {
        let diffs: Vec<f64> = samples.windows(2).map(|w| w[1] - w[0]).collect();
        let diff_mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let variance =
            diffs.iter().map(|d| (d - diff_mean).powi(2)).sum::<f64>() / diffs.len() as f64;
        variance.sqrt()
    } else {
        0.0
    };

    RttStats {
        min_ms: min,
        mean_ms: mean,
        max_ms: max,
        jitter_ms: jitter,
        samples: samples.len(),
    }
}

/// Combine sample reports and RTT samples into the run result.
/// `tcp_client_counters` carries the client-side `(retransmits,
/// segments_sent)` delta for forward TCP runs, where the sender's kernel
/// is on this side of the wire.
pub fn aggregate(
    network: Proto,
    reverse: bool,
    reports: &[SampleStopResult],
    rtt_samples: &[f64],
    tcp_client_counters: Option<(u64, u64)>,
    duration: Duration,
) -> Results {
    let rates = interval_rates(reports);
    let total_bytes = reports.iter().map(|r| r.total_bytes).sum();

    let (retrans_rate, loss_rate, packets_received, packets_lost) = match network {
        Proto::Tcp => {
            let (retrans, segs) = if reverse {
                (
                    reports.iter().filter_map(|r| r.tcp_retransmits).sum::<u64>(),
                    reports
                        .iter()
                        .filter_map(|r| r.tcp_segments_sent)
                        .sum::<u64>(),
                )
            } else {
                tcp_client_counters.unwrap_or((0, 0))
            };
            let rate = if segs > 0 {
                Some(retrans as f64 / segs as f64)
            } else {
                Some(0.0)
            };
            (rate, None, None, None)
        }
        Proto::Udp => {
            let received: u64 = reports.iter().filter_map(|r| r.packets_received).sum();
            let lost: u64 = reports.iter().filter_map(|r| r.packets_lost).sum();
            let expected = received + lost;
            let rate = if expected > 0 {
                Some(lost as f64 / expected as f64)
            } else {
                Some(0.0)
            };
            (None, rate, Some(received), Some(lost))
        }
    };

    Results {
        network,
        reverse,
        duration,
        samples: reports.len() as u32,
        total_bytes,
        trimmed_mean_bps: trimmed_mean(&rates),
        peak_1s_bps: peak_1s(reports),
        p80_bps: percentile(&rates, 80.0),
        p90_bps: percentile(&rates, 90.0),
        rtt: rtt_stats(rtt_samples),
        retrans_rate,
        loss_rate,
        packets_received,
        packets_lost,
    }
}
