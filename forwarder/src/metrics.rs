//! Prometheus text exposition of upstream metrics.
//!
//! Renders the same per-upstream state the status API serves, in the
//! text format scrapers expect, at `GET /metrics`.

use common::{StatusSnapshot, UpstreamSnapshot};
use std::fmt::Write;

fn gauge<F>(out: &mut String, name: &str, help: &str, upstreams: &[UpstreamSnapshot], value: F)
where
    F: Fn(&UpstreamSnapshot) -> f64,
{
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    for u in upstreams {
        let _ = writeln!(out, "{}{{upstream=\"{}\"}} {}", name, u.tag, value(u));
    }
}

/// Render the forwarder status as Prometheus text exposition format.
pub fn render_prometheus(status: &StatusSnapshot) -> String {
    let mut out = String::with_capacity(4096);
    let upstreams = &status.upstreams;

    gauge(
        &mut out,
        "pathmux_upstream_score",
        "Overall upstream quality score (0-100).",
        upstreams,
        |u| u.score_overall,
    );
    gauge(
        &mut out,
        "pathmux_upstream_score_tcp",
        "TCP upstream quality score (0-100).",
        upstreams,
        |u| u.score_tcp,
    );
    gauge(
        &mut out,
        "pathmux_upstream_score_udp",
        "UDP upstream quality score (0-100).",
        upstreams,
        |u| u.score_udp,
    );
    gauge(
        &mut out,
        "pathmux_upstream_rtt_ms",
        "Smoothed RTT in milliseconds.",
        upstreams,
        |u| u.rtt_ms,
    );
    gauge(
        &mut out,
        "pathmux_upstream_jitter_ms",
        "Smoothed jitter in milliseconds.",
        upstreams,
        |u| u.jitter_ms,
    );
    gauge(
        &mut out,
        "pathmux_upstream_loss",
        "Worse of retransmit and loss rate (0.0-1.0).",
        upstreams,
        |u| u.loss,
    );
    gauge(
        &mut out,
        "pathmux_upstream_up_bps",
        "Smoothed upload bandwidth in bits per second.",
        upstreams,
        |u| u.up_bps,
    );
    gauge(
        &mut out,
        "pathmux_upstream_down_bps",
        "Smoothed download bandwidth in bits per second.",
        upstreams,
        |u| u.down_bps,
    );
    gauge(
        &mut out,
        "pathmux_upstream_utilization",
        "Traffic utilization against measured capacity (0.0-1.0).",
        upstreams,
        |u| u.utilization,
    );
    gauge(
        &mut out,
        "pathmux_upstream_usable",
        "Whether the upstream can take new flows (1) or not (0).",
        upstreams,
        |u| if u.usable { 1.0 } else { 0.0 },
    );
    gauge(
        &mut out,
        "pathmux_upstream_reachable",
        "Whether ICMP probing considers the upstream reachable.",
        upstreams,
        |u| if u.reachable { 1.0 } else { 0.0 },
    );
    gauge(
        &mut out,
        "pathmux_upstream_active",
        "Whether this upstream currently takes new flows.",
        upstreams,
        |u| if u.active { 1.0 } else { 0.0 },
    );
    gauge(
        &mut out,
        "pathmux_upstream_dial_failures",
        "Consecutive dial failures.",
        upstreams,
        |u| u.consecutive_dial_failures as f64,
    );

    let _ = writeln!(
        out,
        "# HELP pathmux_flows Live flow count by protocol."
    );
    let _ = writeln!(out, "# TYPE pathmux_flows gauge");
    let _ = writeln!(out, "pathmux_flows{{proto=\"tcp\"}} {}", status.tcp_flows);
    let _ = writeln!(out, "pathmux_flows{{proto=\"udp\"}} {}", status.udp_flows);

    let _ = writeln!(
        out,
        "# HELP pathmux_skipped_measurements_total Measurements deferred by the scheduler gates."
    );
    let _ = writeln!(out, "# TYPE pathmux_skipped_measurements_total counter");
    let _ = writeln!(
        out,
        "pathmux_skipped_measurements_total {}",
        status.skipped_measurements
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> StatusSnapshot {
        let mut upstream = UpstreamSnapshot::default();
        upstream.tag = "wan0".to_string();
        upstream.score_overall = 72.5;
        upstream.usable = true;
        upstream.active = true;
        StatusSnapshot {
            mode: "auto".to_string(),
            active_tag: Some("wan0".to_string()),
            warmup: false,
            skipped_measurements: 3,
            tcp_flows: 2,
            udp_flows: 1,
            upstreams: vec![upstream],
        }
    }

    #[test]
    fn test_renders_expected_series() {
        let text = render_prometheus(&status());
        assert!(text.contains("pathmux_upstream_score{upstream=\"wan0\"} 72.5"));
        assert!(text.contains("pathmux_upstream_active{upstream=\"wan0\"} 1"));
        assert!(text.contains("pathmux_flows{proto=\"tcp\"} 2"));
        assert!(text.contains("pathmux_skipped_measurements_total 3"));
    }

    #[test]
    fn test_help_and_type_lines_present() {
        let text = render_prometheus(&status());
        for line in text.lines() {
            if line.starts_with("# TYPE") {
                assert!(line.ends_with("gauge") || line.ends_with("counter"));
            }
        }
        assert!(text.contains("# HELP pathmux_upstream_rtt_ms"));
    }
}
