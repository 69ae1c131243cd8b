//! Adaptive page-readiness detection: load, network-stable, and DOM-stable
//! phases under a single wall-clock deadline. Best-effort by contract — a
//! deadline expiry logs and reports ready anyway.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use crate::cdp::CdpClient;

/// Polling cadence for the network-stable phase.
const NETWORK_POLL: Duration = Duration::from_millis(50);

/// Length of the network learning window.
const NETWORK_LEARNING_WINDOW: Duration = Duration::from_secs(2);

/// Polling cadence for the DOM-stable phase.
const DOM_POLL: Duration = Duration::from_millis(100);

/// Length of the DOM learning window.
const DOM_LEARNING_WINDOW: Duration = Duration::from_secs(1);

/// Installs a mutation probe on the page; idempotent per document.
const MUTATION_PROBE_INSTALL: &str = r"(() => {
if (window.__bdgMutationProbe) { window.__bdgMutationProbe.count = 0; return; }
const probe = { count: 0, last: Date.now() };
probe.observer = new MutationObserver((records) => {
  probe.count += records.length;
  probe.last = Date.now();
});
probe.observer.observe(document.documentElement, {
  childList: true, subtree: true, attributes: true, characterData: true,
});
window.__bdgMutationProbe = probe;
})()";

/// Tears the probe down. Always evaluated on phase exit.
const MUTATION_PROBE_REMOVE: &str = r"(() => {
const probe = window.__bdgMutationProbe;
if (probe) { probe.observer.disconnect(); delete window.__bdgMutationProbe; }
})()";

/// What each phase observed. Informational only — readiness never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessReport {
    pub load_complete: bool,
    pub network_stable: bool,
    pub dom_stable: bool,
    /// Whether the overall deadline cut any phase short.
    pub deadline_hit: bool,
}

/// Pick the network idle threshold from the learned mean inter-arrival
/// interval. `None` means too few requests arrived to learn from.
fn network_idle_threshold(mean_interval_ms: Option<f64>) -> Duration {
    match mean_interval_ms {
        Some(mean) if mean < 100.0 => Duration::from_millis(200),
        Some(mean) if mean < 500.0 => Duration::from_millis(500),
        _ => Duration::from_millis(1000),
    }
}

/// Pick the DOM stability threshold from the learned mutation rate per
/// second.
fn dom_stable_threshold(mutations_per_sec: f64) -> Duration {
    if mutations_per_sec > 50.0 {
        Duration::from_millis(1000)
    } else if mutations_per_sec > 10.0 {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(300)
    }
}

/// Mean of the inter-arrival intervals between consecutive arrival stamps.
fn mean_interval_ms(arrivals: &[Instant]) -> Option<f64> {
    if arrivals.len() < 2 {
        return None;
    }
    let total: Duration = arrivals
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    Some(total.as_secs_f64() * 1000.0 / (arrivals.len() - 1) as f64)
}

/// Wait until the page has stabilised, running the three phases in order
/// under one deadline. Each navigation re-runs the whole sequence.
pub async fn await_page_ready(client: &CdpClient, deadline: Duration) -> ReadinessReport {
    let cutoff = Instant::now() + deadline;
    let mut report = ReadinessReport::default();

    report.load_complete = phase_load(client, cutoff).await;
    if !report.load_complete {
        report.deadline_hit = true;
        tracing::info!("readiness: load phase hit the deadline, continuing");
    }

    report.network_stable = phase_network_stable(client, cutoff).await;
    if !report.network_stable {
        report.deadline_hit = true;
        tracing::info!("readiness: network phase hit the deadline, continuing");
    }

    report.dom_stable = phase_dom_stable(client, cutoff).await;
    if !report.dom_stable {
        report.deadline_hit = true;
        tracing::info!("readiness: DOM phase hit the deadline, continuing");
    }

    report
}

fn remaining(cutoff: Instant) -> Duration {
    cutoff.saturating_duration_since(Instant::now())
}

/// Phase 1: the document has loaded.
async fn phase_load(client: &CdpClient, cutoff: Instant) -> bool {
    if client.send_command("Page.enable", None).await.is_err() {
        return false;
    }

    // Subscribe before probing readyState so a load firing in between is
    // not missed.
    let Ok(mut load_rx) = client.subscribe("Page.loadEventFired").await else {
        return false;
    };

    let ready_state = client
        .send_command(
            "Runtime.evaluate",
            Some(json!({"expression": "document.readyState", "returnByValue": true})),
        )
        .await;
    if let Ok(result) = ready_state {
        if result["result"]["value"].as_str() == Some("complete") {
            return true;
        }
    }

    tokio::time::timeout(remaining(cutoff), load_rx.recv())
        .await
        .is_ok()
}

/// Phase 2: the network has gone quiet.
async fn phase_network_stable(client: &CdpClient, cutoff: Instant) -> bool {
    if client.send_command("Network.enable", None).await.is_err() {
        return false;
    }
    let Ok(mut sent_rx) = client.subscribe("Network.requestWillBeSent").await else {
        return false;
    };
    let Ok(mut fin_rx) = client.subscribe("Network.loadingFinished").await else {
        return false;
    };
    let Ok(mut fail_rx) = client.subscribe("Network.loadingFailed").await else {
        return false;
    };

    let mut in_flight: i64 = 0;
    let mut arrivals: Vec<Instant> = Vec::new();
    let mut last_activity = Instant::now();

    // Learning window: record inter-arrival intervals and track in-flight.
    let learn_end = (Instant::now() + NETWORK_LEARNING_WINDOW).min(cutoff);
    while Instant::now() < learn_end {
        tokio::select! {
            event = sent_rx.recv() => {
                if event.is_none() { return false; }
                in_flight += 1;
                arrivals.push(Instant::now());
                last_activity = Instant::now();
            }
            event = fin_rx.recv() => {
                if event.is_none() { return false; }
                in_flight -= 1;
                last_activity = Instant::now();
            }
            event = fail_rx.recv() => {
                if event.is_none() { return false; }
                in_flight -= 1;
                last_activity = Instant::now();
            }
            () = tokio::time::sleep_until(learn_end) => break,
        }
    }

    let threshold = network_idle_threshold(mean_interval_ms(&arrivals));
    tracing::debug!(
        "readiness: network idle threshold {}ms from {} arrivals",
        threshold.as_millis(),
        arrivals.len()
    );

    // Poll for quiet: zero in-flight and no activity for the threshold.
    loop {
        if Instant::now() >= cutoff {
            return false;
        }
        if in_flight <= 0 && last_activity.elapsed() >= threshold {
            return true;
        }
        tokio::select! {
            event = sent_rx.recv() => {
                if event.is_none() { return false; }
                in_flight += 1;
                last_activity = Instant::now();
            }
            event = fin_rx.recv() => {
                if event.is_none() { return false; }
                in_flight -= 1;
                last_activity = Instant::now();
            }
            event = fail_rx.recv() => {
                if event.is_none() { return false; }
                in_flight -= 1;
                last_activity = Instant::now();
            }
            () = tokio::time::sleep(NETWORK_POLL) => {}
        }
    }
}

/// Phase 3: DOM mutations have settled. The observer is always
/// disconnected on exit.
async fn phase_dom_stable(client: &CdpClient, cutoff: Instant) -> bool {
    let installed = client
        .send_command(
            "Runtime.evaluate",
            Some(json!({"expression": MUTATION_PROBE_INSTALL})),
        )
        .await
        .is_ok();
    if !installed {
        return false;
    }

    let stable = dom_stable_inner(client, cutoff).await;

    // Teardown runs on every path, including deadline expiry.
    let _ = client
        .send_command(
            "Runtime.evaluate",
            Some(json!({"expression": MUTATION_PROBE_REMOVE})),
        )
        .await;

    stable
}

async fn dom_stable_inner(client: &CdpClient, cutoff: Instant) -> bool {
    let learn_end = (Instant::now() + DOM_LEARNING_WINDOW).min(cutoff);
    let learn_started = Instant::now();
    tokio::time::sleep_until(learn_end).await;

    let count = client
        .send_command(
            "Runtime.evaluate",
            Some(json!({
                "expression": "window.__bdgMutationProbe ? window.__bdgMutationProbe.count : 0",
                "returnByValue": true,
            })),
        )
        .await
        .ok()
        .and_then(|r| r["result"]["value"].as_f64())
        .unwrap_or(0.0);
    let learn_secs = learn_started.elapsed().as_secs_f64().max(0.001);
    let threshold = dom_stable_threshold(count / learn_secs);
    tracing::debug!(
        "readiness: DOM stability threshold {}ms from {count} mutations",
        threshold.as_millis()
    );

    loop {
        if Instant::now() >= cutoff {
            return false;
        }
        let quiet_ms = client
            .send_command(
                "Runtime.evaluate",
                Some(json!({
                    "expression":
                        "window.__bdgMutationProbe ? Date.now() - window.__bdgMutationProbe.last : 1e9",
                    "returnByValue": true,
                })),
            )
            .await
            .ok()
            .and_then(|r| r["result"]["value"].as_f64());
        match quiet_ms {
            #[allow(clippy::cast_precision_loss)]
            Some(quiet) if quiet >= threshold.as_millis() as f64 => return true,
            Some(_) => {}
            // The evaluate failed (navigation in progress, transport gone):
            // treat as not-yet-stable and let the deadline bound us.
            None => {}
        }
        tokio::time::sleep(DOM_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_thresholds_follow_learned_mean() {
        assert_eq!(
            network_idle_threshold(Some(50.0)),
            Duration::from_millis(200)
        );
        assert_eq!(
            network_idle_threshold(Some(99.9)),
            Duration::from_millis(200)
        );
        assert_eq!(
            network_idle_threshold(Some(100.0)),
            Duration::from_millis(500)
        );
        assert_eq!(
            network_idle_threshold(Some(499.0)),
            Duration::from_millis(500)
        );
        assert_eq!(
            network_idle_threshold(Some(500.0)),
            Duration::from_millis(1000)
        );
        assert_eq!(network_idle_threshold(None), Duration::from_millis(1000));
    }

    #[test]
    fn dom_thresholds_follow_mutation_rate() {
        assert_eq!(dom_stable_threshold(80.0), Duration::from_millis(1000));
        assert_eq!(dom_stable_threshold(50.1), Duration::from_millis(1000));
        assert_eq!(dom_stable_threshold(50.0), Duration::from_millis(500));
        assert_eq!(dom_stable_threshold(11.0), Duration::from_millis(500));
        assert_eq!(dom_stable_threshold(10.0), Duration::from_millis(300));
        assert_eq!(dom_stable_threshold(0.0), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn mean_interval_needs_two_samples() {
        assert!(mean_interval_ms(&[]).is_none());
        assert!(mean_interval_ms(&[Instant::now()]).is_none());
    }

    #[tokio::test]
    async fn mean_interval_averages_gaps() {
        let base = Instant::now();
        let arrivals = vec![
            base,
            base + Duration::from_millis(100),
            base + Duration::from_millis(300),
        ];
        // Gaps of 100ms and 200ms → mean 150ms.
        let mean = mean_interval_ms(&arrivals).unwrap();
        assert!((mean - 150.0).abs() < 1.0, "got {mean}");
    }
}
