//! Transfer rates derived from successive running-info snapshots.

use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficRate {
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
}

/// Sum every `rx_bytes` / `tx_bytes` counter found under the snapshot's
/// `peers`. `None` when the snapshot has no peer section.
pub fn traffic_totals(info: &Value) -> Option<(u64, u64)> {
    let peers = info.get("peers")?;
    let mut totals = (0, 0);
    accumulate(peers, &mut totals);
    Some(totals)
}

fn accumulate(value: &Value, totals: &mut (u64, u64)) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child.as_u64()) {
                    ("rx_bytes", Some(n)) => totals.0 = totals.0.saturating_add(n),
                    ("tx_bytes", Some(n)) => totals.1 = totals.1.saturating_add(n),
                    _ => accumulate(child, totals),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| accumulate(item, totals)),
        _ => {}
    }
}

#[derive(Debug, Default)]
pub struct TrafficMeter {
    last: Option<(Instant, u64, u64)>,
}

impl TrafficMeter {
    /// Feed one snapshot taken at `at`. Returns a rate once two samples exist.
    /// A counter going backwards (engine restart) restarts the baseline.
    pub fn observe(&mut self, info: &Value, at: Instant) -> Option<TrafficRate> {
        let (rx, tx) = traffic_totals(info)?;
        let previous = self.last.replace((at, rx, tx));
        let (then, last_rx, last_tx) = previous?;
        if rx < last_rx || tx < last_tx {
            tracing::debug!("traffic counters went backwards, resetting baseline");
            return None;
        }
        let elapsed = at.saturating_duration_since(then).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(TrafficRate {
            rx_bytes_per_sec: (rx - last_rx) as f64 / elapsed,
            tx_bytes_per_sec: (tx - last_tx) as f64 / elapsed,
        })
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn snapshot(rx: u64, tx: u64) -> Value {
        json!({
            "peers": [
                {"peer_id": 1, "conns": [{"stats": {"rx_bytes": rx, "tx_bytes": tx}}]},
                {"peer_id": 2, "conns": [{"stats": {"rx_bytes": 100, "tx_bytes": 50}}]}
            ]
        })
    }

    #[test]
    fn totals_sum_nested_counters() {
        assert_eq!(traffic_totals(&snapshot(900, 450)), Some((1000, 500)));
        assert_eq!(traffic_totals(&json!({"my_node_info": {}})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_over_elapsed_time() {
        let mut meter = TrafficMeter::default();
        let t0 = Instant::now();
        assert_eq!(meter.observe(&snapshot(0, 0), t0), None);

        let rate = meter
            .observe(&snapshot(2_000, 1_000), t0 + Duration::from_secs(2))
            .expect("rate");
        assert_eq!(rate.rx_bytes_per_sec, 1_000.0);
        assert_eq!(rate.tx_bytes_per_sec, 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_regression_resets_baseline() {
        let mut meter = TrafficMeter::default();
        let t0 = Instant::now();
        meter.observe(&snapshot(5_000, 5_000), t0);
        assert_eq!(meter.observe(&snapshot(10, 10), t0 + Duration::from_secs(1)), None);

        let rate = meter
            .observe(&snapshot(110, 10), t0 + Duration::from_secs(2))
            .expect("rate from new baseline");
        assert_eq!(rate.rx_bytes_per_sec, 100.0);
        assert_eq!(rate.tx_bytes_per_sec, 0.0);
    }
}
