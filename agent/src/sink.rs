use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use growbot_common::MeasurementSample;

/// Samples kept per device before the oldest are dropped.
const HISTORY_CAP: usize = 1000;

/// Shared in-memory history of everything the workers have measured.
/// Cheap to clone; all clones see the same data.
#[derive(Clone, Default)]
pub struct MeasurementStore {
    inner: Arc<Mutex<HashMap<String, Vec<MeasurementSample>>>>,
}

impl MeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, device_id: &str, samples: &[MeasurementSample]) {
        let mut inner = self.inner.lock().await;
        let history = inner.entry(device_id.to_string()).or_default();
        history.extend_from_slice(samples);
        if history.len() > HISTORY_CAP {
            let excess = history.len() - HISTORY_CAP;
            history.drain(..excess);
        }
    }

    pub async fn history(&self, device_id: &str) -> Vec<MeasurementSample> {
        self.inner
            .lock()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn latest(&self, device_id: &str) -> Vec<MeasurementSample> {
        let inner = self.inner.lock().await;
        let Some(history) = inner.get(device_id) else {
            return Vec::new();
        };
        // The tail samples sharing the newest timestamp form the last reading.
        let Some(last) = history.last() else {
            return Vec::new();
        };
        let mut latest: Vec<MeasurementSample> = history
            .iter()
            .rev()
            .take_while(|sample| sample.timestamp == last.timestamp)
            .cloned()
            .collect();
        latest.reverse();
        latest
    }
}

/// Where finished charts go. The agent itself only assembles the data; a
/// dashboard renderer plugs in behind this trait.
#[async_trait]
pub trait ChartSink: Send + Sync {
    async fn render_history(
        &self,
        device_id: &str,
        samples: &[MeasurementSample],
    ) -> anyhow::Result<()>;

    async fn render_gauge(
        &self,
        device_id: &str,
        samples: &[MeasurementSample],
    ) -> anyhow::Result<()>;
}

/// Default sink: describes what would be drawn and moves on.
pub struct LogChartSink;

#[async_trait]
impl ChartSink for LogChartSink {
    async fn render_history(
        &self,
        device_id: &str,
        samples: &[MeasurementSample],
    ) -> anyhow::Result<()> {
        info!(device = device_id, samples = samples.len(), "history chart refreshed");
        Ok(())
    }

    async fn render_gauge(
        &self,
        device_id: &str,
        samples: &[MeasurementSample],
    ) -> anyhow::Result<()> {
        for sample in samples {
            info!(
                device = device_id,
                quantity = %sample.quantity,
                value = %sample.value,
                unit = %sample.unit,
                "gauge refreshed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, FixedOffset};
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample(quantity: &str, stamp: &str) -> MeasurementSample {
        MeasurementSample {
            timestamp: DateTime::<FixedOffset>::parse_from_rfc3339(stamp).unwrap(),
            quantity: quantity.to_string(),
            value: "1.0".to_string(),
            unit: "x".to_string(),
            minimum: 0.0,
            maximum: 10.0,
        }
    }

    #[tokio::test]
    async fn history_is_per_device_and_ordered() {
        let store = MeasurementStore::new();
        store
            .record("a", &[sample("ph", "2026-03-01T08:00:00+02:00")])
            .await;
        store
            .record("a", &[sample("ph", "2026-03-01T08:05:00+02:00")])
            .await;
        store
            .record("b", &[sample("ec", "2026-03-01T08:00:00+02:00")])
            .await;

        assert_eq!(store.history("a").await.len(), 2);
        assert_eq!(store.history("b").await.len(), 1);
        assert_eq!(store.history("absent").await.len(), 0);
    }

    #[tokio::test]
    async fn latest_returns_the_full_last_reading() {
        let store = MeasurementStore::new();
        store
            .record("hum", &[sample("humidity", "2026-03-01T08:00:00+02:00")])
            .await;
        store
            .record(
                "hum",
                &[
                    sample("humidity", "2026-03-01T08:05:00+02:00"),
                    sample("temperature", "2026-03-01T08:05:00+02:00"),
                ],
            )
            .await;

        let latest = store.latest("hum").await;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].quantity, "humidity");
        assert_eq!(latest[1].quantity, "temperature");
    }

    #[tokio::test]
    async fn history_is_capped() {
        let store = MeasurementStore::new();
        let batch: Vec<_> = (0..600)
            .map(|_| sample("ph", "2026-03-01T08:00:00+02:00"))
            .collect();
        store.record("a", &batch).await;
        store.record("a", &batch).await;

        assert_eq!(store.history("a").await.len(), HISTORY_CAP);
    }
}
