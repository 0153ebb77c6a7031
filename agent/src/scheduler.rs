use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use growbot_common::{
    ActionConfig, ActionKind, DeviceConfig, MeasurementSample, QueueEntry,
};

use crate::device::ezo::CalibrationRequest;
use crate::device::Device;
use crate::queue::QueueStore;
use crate::sink::{ChartSink, MeasurementStore};

/// Pending-action queue of one worker, kept in total order: priority
/// descending, scheduled time ascending, insertion order breaking ties.
/// Pure state; the async loop around it stays thin.
pub struct WorkerState {
    entries: Vec<QueueEntry>,
    next_seq: u64,
}

impl WorkerState {
    pub fn from_loaded(entries: Vec<QueueEntry>) -> Self {
        let next_seq = entries.len() as u64;
        let mut state = Self { entries, next_seq };
        state.entries.sort();
        state
    }

    /// Enqueues the configured default actions, skipping any kind that is
    /// already pending so a restart does not double-book recurring work.
    pub fn seed_defaults(&mut self, actions: &[ActionConfig], now: DateTime<FixedOffset>) {
        for action in actions {
            if self.entries.iter().any(|entry| entry.kind == action.kind) {
                continue;
            }
            self.admit(QueueEntry::new(
                action.kind,
                now,
                action.priority,
                action.interval_secs,
            ));
        }
    }

    pub fn admit(&mut self, mut entry: QueueEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(entry);
        self.entries.sort();
    }

    /// Removes and returns the queue head once its scheduled time arrives.
    /// Only the head is ever considered: a high-priority entry scheduled for
    /// later holds the device until it runs.
    pub fn pop_due(&mut self, now: DateTime<FixedOffset>) -> Option<QueueEntry> {
        if self.entries.first()?.scheduled_at <= now {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    /// Re-enqueues a finished recurring entry one interval from now, at its
    /// original priority. One-shot entries are gone once executed.
    pub fn reschedule(&mut self, finished: &QueueEntry, now: DateTime<FixedOffset>) {
        if let Some(interval) = finished.interval_secs {
            self.admit(QueueEntry::new(
                finished.kind,
                now + chrono::Duration::seconds(interval as i64),
                finished.priority,
                Some(interval),
            ));
        }
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// The entries eligible for the on-disk snapshot. Close entries are
    /// transient; a persisted one would replay on restart and permanently
    /// kill the worker.
    pub fn persistable(&self) -> Vec<QueueEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind != ActionKind::Close)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live handle to one spawned device worker.
pub struct WorkerHandle {
    pub device_id: String,
    pub inbox: mpsc::Sender<QueueEntry>,
    pub join: JoinHandle<()>,
}

pub fn now_in(tz: Tz) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&tz).fixed_offset()
}

/// Spawns the worker task owning `device`. The worker loads its persisted
/// queue, seeds configured defaults, then loops: admit external entries, run
/// everything due, persist. A close entry ends the loop for good.
pub fn spawn_worker(
    device: Device,
    config: DeviceConfig,
    store: QueueStore,
    measurements: MeasurementStore,
    sink: Arc<dyn ChartSink>,
    tz: Tz,
    cycle: Duration,
) -> WorkerHandle {
    let (inbox, rx) = mpsc::channel(32);
    let device_id = device.id().to_string();

    let id = device_id.clone();
    let join = tokio::spawn(async move {
        if let Err(err) = run_worker(device, config, store, measurements, sink, tz, cycle, rx).await
        {
            error!(device = %id, error = %err, "worker stopped on error");
        }
    });

    WorkerHandle {
        device_id,
        inbox,
        join,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    mut device: Device,
    config: DeviceConfig,
    store: QueueStore,
    measurements: MeasurementStore,
    sink: Arc<dyn ChartSink>,
    tz: Tz,
    cycle: Duration,
    mut rx: mpsc::Receiver<QueueEntry>,
) -> Result<()> {
    let id = device.id().to_string();

    let loaded = store.load().await?;
    let restored = loaded.len();
    let mut state = WorkerState::from_loaded(loaded);
    state.seed_defaults(&config.actions, now_in(tz));
    store.persist(&state.persistable()).await?;
    info!(device = %id, restored, pending = state.entries().len(), "worker started");

    let mut ticker = tokio::time::interval(cycle);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut inbox_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            received = rx.recv(), if inbox_open => {
                match received {
                    Some(entry) => {
                        state.admit(entry);
                        store.persist(&state.persistable()).await?;
                    }
                    // A closed inbox is not a stop signal; the close entry is.
                    None => inbox_open = false,
                }
            }
        }

        while let Ok(entry) = rx.try_recv() {
            state.admit(entry);
        }

        let mut dirty = false;
        while let Some(entry) = state.pop_due(now_in(tz)) {
            dirty = true;

            if entry.kind == ActionKind::Close {
                info!(device = %id, pending = state.entries().len(), "worker closing");
                store.persist(&state.persistable()).await?;
                return Ok(());
            }

            match execute(&mut device, &config, &entry, &measurements, sink.as_ref(), tz).await {
                Ok(()) => {}
                Err(err) => {
                    warn!(device = %id, action = %entry.kind, error = %err, "action failed");
                }
            }
            state.reschedule(&entry, now_in(tz));
        }

        if dirty {
            store
                .persist(&state.persistable())
                .await
                .context("persisting queue")?;
        }
    }
}

async fn execute(
    device: &mut Device,
    config: &DeviceConfig,
    entry: &QueueEntry,
    measurements: &MeasurementStore,
    sink: &dyn ChartSink,
    tz: Tz,
) -> Result<()> {
    let id = device.id().to_string();
    match entry.kind {
        ActionKind::Measure => {
            let samples = device.measure(now_in(tz)).await?;
            let shaped = shape_samples(samples, config);
            for sample in &shaped {
                info!(
                    device = %id,
                    quantity = %sample.quantity,
                    value = %sample.value,
                    unit = %sample.unit,
                    "measured"
                );
            }
            measurements.record(&id, &shaped).await;
        }
        ActionKind::Calibrate => {
            let points = device.calibrate(CalibrationRequest::Query).await?;
            info!(device = %id, points, "calibration checked");
        }
        ActionKind::Dispense => {
            let volume = config
                .dispense_ml
                .ok_or_else(|| anyhow!("no dispense volume configured"))?;
            device.dispense(volume).await?;
            info!(device = %id, volume, "dispensed");
        }
        ActionKind::HistoryPlot => {
            let history = measurements.history(&id).await;
            sink.render_history(&id, &history).await?;
        }
        ActionKind::GaugePlot => {
            let latest = measurements.latest(&id).await;
            sink.render_gauge(&id, &latest).await?;
        }
        // Handled by the worker loop before execution.
        ActionKind::Close => {}
    }
    Ok(())
}

/// Applies the deployment's field selection and per-field overrides to a raw
/// reading. An empty field list keeps everything.
fn shape_samples(samples: Vec<MeasurementSample>, config: &DeviceConfig) -> Vec<MeasurementSample> {
    samples
        .into_iter()
        .filter(|sample| {
            config.fields.is_empty() || config.fields.iter().any(|f| *f == sample.quantity)
        })
        .map(|mut sample| {
            if let Some(over) = config.overrides.get(&sample.quantity) {
                if let Some(minimum) = over.minimum {
                    sample.minimum = minimum;
                }
                if let Some(maximum) = over.maximum {
                    sample.maximum = maximum;
                }
                if let Some(unit) = &over.unit {
                    sample.unit = unit.clone();
                }
            }
            sample
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::DateTime;
    use pretty_assertions::assert_eq;

    use growbot_common::{DeviceModel, FieldOverride};

    use super::*;

    fn at(offset_secs: i64) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-01T08:00:00+02:00").unwrap()
            + chrono::Duration::seconds(offset_secs)
    }

    #[test]
    fn seed_skips_kinds_already_pending() {
        let pending = vec![QueueEntry::new(ActionKind::Measure, at(600), 1, Some(300))];
        let mut state = WorkerState::from_loaded(pending);

        state.seed_defaults(&growbot_common::config::default_actions(), at(0));

        // Measure was already pending, so only the plot action is seeded.
        let kinds: Vec<_> = state.entries().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Measure, ActionKind::HistoryPlot]);
    }

    #[test]
    fn pop_due_executes_in_priority_then_time_order() {
        let mut state = WorkerState::from_loaded(Vec::new());
        state.admit(QueueEntry::new(ActionKind::Measure, at(-10), 1, None));
        state.admit(QueueEntry::new(ActionKind::Calibrate, at(-5), 5, None));

        assert_eq!(state.pop_due(at(0)).unwrap().kind, ActionKind::Calibrate);
        assert_eq!(state.pop_due(at(0)).unwrap().kind, ActionKind::Measure);
        assert!(state.pop_due(at(0)).is_none());
    }

    #[test]
    fn an_undue_head_holds_the_device() {
        let mut state = WorkerState::from_loaded(Vec::new());
        state.admit(QueueEntry::new(ActionKind::GaugePlot, at(60), 9, None));
        state.admit(QueueEntry::new(ActionKind::Measure, at(-10), 1, None));

        // The high-priority future entry is the head; nothing runs before it.
        assert!(state.pop_due(at(0)).is_none());
        assert_eq!(state.pop_due(at(60)).unwrap().kind, ActionKind::GaugePlot);
        assert_eq!(state.pop_due(at(60)).unwrap().kind, ActionKind::Measure);
    }

    #[test]
    fn close_entries_stay_out_of_the_snapshot() {
        let mut state = WorkerState::from_loaded(Vec::new());
        state.admit(QueueEntry::new(ActionKind::Measure, at(0), 1, Some(300)));
        state.admit(QueueEntry::new(ActionKind::Close, at(5), i32::MAX, None));

        let snapshot = state.persistable();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, ActionKind::Measure);
        // The close entry itself stays live in memory.
        assert_eq!(state.entries().len(), 2);
    }

    #[test]
    fn close_outranks_everything() {
        let mut state = WorkerState::from_loaded(Vec::new());
        state.admit(QueueEntry::new(ActionKind::Measure, at(-10), 100, None));
        state.admit(QueueEntry::new(ActionKind::Close, at(0), i32::MAX, None));

        assert_eq!(state.pop_due(at(0)).unwrap().kind, ActionKind::Close);
    }

    #[test]
    fn recurring_entries_come_back_at_the_same_priority() {
        let mut state = WorkerState::from_loaded(Vec::new());
        state.admit(QueueEntry::new(ActionKind::Measure, at(0), 4, Some(300)));

        let entry = state.pop_due(at(0)).unwrap();
        assert!(state.is_empty());
        state.reschedule(&entry, at(1));

        let next = &state.entries()[0];
        assert_eq!(next.kind, ActionKind::Measure);
        assert_eq!(next.priority, 4);
        assert_eq!(next.scheduled_at, at(301));
        assert_eq!(next.interval_secs, Some(300));
    }

    #[test]
    fn one_shot_entries_do_not_come_back() {
        let mut state = WorkerState::from_loaded(Vec::new());
        state.admit(QueueEntry::new(ActionKind::Calibrate, at(0), 5, None));

        let entry = state.pop_due(at(0)).unwrap();
        state.reschedule(&entry, at(0));

        assert!(state.is_empty());
    }

    #[test]
    fn shaping_filters_fields_and_applies_overrides() {
        let samples = vec![
            MeasurementSample {
                timestamp: at(0),
                quantity: "conductivity".into(),
                value: "1413".into(),
                unit: "μS/cm".into(),
                minimum: 0.07,
                maximum: 500_000.0,
            },
            MeasurementSample {
                timestamp: at(0),
                quantity: "salinity".into(),
                value: "0.73".into(),
                unit: "PSU".into(),
                minimum: 0.0,
                maximum: 42.0,
            },
        ];

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "conductivity".to_string(),
            FieldOverride {
                minimum: None,
                maximum: Some(3000.0),
                unit: None,
            },
        );
        let config = DeviceConfig {
            model: DeviceModel::Ec,
            address: Some(0x64),
            fields: vec!["conductivity".into()],
            overrides,
            actions: Vec::new(),
            dispense_ml: None,
            pressure_unit: None,
        };

        let shaped = shape_samples(samples, &config);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].quantity, "conductivity");
        assert_eq!(shaped[0].maximum, 3000.0);
        assert_eq!(shaped[0].minimum, 0.07);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_measures_and_closes() {
        use crate::device::cpu::CpuSensor;
        use crate::sink::LogChartSink;

        let dir = std::env::temp_dir().join("growbot-worker-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let zone = dir.join("temp");
        tokio::fs::write(&zone, "52000\n").await.unwrap();

        let device = Device::Cpu(CpuSensor::with_path("cpu", zone));
        let config = DeviceConfig {
            model: DeviceModel::Cpu,
            address: None,
            fields: Vec::new(),
            overrides: BTreeMap::new(),
            actions: vec![ActionConfig {
                kind: ActionKind::Measure,
                interval_secs: Some(60),
                priority: 1,
            }],
            dispense_ml: None,
            pressure_unit: None,
        };
        let store = QueueStore::new(&dir, "cpu");
        let _ = tokio::fs::remove_file(store.path()).await;
        let measurements = MeasurementStore::new();

        let handle = spawn_worker(
            device,
            config,
            store,
            measurements.clone(),
            Arc::new(LogChartSink),
            chrono_tz::UTC,
            Duration::from_millis(10),
        );

        // Let the seeded measure action run at least once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let history = measurements.history("cpu").await;
        assert!(!history.is_empty());
        assert_eq!(history[0].value, "52.0");

        handle
            .inbox
            .send(QueueEntry::new(
                ActionKind::Close,
                now_in(chrono_tz::UTC),
                i32::MAX,
                None,
            ))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.join)
            .await
            .expect("worker did not close")
            .unwrap();

        // The close entry itself is not persisted.
        let store = QueueStore::new(&dir, "cpu");
        let remaining = store.load().await.unwrap();
        assert!(remaining.iter().all(|entry| entry.kind != ActionKind::Close));
    }
}
