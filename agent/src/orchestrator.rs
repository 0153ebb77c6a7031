use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use growbot_common::config::merge_config;
use growbot_common::{
    ActionKind, AppConfig, DeviceConfig, DeviceModel, MeasurementSample, QueueEntry,
};

use crate::bus::{BusTransport, SimulatedEnvironmental, SimulatedProbe};
use crate::device::Device;
use crate::queue::QueueStore;
use crate::scheduler::{now_in, spawn_worker, WorkerHandle};
use crate::sink::{ChartSink, LogChartSink, MeasurementStore};

/// Path to a JSON config overriding the built-in defaults.
const CONFIG_ENV: &str = "GROWBOT_CONFIG";
/// Directory holding the persisted per-device queues.
const DATA_DIR_ENV: &str = "GROWBOT_DATA_DIR";
const DEFAULT_DATA_DIR: &str = ".growbot";

/// Workers get this long to drain after the close entry before being cut off.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Built-in deployment: just the host CPU thermometer. Real deployments add
/// their bus devices on top through the config file.
pub fn default_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.devices.insert(
        "cpu".to_string(),
        DeviceConfig {
            model: DeviceModel::Cpu,
            address: None,
            fields: Vec::new(),
            overrides: Default::default(),
            actions: Vec::new(),
            dispense_ml: None,
            pressure_unit: None,
        },
    );
    config
}

fn transport_for(model: DeviceModel) -> Option<Box<dyn BusTransport>> {
    if model.is_probe_module() {
        return Some(Box::new(SimulatedProbe::new(model)));
    }
    match model {
        DeviceModel::Bmp280 | DeviceModel::Bme280 => {
            Some(Box::new(SimulatedEnvironmental::new(model)))
        }
        _ => None,
    }
}

/// Owns every device worker for one agent process.
pub struct Orchestrator {
    app_name: String,
    tz: Tz,
    measurements: MeasurementStore,
    workers: Vec<WorkerHandle>,
}

impl Orchestrator {
    /// Validates the merged configuration, connects every configured device,
    /// and spawns one worker per device that answered. A device that fails to
    /// connect is logged and skipped; the rest of the deployment still runs.
    pub async fn start(config: AppConfig, data_dir: &Path) -> Result<Self> {
        config.validate().map_err(|err| anyhow!(err))?;
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| anyhow!("unknown timezone '{}'", config.timezone))?;

        let measurements = MeasurementStore::new();
        let sink: Arc<dyn ChartSink> = Arc::new(LogChartSink);
        let cycle = Duration::from_secs(config.cycle_secs);

        let mut workers = Vec::new();
        for (id, device_config) in &config.devices {
            let transport = transport_for(device_config.model);
            match Device::connect(id, device_config.model, transport, device_config.address).await
            {
                Ok(mut device) => {
                    if let Some(unit) = &device_config.pressure_unit {
                        let applied = match device.as_probe_mut() {
                            Some(probe) => probe.set_pressure_unit(unit).await,
                            None => Ok(()),
                        };
                        if let Err(err) = applied {
                            warn!(device = %id, error = %err, "pressure unit rejected, skipping device");
                            continue;
                        }
                    }
                    workers.push(spawn_worker(
                        device,
                        device_config.clone(),
                        QueueStore::new(data_dir, id),
                        measurements.clone(),
                        Arc::clone(&sink),
                        tz,
                        cycle,
                    ));
                }
                Err(err) => {
                    warn!(device = %id, error = %err, "device unavailable, skipping");
                }
            }
        }

        if workers.is_empty() {
            return Err(anyhow!("no configured device could be started"));
        }

        info!(
            app = %config.app_name,
            timezone = %tz,
            workers = workers.len(),
            "orchestrator started"
        );

        Ok(Self {
            app_name: config.app_name,
            tz,
            measurements,
            workers,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|worker| worker.device_id.clone())
            .collect()
    }

    pub async fn history(&self, device_id: &str) -> Vec<MeasurementSample> {
        self.measurements.history(device_id).await
    }

    /// Hands an entry to the named device's worker.
    pub async fn enqueue(&self, device_id: &str, entry: QueueEntry) -> Result<()> {
        let worker = self
            .workers
            .iter()
            .find(|worker| worker.device_id == device_id)
            .ok_or_else(|| anyhow!("no worker for device '{device_id}'"))?;
        worker
            .inbox
            .send(entry)
            .await
            .map_err(|_| anyhow!("worker for '{device_id}' is gone"))
    }

    /// Graceful stop: every worker receives a close entry that outranks all
    /// pending work, then gets a bounded window to persist and exit. A worker
    /// that overruns the window is aborted.
    pub async fn shutdown(self) {
        let now = now_in(self.tz);
        for worker in &self.workers {
            let close = QueueEntry::new(ActionKind::Close, now, i32::MAX, None);
            if worker.inbox.send(close).await.is_err() {
                warn!(device = %worker.device_id, "worker already gone at shutdown");
            }
        }

        for worker in self.workers {
            let abort = worker.join.abort_handle();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, worker.join).await {
                Ok(Ok(())) => info!(device = %worker.device_id, "worker closed"),
                Ok(Err(err)) => warn!(device = %worker.device_id, error = %err, "worker panicked"),
                Err(_) => {
                    warn!(device = %worker.device_id, "worker overran shutdown, aborting");
                    abort.abort();
                }
            }
        }
    }
}

/// Process entry point: logging, config, run until interrupted, drain.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let overrides = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            AppConfig::from_json(&raw).map_err(|err| anyhow!(err))?
        }
        Err(_) => AppConfig::default(),
    };
    let config = merge_config(&default_config(), &overrides);

    let data_dir: PathBuf = std::env::var(DATA_DIR_ENV)
        .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string())
        .into();

    let orchestrator = Orchestrator::start(config, &data_dir).await?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for interrupt")?;
    info!("interrupt received, draining workers");
    orchestrator.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn probe_config(model: DeviceModel, address: u16) -> DeviceConfig {
        DeviceConfig {
            model,
            address: Some(address),
            fields: Vec::new(),
            overrides: BTreeMap::new(),
            actions: Vec::new(),
            dispense_ml: None,
            pressure_unit: None,
        }
    }

    fn data_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("growbot-orch-{name}"))
    }

    #[test]
    fn default_config_validates() {
        let config = merge_config(&default_config(), &AppConfig::default());
        config.validate().unwrap();
        assert!(config.devices.contains_key("cpu"));
        assert!(!config.devices["cpu"].actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_spawns_a_worker_per_device_and_drains_on_shutdown() {
        let mut config = merge_config(&default_config(), &AppConfig::default());
        config
            .devices
            .insert("tank_ph".into(), probe_config(DeviceModel::Ph, 0x63));
        config
            .devices
            .insert("room".into(), probe_config(DeviceModel::Bme280, 0x76));
        for device in config.devices.values_mut() {
            if device.actions.is_empty() {
                device.actions = growbot_common::config::default_actions();
            }
        }

        let orchestrator = Orchestrator::start(config, &data_dir("drain")).await.unwrap();
        let mut ids = orchestrator.device_ids();
        ids.sort();
        assert_eq!(ids, vec!["cpu", "room", "tank_ph"]);

        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_measure_reaches_the_store() {
        let mut config = AppConfig::default();
        config
            .devices
            .insert("tank_ph".into(), probe_config(DeviceModel::Ph, 0x63));
        let config = merge_config(&default_config(), &config);

        let orchestrator = Orchestrator::start(config, &data_dir("enqueue")).await.unwrap();

        orchestrator
            .enqueue(
                "tank_ph",
                QueueEntry::new(ActionKind::Measure, now_in(chrono_tz::UTC), 10, None),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let history = orchestrator.history("tank_ph").await;
        assert!(!history.is_empty());
        assert_eq!(history[0].quantity, "ph");
        assert_eq!(history[0].value, "6.97");

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_to_unknown_device_fails() {
        let config = merge_config(&default_config(), &AppConfig::default());
        let orchestrator = Orchestrator::start(config, &data_dir("unknown")).await.unwrap();

        assert!(orchestrator
            .enqueue(
                "nope",
                QueueEntry::new(ActionKind::Measure, now_in(chrono_tz::UTC), 0, None),
            )
            .await
            .is_err());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_timezone_is_rejected() {
        let mut config = merge_config(&default_config(), &AppConfig::default());
        config.timezone = "Mars/Olympus".into();

        assert!(Orchestrator::start(config, &data_dir("tz")).await.is_err());
    }
}
