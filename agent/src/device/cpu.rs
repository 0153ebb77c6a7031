use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};

use growbot_common::{DeviceError, DeviceResult, MeasurementSample};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

const CPU_MIN: f64 = -20.0;
const CPU_MAX: f64 = 120.0;

/// Host CPU die temperature, read from the kernel's thermal zone in
/// millidegrees. The only built-in device that needs no bus.
#[derive(Debug)]
pub struct CpuSensor {
    id: String,
    path: PathBuf,
}

impl CpuSensor {
    pub fn new(id: &str) -> Self {
        Self::with_path(id, THERMAL_ZONE.into())
    }

    pub fn with_path(id: &str, path: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            path,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn measure(
        &mut self,
        now: DateTime<FixedOffset>,
    ) -> DeviceResult<Vec<MeasurementSample>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| {
                DeviceError::Bus(format!("reading {}: {err}", self.path.display()))
            })?;

        let millidegrees: i64 = raw.trim().parse().map_err(|_| {
            DeviceError::Protocol(format!("thermal zone reports '{}'", raw.trim()))
        })?;
        let celsius = millidegrees as f64 / 1000.0;

        Ok(vec![MeasurementSample {
            timestamp: now,
            quantity: "cpu_temperature".to_string(),
            value: format!("{celsius:.1}"),
            unit: "°C".to_string(),
            minimum: CPU_MIN,
            maximum: CPU_MAX,
        }])
    }
}
