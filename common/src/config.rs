use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::ActionKind;
use crate::types::DeviceModel;

/// Lowest/highest addresses usable on the bus; outside this window sit
/// reserved bus addresses.
pub const BUS_ADDRESS_MIN: u16 = 0x03;
pub const BUS_ADDRESS_MAX: u16 = 0x77;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config: {0}")]
    Invalid(String),
    #[error("device '{0}': {1}")]
    Device(String, String),
}

/// One scheduled default action for a device. An interval makes the action
/// recurring; without one it runs exactly once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub kind: ActionKind,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub priority: i32,
}

/// Deployment override for one measurement field's declared range/unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldOverride {
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub model: DeviceModel,
    /// Bus address; required for bus-attached models, ignored for host
    /// sensors.
    #[serde(default)]
    pub address: Option<u16>,
    /// Dashboard fields this deployment renders, by quantity kind.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, FieldOverride>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    /// Volume a scheduled dispense action pushes, in mL. Only meaningful for
    /// pump models.
    #[serde(default)]
    pub dispense_ml: Option<f64>,
    /// Reporting unit selected at construction on the pressure module.
    #[serde(default)]
    pub pressure_unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    pub timezone: String,
    /// Worker cycle pace in seconds.
    pub cycle_secs: u64,
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "growbot".to_string(),
            timezone: "UTC".to_string(),
            cycle_secs: 1,
            devices: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle_secs == 0 {
            return Err(ConfigError::Invalid("cycle_secs must be > 0".into()));
        }

        for (id, device) in &self.devices {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("empty device id".into()));
            }

            let needs_address = device.model.is_probe_module()
                || matches!(device.model, DeviceModel::Bme280 | DeviceModel::Bmp280);
            match device.address {
                Some(address) if needs_address => {
                    if !(BUS_ADDRESS_MIN..=BUS_ADDRESS_MAX).contains(&address) {
                        return Err(ConfigError::Device(
                            id.clone(),
                            format!("bus address {address:#04x} out of range"),
                        ));
                    }
                }
                None if needs_address => {
                    return Err(ConfigError::Device(
                        id.clone(),
                        "bus-attached model requires an address".into(),
                    ));
                }
                _ => {}
            }

            if device.pressure_unit.is_some() && device.model != DeviceModel::Prs {
                return Err(ConfigError::Device(
                    id.clone(),
                    format!("{} has no pressure unit", device.model),
                ));
            }

            for action in &device.actions {
                if action.interval_secs == Some(0) {
                    return Err(ConfigError::Device(
                        id.clone(),
                        format!("{} interval must be > 0", action.kind),
                    ));
                }
                if action.kind == ActionKind::Close {
                    return Err(ConfigError::Device(
                        id.clone(),
                        "close cannot be a configured action".into(),
                    ));
                }
                if action.kind == ActionKind::Dispense {
                    if !matches!(device.model, DeviceModel::Pmp | DeviceModel::Pmpl) {
                        return Err(ConfigError::Device(
                            id.clone(),
                            format!("{} cannot dispense", device.model),
                        ));
                    }
                    if device.dispense_ml.is_none() {
                        return Err(ConfigError::Device(
                            id.clone(),
                            "dispense action requires dispense_ml".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Default action list applied to a device whose config declares none:
/// periodic measurement plus an hourly history chart refresh.
pub fn default_actions() -> Vec<ActionConfig> {
    vec![
        ActionConfig {
            kind: ActionKind::Measure,
            interval_secs: Some(300),
            priority: 1,
        },
        ActionConfig {
            kind: ActionKind::HistoryPlot,
            interval_secs: Some(3600),
            priority: 0,
        },
    ]
}

/// Pure merge of the built-in defaults with the user configuration. User
/// values win; devices only present in the defaults are carried over, and
/// devices without an action list get `default_actions()`.
pub fn merge_config(defaults: &AppConfig, overrides: &AppConfig) -> AppConfig {
    let mut merged = overrides.clone();

    if merged.app_name.trim().is_empty() {
        merged.app_name = defaults.app_name.clone();
    }
    if merged.timezone.trim().is_empty() {
        merged.timezone = defaults.timezone.clone();
    }
    if merged.cycle_secs == 0 {
        merged.cycle_secs = defaults.cycle_secs;
    }

    for (id, device) in &defaults.devices {
        merged
            .devices
            .entry(id.clone())
            .or_insert_with(|| device.clone());
    }

    for device in merged.devices.values_mut() {
        if device.actions.is_empty() {
            device.actions = default_actions();
        }
    }

    merged
}
