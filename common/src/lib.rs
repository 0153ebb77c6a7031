pub mod action;
pub mod config;
pub mod error;
pub mod types;

pub use action::{ActionKind, QueueEntry};
pub use config::{ActionConfig, AppConfig, DeviceConfig, FieldOverride, merge_config};
pub use error::{DeviceError, DeviceResult};
pub use types::{DeviceModel, FirmwareVersion, MeasurementSample};
