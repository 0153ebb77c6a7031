pub mod bosch;
pub mod cpu;
pub mod ezo;
pub mod profile;

use chrono::{DateTime, FixedOffset};

use growbot_common::{DeviceError, DeviceModel, DeviceResult, MeasurementSample};

use crate::bus::BusTransport;

use bosch::BoschSensor;
use cpu::CpuSensor;
use ezo::{CalibrationRequest, EzoDevice};

/// One connected device of any family, dispatched by the model registry.
/// Cameras are recognized in configuration but have no agent-side driver;
/// every operation on one reports unsupported.
#[derive(Debug)]
pub enum Device {
    Probe(EzoDevice),
    Barometric(BoschSensor),
    Cpu(CpuSensor),
    Camera { id: String },
}

impl Device {
    /// Model-driven construction. Bus families require a transport and an
    /// address; the built-ins ignore both.
    pub async fn connect(
        id: &str,
        model: DeviceModel,
        transport: Option<Box<dyn BusTransport>>,
        address: Option<u16>,
    ) -> DeviceResult<Self> {
        match model {
            DeviceModel::Bmp280 | DeviceModel::Bme280 => {
                let (bus, address) = require_bus(id, transport, address)?;
                Ok(Self::Barometric(
                    BoschSensor::connect(id, model, bus, address).await?,
                ))
            }
            DeviceModel::Cpu => Ok(Self::Cpu(CpuSensor::new(id))),
            DeviceModel::Camera => Ok(Self::Camera { id: id.to_string() }),
            // Everything else is a probe module sharing the ASCII grammar.
            model => {
                let (bus, address) = require_bus(id, transport, address)?;
                Ok(Self::Probe(EzoDevice::connect(id, model, bus, address).await?))
            }
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Probe(device) => device.id(),
            Self::Barometric(sensor) => sensor.id(),
            Self::Cpu(sensor) => sensor.id(),
            Self::Camera { id } => id,
        }
    }

    pub fn model(&self) -> DeviceModel {
        match self {
            Self::Probe(device) => device.model(),
            Self::Barometric(sensor) => sensor.model(),
            Self::Cpu(_) => DeviceModel::Cpu,
            Self::Camera { .. } => DeviceModel::Camera,
        }
    }

    pub async fn measure(
        &mut self,
        now: DateTime<FixedOffset>,
    ) -> DeviceResult<Vec<MeasurementSample>> {
        match self {
            Self::Probe(device) => device.measure(now).await,
            Self::Barometric(sensor) => sensor.measure(now).await,
            Self::Cpu(sensor) => sensor.measure(now).await,
            Self::Camera { .. } => Err(self.unsupported("measure")),
        }
    }

    pub async fn calibrate(&mut self, request: CalibrationRequest) -> DeviceResult<u8> {
        match self {
            Self::Probe(device) => device.calibrate(request).await,
            _ => Err(self.unsupported("calibration")),
        }
    }

    pub async fn dispense(&mut self, volume: f64) -> DeviceResult<()> {
        match self {
            Self::Probe(device) => device.dispense(volume, None).await,
            _ => Err(self.unsupported("dispense")),
        }
    }

    /// Probe-family maintenance surface (naming, options, export, plock).
    pub fn as_probe_mut(&mut self) -> Option<&mut EzoDevice> {
        match self {
            Self::Probe(device) => Some(device),
            _ => None,
        }
    }

    fn unsupported(&self, operation: &'static str) -> DeviceError {
        DeviceError::Unsupported {
            model: self.model().as_str(),
            operation,
        }
    }
}

fn require_bus(
    id: &str,
    transport: Option<Box<dyn BusTransport>>,
    address: Option<u16>,
) -> DeviceResult<(Box<dyn BusTransport>, u16)> {
    let bus = transport.ok_or_else(|| {
        DeviceError::Construction(format!("device '{id}' needs a bus transport"))
    })?;
    let address = address.ok_or_else(|| {
        DeviceError::Construction(format!("device '{id}' needs a bus address"))
    })?;
    Ok((bus, address))
}
