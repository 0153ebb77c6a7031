use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Closed set of supported device models. A device self-report (or, for the
/// Bosch parts, the chip-id probe) that resolves to anything outside this set
/// is a construction error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceModel {
    Rtd,
    Ph,
    Ec,
    Orp,
    Do,
    Pmp,
    Pmpl,
    Co2,
    O2,
    Hum,
    Prs,
    Flow,
    Rgb,
    Bme280,
    Bmp280,
    Cpu,
    Camera,
}

impl DeviceModel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rtd => "RTD",
            Self::Ph => "PH",
            Self::Ec => "EC",
            Self::Orp => "ORP",
            Self::Do => "DO",
            Self::Pmp => "PMP",
            Self::Pmpl => "PMPL",
            Self::Co2 => "CO2",
            Self::O2 => "O2",
            Self::Hum => "HUM",
            Self::Prs => "PRS",
            Self::Flow => "FLOW",
            Self::Rgb => "RGB",
            Self::Bme280 => "BME280",
            Self::Bmp280 => "BMP280",
            Self::Cpu => "CPU",
            Self::Camera => "CAMERA",
        }
    }

    /// True for the ASCII command/response probe modules that share the
    /// generic command grammar.
    pub fn is_probe_module(self) -> bool {
        !matches!(
            self,
            Self::Bme280 | Self::Bmp280 | Self::Cpu | Self::Camera
        )
    }

    /// Maps the model string a device reports in its info response. Devices
    /// are not consistent about case ("pH", "D.O.") so matching is
    /// case-insensitive with punctuation stripped.
    pub fn from_self_report(report: &str) -> Result<Self, DeviceError> {
        let normalized: String = report
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();

        let model = match normalized.as_str() {
            "RTD" => Self::Rtd,
            "PH" => Self::Ph,
            "EC" => Self::Ec,
            "ORP" => Self::Orp,
            "DO" => Self::Do,
            "PMP" => Self::Pmp,
            "PMPL" => Self::Pmpl,
            "CO2" => Self::Co2,
            "O2" => Self::O2,
            "HUM" => Self::Hum,
            "PRS" => Self::Prs,
            "FLO" | "FLOW" => Self::Flow,
            "RGB" => Self::Rgb,
            other => {
                return Err(DeviceError::Construction(format!(
                    "unrecognized device model report '{other}'"
                )))
            }
        };
        Ok(model)
    }
}

impl FromStr for DeviceModel {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RTD" => Ok(Self::Rtd),
            "PH" => Ok(Self::Ph),
            "EC" => Ok(Self::Ec),
            "ORP" => Ok(Self::Orp),
            "DO" => Ok(Self::Do),
            "PMP" => Ok(Self::Pmp),
            "PMPL" => Ok(Self::Pmpl),
            "CO2" => Ok(Self::Co2),
            "O2" => Ok(Self::O2),
            "HUM" => Ok(Self::Hum),
            "PRS" => Ok(Self::Prs),
            "FLOW" => Ok(Self::Flow),
            "RGB" => Ok(Self::Rgb),
            "BME280" => Ok(Self::Bme280),
            "BMP280" => Ok(Self::Bmp280),
            "CPU" => Ok(Self::Cpu),
            "CAMERA" => Ok(Self::Camera),
            other => Err(DeviceError::Construction(format!(
                "unknown device model '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dotted numeric firmware version read from the device info response.
/// Comparison is numeric per component, never lexicographic: 2.10 > 2.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut component = |name: &str, required: bool| -> Result<u32, DeviceError> {
            match parts.next() {
                Some(raw) => raw.parse::<u32>().map_err(|_| {
                    DeviceError::Construction(format!(
                        "firmware version '{s}': bad {name} component"
                    ))
                }),
                None if !required => Ok(0),
                None => Err(DeviceError::Construction(format!(
                    "firmware version '{s}': missing {name} component"
                ))),
            }
        };

        Ok(Self {
            major: component("major", true)?,
            minor: component("minor", true)?,
            patch: component("patch", false)?,
        })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One decoded measurement field. Produced only by a Measure action; minimum
/// and maximum are the device-declared physical range unless the deployment
/// config overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub timestamp: DateTime<FixedOffset>,
    pub quantity: String,
    pub value: String,
    pub unit: String,
    pub minimum: f64,
    pub maximum: f64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn firmware_version_compares_numerically() {
        let old: FirmwareVersion = "2.9".parse().unwrap();
        let new: FirmwareVersion = "2.10".parse().unwrap();
        assert!(new > old);
        assert_eq!(new, FirmwareVersion::new(2, 10, 0));
    }

    #[test]
    fn firmware_version_accepts_triple() {
        let v: FirmwareVersion = "1.2.3".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(1, 2, 3));
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn firmware_version_rejects_garbage() {
        assert!("2.x".parse::<FirmwareVersion>().is_err());
        assert!("".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn self_report_normalizes_vendor_spellings() {
        assert_eq!(DeviceModel::from_self_report("pH").unwrap(), DeviceModel::Ph);
        assert_eq!(
            DeviceModel::from_self_report("D.O.").unwrap(),
            DeviceModel::Do
        );
        assert_eq!(
            DeviceModel::from_self_report("PMP-L").unwrap(),
            DeviceModel::Pmpl
        );
        assert_eq!(
            DeviceModel::from_self_report("FLO").unwrap(),
            DeviceModel::Flow
        );
        assert!(DeviceModel::from_self_report("XYZ").is_err());
    }
}
