use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use growbot_common::config::{BUS_ADDRESS_MAX, BUS_ADDRESS_MIN};
use growbot_common::{DeviceError, DeviceModel, DeviceResult, FirmwareVersion, MeasurementSample};

use crate::bus::BusTransport;
use crate::protocol::{expect_tag, Codec};

use super::profile::{field_for_tag, pressure_maximum, profile_for, ModelProfile};

/// Moment before reading the info response at construction.
const INFO_MOMENT: Duration = Duration::from_millis(300);

/// Settle after commands that reboot the device (address change, factory
/// reset, calibration import).
const REBOOT_SETTLE: Duration = Duration::from_millis(1000);

const NAME_MAX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    /// Single-letter restart reason code as reported by the device.
    pub restart_reason: String,
    pub supply_voltage: f64,
}

/// Validated calibration argument set. Which shapes a model accepts is
/// driven by its profile's `CalibrationSpec`.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationRequest {
    /// Report the current calibration point count.
    Query,
    /// Reset calibration to zero points.
    Clear,
    /// A named calibration point, optionally with a numeric value.
    Point { point: String, value: Option<f64> },
    /// A bare numeric single-point calibration.
    Value(f64),
}

/// One ASCII command/response probe module. All thirteen probe models share
/// this implementation; the profile table supplies everything model-specific.
pub struct EzoDevice {
    id: String,
    codec: Codec,
    profile: &'static ModelProfile,
    firmware: FirmwareVersion,
    pressure_unit: String,
}

impl fmt::Debug for EzoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EzoDevice")
            .field("id", &self.id)
            .field("model", &self.profile.model)
            .field("firmware", &self.firmware)
            .finish_non_exhaustive()
    }
}

impl EzoDevice {
    /// Probes the address, reads the device self-report, and verifies the
    /// reported model matches what the configuration promised.
    pub async fn connect(
        id: &str,
        expected: DeviceModel,
        bus: Box<dyn BusTransport>,
        address: u16,
    ) -> DeviceResult<Self> {
        let profile = profile_for(expected).ok_or_else(|| {
            DeviceError::Construction(format!("{expected} is not a probe module"))
        })?;

        let mut codec = Codec::new(bus, address);
        if !codec.probe().await? {
            return Err(DeviceError::Construction(format!(
                "no device answers at address {address:#04x}"
            )));
        }

        let response = codec
            .transact("i", INFO_MOMENT)
            .await?
            .ok_or_else(|| DeviceError::Construction("empty info response".into()))?;
        let fields = expect_tag(&response, "I")
            .map_err(|err| DeviceError::Construction(err.to_string()))?;
        if fields.len() < 2 {
            return Err(DeviceError::Construction(format!(
                "short info response '{response}'"
            )));
        }

        let model = DeviceModel::from_self_report(&fields[0])?;
        if model != expected {
            return Err(DeviceError::Construction(format!(
                "address {address:#04x} reports {model}, config says {expected}"
            )));
        }
        let firmware: FirmwareVersion = fields[1].parse()?;

        debug!(device = id, %model, %firmware, "probe module connected");

        Ok(Self {
            id: id.to_string(),
            codec,
            profile,
            firmware,
            pressure_unit: "psi".to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> DeviceModel {
        self.profile.model
    }

    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    fn gate(&self, floor: Option<FirmwareVersion>, operation: &'static str) -> DeviceResult<()> {
        match floor {
            Some(min) if self.firmware >= min => Ok(()),
            _ => Err(DeviceError::Unsupported {
                model: self.profile.model.as_str(),
                operation,
            }),
        }
    }

    fn require(&self, supported: bool, operation: &'static str) -> DeviceResult<()> {
        if supported {
            Ok(())
        } else {
            Err(DeviceError::Unsupported {
                model: self.profile.model.as_str(),
                operation,
            })
        }
    }

    // --- generic family operations -------------------------------------

    pub async fn status(&mut self) -> DeviceResult<DeviceStatus> {
        let response = self.query("Status").await?;
        let fields = expect_tag(&response, "STATUS")?;
        let [reason, voltage] = fields.as_slice() else {
            return Err(DeviceError::Protocol(format!(
                "malformed status response '{response}'"
            )));
        };

        Ok(DeviceStatus {
            restart_reason: reason.clone(),
            supply_voltage: voltage
                .parse()
                .map_err(|_| DeviceError::Protocol(format!("bad supply voltage '{voltage}'")))?,
        })
    }

    pub async fn name(&mut self) -> DeviceResult<String> {
        let response = self.query("Name,?").await?;
        let fields = expect_tag(&response, "NAME")?;
        Ok(fields.into_iter().next().unwrap_or_default())
    }

    pub async fn set_name(&mut self, name: &str) -> DeviceResult<()> {
        if name.is_empty()
            || name.len() > NAME_MAX_LEN
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(DeviceError::Validation(format!(
                "device name '{name}' must be 1-{NAME_MAX_LEN} alphanumeric characters"
            )));
        }

        self.command(&format!("Name,{name}")).await?;
        let echoed = self.name().await?;
        if echoed != name {
            return Err(DeviceError::Protocol(format!(
                "name set not confirmed: device reports '{echoed}'"
            )));
        }
        Ok(())
    }

    pub async fn protocol_lock(&mut self) -> DeviceResult<bool> {
        self.gate(self.profile.plock_since, "protocol_lock")?;
        let response = self.query("Plock,?").await?;
        let fields = expect_tag(&response, "PLOCK")?;
        match fields.first().map(String::as_str) {
            Some("1") => Ok(true),
            Some("0") => Ok(false),
            _ => Err(DeviceError::Protocol(format!(
                "malformed plock response '{response}'"
            ))),
        }
    }

    pub async fn set_protocol_lock(&mut self, enabled: bool) -> DeviceResult<()> {
        self.gate(self.profile.plock_since, "protocol_lock")?;
        self.command(&format!("Plock,{}", u8::from(enabled))).await?;

        let echoed = self.protocol_lock().await?;
        if echoed != enabled {
            return Err(DeviceError::Protocol(
                "plock set not confirmed by readback".into(),
            ));
        }
        Ok(())
    }

    /// Puts the device into low-power sleep. Any subsequent command wakes it;
    /// no response is read here.
    pub async fn sleep(&mut self) -> DeviceResult<()> {
        self.codec.send("Sleep").await
    }

    pub async fn find(&mut self) -> DeviceResult<()> {
        self.gate(self.profile.find_since, "find")?;
        self.command("Find").await
    }

    pub async fn factory_reset(&mut self) -> DeviceResult<()> {
        self.codec.send("Factory").await?;
        self.await_reboot().await
    }

    /// Moves the device to a new bus address. The device reboots onto the new
    /// address; all further traffic follows it there.
    pub async fn set_bus_address(&mut self, address: u16) -> DeviceResult<()> {
        if !(BUS_ADDRESS_MIN..=BUS_ADDRESS_MAX).contains(&address) {
            return Err(DeviceError::Validation(format!(
                "bus address {address:#04x} out of range"
            )));
        }

        self.codec.send(&format!("I2C,{address}")).await?;
        self.codec.set_address(address);
        self.await_reboot().await
    }

    // --- options ---------------------------------------------------------

    pub async fn options(&mut self) -> DeviceResult<Vec<String>> {
        self.require(!self.profile.option_tags.is_empty(), "options")?;

        let response = self.query("O,?").await?;
        let fields = expect_tag(&response, "O")?;
        Ok(fields
            .into_iter()
            .filter(|tag| !tag.is_empty())
            .map(|tag| tag.to_ascii_uppercase())
            .collect())
    }

    pub async fn set_option(&mut self, tag: &str, enabled: bool) -> DeviceResult<()> {
        self.require(!self.profile.option_tags.is_empty(), "options")?;

        let tag = tag.to_ascii_uppercase();
        if !self
            .profile
            .option_tags
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&tag))
        {
            return Err(DeviceError::Validation(format!(
                "{} does not report a '{tag}' field",
                self.profile.model
            )));
        }

        self.command(&format!("O,{tag},{}", u8::from(enabled)))
            .await?;

        let now_enabled = self.options().await?.contains(&tag);
        if now_enabled != enabled {
            return Err(DeviceError::Protocol(format!(
                "option {tag} change not confirmed by readback"
            )));
        }
        Ok(())
    }

    // --- measurement ------------------------------------------------------

    /// Sends the read command, waits out the model's settle delay, and
    /// decodes the comma-separated response positionally against the current
    /// option list (or the model's single fixed field).
    pub async fn measure(
        &mut self,
        now: DateTime<FixedOffset>,
    ) -> DeviceResult<Vec<MeasurementSample>> {
        let response = self
            .codec
            .transact("R", self.profile.settle)
            .await?
            .ok_or_else(|| DeviceError::Protocol("device reported no measurement".into()))?;

        let specs = if self.profile.option_tags.is_empty() {
            self.profile.fields.iter().collect::<Vec<_>>()
        } else {
            let enabled = self.options().await?;
            enabled
                .iter()
                .map(|tag| {
                    field_for_tag(self.profile, tag).ok_or_else(|| {
                        DeviceError::Protocol(format!(
                            "device reports unknown option tag '{tag}'"
                        ))
                    })
                })
                .collect::<DeviceResult<Vec<_>>>()?
        };

        let values: Vec<&str> = response.split(',').collect();
        if values.len() != specs.len() {
            return Err(DeviceError::Protocol(format!(
                "expected {} fields, device sent {} in '{response}'",
                specs.len(),
                values.len()
            )));
        }

        // Response field i corresponds to option entry i; the device-reported
        // order is authoritative.
        Ok(specs
            .iter()
            .zip(values)
            .map(|(spec, value)| {
                let (unit, maximum) = if self.profile.model == DeviceModel::Prs {
                    let maximum = pressure_maximum(&self.pressure_unit).unwrap_or(spec.maximum);
                    (self.pressure_unit.clone(), maximum)
                } else {
                    (spec.unit.to_string(), spec.maximum)
                };

                MeasurementSample {
                    timestamp: now,
                    quantity: spec.quantity.to_string(),
                    value: value.trim().to_string(),
                    unit,
                    minimum: spec.minimum,
                    maximum,
                }
            })
            .collect())
    }

    // --- calibration ------------------------------------------------------

    /// Executes a calibration request and returns the device's calibration
    /// point count afterwards. Arguments are validated against the model's
    /// accepted set before any bus traffic.
    pub async fn calibrate(&mut self, request: CalibrationRequest) -> DeviceResult<u8> {
        self.require(self.profile.calibration.supported(), "calibration")?;

        match request {
            CalibrationRequest::Query => {}
            CalibrationRequest::Clear => self.command("Cal,clear").await?,
            CalibrationRequest::Point { point, value } => {
                let command = self.calibration_point_command(&point, value)?;
                self.command(&command).await?;
            }
            CalibrationRequest::Value(value) => {
                if !self.profile.calibration.accepts_value {
                    return Err(DeviceError::Validation(format!(
                        "{} calibration requires a named point",
                        self.profile.model
                    )));
                }
                self.command(&format!("Cal,{value:.2}")).await?;
            }
        }

        let response = self.query("Cal,?").await?;
        let fields = expect_tag(&response, "CAL")?;
        fields
            .first()
            .and_then(|count| count.parse().ok())
            .ok_or_else(|| {
                DeviceError::Protocol(format!("malformed calibration response '{response}'"))
            })
    }

    fn calibration_point_command(
        &self,
        point: &str,
        value: Option<f64>,
    ) -> DeviceResult<String> {
        let spec = &self.profile.calibration;
        let point = point.to_ascii_lowercase();

        if spec.valued_points.contains(&point.as_str()) {
            let value = value.ok_or_else(|| {
                DeviceError::Validation(format!(
                    "calibration point '{point}' requires a value"
                ))
            })?;
            return Ok(format!("Cal,{point},{value:.2}"));
        }

        if spec.bare_points.contains(&point.as_str()) {
            if value.is_some() {
                return Err(DeviceError::Validation(format!(
                    "calibration point '{point}' does not take a value"
                )));
            }
            // The dissolved-oxygen family spells its two bare points without
            // a point name on the wire.
            return Ok(match point.as_str() {
                "atmospheric" => "Cal".to_string(),
                "zero" => "Cal,0".to_string(),
                _ => format!("Cal,{point}"),
            });
        }

        Err(DeviceError::Validation(format!(
            "{} does not accept calibration point '{point}'",
            self.profile.model
        )))
    }

    /// Reads the device's calibration blob as an opaque ordered string
    /// sequence. The device reports how many strings and how many total bytes
    /// to expect; the byte total is off by one when it lands on a multiple of
    /// twelve, and export fails unless the corrected total matches exactly.
    pub async fn export_calibration(&mut self) -> DeviceResult<Vec<String>> {
        self.gate(self.profile.export_since, "calibration export")?;

        let header = self.query("Export,?").await?;
        let fields = expect_tag(&header, "EXPORT")?;
        let [lines, bytes] = fields.as_slice() else {
            return Err(DeviceError::Protocol(format!(
                "malformed export header '{header}'"
            )));
        };
        let lines: usize = lines
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("bad export line count '{lines}'")))?;
        let reported_bytes: usize = bytes
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("bad export byte count '{bytes}'")))?;

        let mut exported = Vec::with_capacity(lines);
        for _ in 0..lines {
            let line = self.query("Export").await?;
            if line == "*DONE" {
                return Err(DeviceError::Protocol(
                    "device finished export early".into(),
                ));
            }
            exported.push(line);
        }

        let done = self.query("Export").await?;
        if done != "*DONE" {
            return Err(DeviceError::Protocol(format!(
                "expected export terminator, device sent '{done}'"
            )));
        }

        let total: usize = exported.iter().map(String::len).sum();
        let expected = if reported_bytes > 0 && reported_bytes % 12 == 0 {
            reported_bytes - 1
        } else {
            reported_bytes
        };
        if total != expected {
            return Err(DeviceError::Protocol(format!(
                "export size mismatch: device promised {expected} bytes, sent {total}"
            )));
        }

        Ok(exported)
    }

    /// Replays an exported calibration blob. The device reboots after the
    /// final string.
    pub async fn import_calibration(&mut self, exported: &[String]) -> DeviceResult<()> {
        self.gate(self.profile.export_since, "calibration import")?;

        if exported.is_empty() {
            return Err(DeviceError::Validation(
                "calibration import requires at least one string".into(),
            ));
        }

        for line in exported {
            self.command(&format!("Import,{line}")).await?;
        }
        self.await_reboot().await
    }

    // --- dosing pumps -----------------------------------------------------

    /// Dispenses `volume` mL, optionally spread over `minutes`. Negative
    /// volume runs the pump in reverse.
    pub async fn dispense(&mut self, volume: f64, minutes: Option<f64>) -> DeviceResult<()> {
        self.require(self.profile.is_pump, "dispense")?;

        if volume == 0.0 || !volume.is_finite() {
            return Err(DeviceError::Validation(
                "dispense volume must be a non-zero finite amount".into(),
            ));
        }
        if let Some(minutes) = minutes {
            if minutes <= 0.0 || !minutes.is_finite() {
                return Err(DeviceError::Validation(
                    "dispense duration must be positive".into(),
                ));
            }
        }

        let command = match minutes {
            Some(minutes) => format!("D,{volume:.2},{minutes:.2}"),
            None => format!("D,{volume:.2}"),
        };
        self.command(&command).await
    }

    /// Runs the pump at a constant rate (mL/min) for `minutes`.
    pub async fn dispense_constant(&mut self, rate: f64, minutes: f64) -> DeviceResult<()> {
        self.require(self.profile.is_pump, "dispense")?;

        if rate == 0.0 || !rate.is_finite() {
            return Err(DeviceError::Validation(
                "dispense rate must be non-zero and finite".into(),
            ));
        }
        if minutes <= 0.0 || !minutes.is_finite() {
            return Err(DeviceError::Validation(
                "dispense duration must be positive".into(),
            ));
        }

        self.command(&format!("DC,{rate:.2},{minutes:.2}")).await
    }

    pub async fn pause_dispensing(&mut self) -> DeviceResult<()> {
        self.require(self.profile.is_pump, "dispense")?;
        self.command("P").await
    }

    pub async fn stop_dispensing(&mut self) -> DeviceResult<()> {
        self.require(self.profile.is_pump, "dispense")?;
        self.command("X").await
    }

    /// Returns (last dispensed volume, whether the pump is currently
    /// dispensing).
    pub async fn dispense_status(&mut self) -> DeviceResult<(f64, bool)> {
        self.require(self.profile.is_pump, "dispense")?;

        let response = self.query("D,?").await?;
        let fields = expect_tag(&response, "D")?;
        let [volume, active] = fields.as_slice() else {
            return Err(DeviceError::Protocol(format!(
                "malformed dispense status '{response}'"
            )));
        };

        let volume = volume
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("bad dispense volume '{volume}'")))?;
        Ok((volume, active == "1"))
    }

    /// Cumulative dispensed volume; `absolute` ignores direction.
    pub async fn total_dispensed(&mut self, absolute: bool) -> DeviceResult<f64> {
        self.require(self.profile.is_pump, "dispense")?;

        let (command, tag) = if absolute {
            ("ATV,?", "ATV")
        } else {
            ("TV,?", "TV")
        };
        let response = self.query(command).await?;
        let fields = expect_tag(&response, tag)?;
        fields.first().and_then(|v| v.parse().ok()).ok_or_else(|| {
            DeviceError::Protocol(format!("malformed total volume response '{response}'"))
        })
    }

    // --- pressure unit ----------------------------------------------------

    /// Selects the pressure module's reporting unit; the declared maximum in
    /// subsequent measurements follows the unit.
    pub async fn set_pressure_unit(&mut self, unit: &str) -> DeviceResult<()> {
        self.require(self.profile.model == DeviceModel::Prs, "pressure unit")?;

        if pressure_maximum(unit).is_none() {
            return Err(DeviceError::Validation(format!(
                "unknown pressure unit '{unit}'"
            )));
        }

        self.command(&format!("U,{unit}")).await?;

        let response = self.query("U,?").await?;
        let fields = expect_tag(&response, "U")?;
        match fields.first() {
            Some(echoed) if echoed.eq_ignore_ascii_case(unit) => {
                self.pressure_unit = echoed.clone();
                Ok(())
            }
            _ => Err(DeviceError::Protocol(
                "pressure unit change not confirmed by readback".into(),
            )),
        }
    }

    // --- plumbing ---------------------------------------------------------

    /// Sends a command expecting a payload-bearing response.
    async fn query(&mut self, command: &str) -> DeviceResult<String> {
        self.codec
            .transact(command, self.profile.moment)
            .await?
            .ok_or_else(|| {
                DeviceError::Protocol(format!("no response to '{command}'"))
            })
    }

    /// Sends a command where only the status byte matters.
    async fn command(&mut self, command: &str) -> DeviceResult<()> {
        self.codec.transact(command, self.profile.moment).await?;
        Ok(())
    }

    async fn await_reboot(&mut self) -> DeviceResult<()> {
        tokio::time::sleep(REBOOT_SETTLE).await;
        if !self.codec.probe().await? {
            return Err(DeviceError::Timing(
                "device did not come back after reboot".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bus::testing::MockBus;

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-03-01T08:00:00+02:00").unwrap()
    }

    async fn connect(bus: &MockBus, report: &str, firmware: &str, expected: DeviceModel) -> EzoDevice {
        bus.push_success(&format!("?I,{report},{firmware}"));
        EzoDevice::connect("dev1", expected, Box::new(bus.clone()), 0x63)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reads_model_and_firmware() {
        let bus = MockBus::new();
        let device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        assert_eq!(device.model(), DeviceModel::Ph);
        assert_eq!(device.firmware(), FirmwareVersion::new(2, 12, 0));
        assert_eq!(bus.commands(), vec!["i".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rejects_model_mismatch() {
        let bus = MockBus::new();
        bus.push_success("?I,EC,2.12");

        let err = EzoDevice::connect("dev1", DeviceModel::Ph, Box::new(bus.clone()), 0x63)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Construction(_)), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rejects_unknown_model_report() {
        let bus = MockBus::new();
        bus.push_success("?I,XL9,2.12");

        let err = EzoDevice::connect("dev1", DeviceModel::Ph, Box::new(bus.clone()), 0x63)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Construction(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_when_nothing_answers() {
        let bus = MockBus::new();
        bus.set_present(false);

        let err = EzoDevice::connect("dev1", DeviceModel::Ph, Box::new(bus.clone()), 0x63)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Construction(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ph_measure_uses_single_fixed_field() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        bus.push_success("6.97");
        let samples = device.measure(now()).await.unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].quantity, "ph");
        assert_eq!(samples[0].value, "6.97");
        assert_eq!(samples[0].unit, "pH");
        assert_eq!(samples[0].minimum, 0.001);
        assert_eq!(samples[0].maximum, 14.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ec_measure_zips_response_to_option_list() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "EC", "2.12", DeviceModel::Ec).await;

        bus.push_success("1413,705");
        bus.push_success("?O,EC,TDS");
        let samples = device.measure(now()).await.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].quantity, "conductivity");
        assert_eq!(samples[0].value, "1413");
        assert_eq!(samples[0].unit, "μS/cm");
        assert_eq!(samples[1].quantity, "total_dissolved_solids");
        assert_eq!(samples[1].value, "705");
        assert_eq!(samples[1].unit, "PPM");
    }

    #[tokio::test(start_paused = true)]
    async fn measure_rejects_field_count_mismatch() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "EC", "2.12", DeviceModel::Ec).await;

        bus.push_success("1413,705,0.73");
        bus.push_success("?O,EC,TDS");

        assert!(matches!(
            device.measure(now()).await.unwrap_err(),
            DeviceError::Protocol(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn options_are_unsupported_without_an_option_list() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        assert!(matches!(
            device.options().await.unwrap_err(),
            DeviceError::Unsupported { operation: "options", .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn set_option_validates_tag_before_bus_io() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "EC", "2.12", DeviceModel::Ec).await;

        let err = device.set_option("PH", true).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));
        // Only the construction info command reached the bus.
        assert_eq!(bus.commands(), vec!["i".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn set_option_verifies_readback() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "EC", "2.12", DeviceModel::Ec).await;

        bus.push_success(""); // O,TDS,0 ack
        bus.push_success("?O,EC"); // readback without TDS
        device.set_option("TDS", false).await.unwrap();

        assert_eq!(
            bus.commands(),
            vec!["i".to_string(), "O,TDS,0".to_string(), "O,?".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_validates_points_before_bus_io() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        let missing_value = device
            .calibrate(CalibrationRequest::Point {
                point: "mid".into(),
                value: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(missing_value, DeviceError::Validation(_)));

        let unknown_point = device
            .calibrate(CalibrationRequest::Point {
                point: "dry".into(),
                value: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(unknown_point, DeviceError::Validation(_)));

        let bare_value = device
            .calibrate(CalibrationRequest::Value(7.0))
            .await
            .unwrap_err();
        assert!(matches!(bare_value, DeviceError::Validation(_)));

        assert_eq!(bus.commands(), vec!["i".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_point_sends_command_and_returns_count() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        bus.push_success(""); // Cal,mid,7.00 ack
        bus.push_success("?CAL,1");
        let count = device
            .calibrate(CalibrationRequest::Point {
                point: "mid".into(),
                value: Some(7.0),
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(
            bus.commands(),
            vec!["i".to_string(), "Cal,mid,7.00".to_string(), "Cal,?".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ec_dry_point_is_sent_bare() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "EC", "2.12", DeviceModel::Ec).await;

        bus.push_success("");
        bus.push_success("?CAL,1");
        device
            .calibrate(CalibrationRequest::Point {
                point: "dry".into(),
                value: None,
            })
            .await
            .unwrap();

        assert!(bus.commands().contains(&"Cal,dry".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn plock_set_requires_confirming_readback() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        bus.push_success(""); // Plock,1 ack
        bus.push_success("?PLOCK,1");
        device.set_protocol_lock(true).await.unwrap();

        bus.push_success(""); // Plock,0 ack
        bus.push_success("?PLOCK,1"); // device still reports locked
        assert!(matches!(
            device.set_protocol_lock(false).await.unwrap_err(),
            DeviceError::Protocol(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_gates_export() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "1.50", DeviceModel::Ph).await;

        assert!(matches!(
            device.export_calibration().await.unwrap_err(),
            DeviceError::Unsupported { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn export_applies_multiple_of_twelve_correction() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        // Reported 24 bytes is a multiple of 12, so 23 actual bytes is exact.
        bus.push_success("?EXPORT,2,24");
        bus.push_success("3FKMqR8tYw2p"); // 12 bytes
        bus.push_success("Zb91uHxT4eL"); // 11 bytes
        bus.push_success("*DONE");

        let exported = device.export_calibration().await.unwrap();
        assert_eq!(exported.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn export_rejects_byte_count_mismatch() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        bus.push_success("?EXPORT,1,20");
        bus.push_success("3FKMqR8tYw2p");
        bus.push_success("*DONE");

        assert!(matches!(
            device.export_calibration().await.unwrap_err(),
            DeviceError::Protocol(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn import_replays_strings_and_waits_for_reboot() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        bus.push_success("");
        bus.push_success("");
        device
            .import_calibration(&["3FKMqR8tYw2p".to_string(), "Zb91uHxT4eL".to_string()])
            .await
            .unwrap();

        let commands = bus.commands();
        assert!(commands.contains(&"Import,3FKMqR8tYw2p".to_string()));
        assert!(commands.contains(&"Import,Zb91uHxT4eL".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_survives_an_export_import_round_trip() {
        use crate::bus::SimulatedProbe;

        let bus = Box::new(SimulatedProbe::new(DeviceModel::Ph));
        let mut device = EzoDevice::connect("ph1", DeviceModel::Ph, bus, 0x63)
            .await
            .unwrap();

        device
            .calibrate(CalibrationRequest::Point {
                point: "mid".into(),
                value: Some(7.0),
            })
            .await
            .unwrap();
        let before = device.calibrate(CalibrationRequest::Query).await.unwrap();
        assert_eq!(before, 1);

        let exported = device.export_calibration().await.unwrap();
        device.import_calibration(&exported).await.unwrap();

        let after = device.calibrate(CalibrationRequest::Query).await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test(start_paused = true)]
    async fn dispense_is_unsupported_off_pumps() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "pH", "2.12", DeviceModel::Ph).await;

        assert!(matches!(
            device.dispense(10.0, None).await.unwrap_err(),
            DeviceError::Unsupported { operation: "dispense", .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dispense_validates_and_formats_command() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "PMP", "2.12", DeviceModel::Pmp).await;

        assert!(matches!(
            device.dispense(0.0, None).await.unwrap_err(),
            DeviceError::Validation(_)
        ));
        assert!(matches!(
            device.dispense(10.0, Some(-1.0)).await.unwrap_err(),
            DeviceError::Validation(_)
        ));

        bus.push_success("");
        device.dispense(12.5, Some(2.0)).await.unwrap();
        assert!(bus.commands().contains(&"D,12.50,2.00".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pressure_unit_change_updates_declared_maximum() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "PRS", "2.12", DeviceModel::Prs).await;

        bus.push_success(""); // U,kPa ack
        bus.push_success("?U,kPa");
        device.set_pressure_unit("kPa").await.unwrap();

        bus.push_success("101.3");
        let samples = device.measure(now()).await.unwrap();

        assert_eq!(samples[0].unit, "kPa");
        assert_eq!(samples[0].maximum, 344.738);
    }

    #[tokio::test(start_paused = true)]
    async fn status_parses_reason_and_voltage() {
        let bus = MockBus::new();
        let mut device = connect(&bus, "RTD", "2.12", DeviceModel::Rtd).await;

        bus.push_success("?STATUS,P,3.83");
        let status = device.status().await.unwrap();

        assert_eq!(status.restart_reason, "P");
        assert_eq!(status.supply_voltage, 3.83);
    }
}
