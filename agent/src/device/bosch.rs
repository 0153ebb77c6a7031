use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use growbot_common::{DeviceError, DeviceModel, DeviceResult, MeasurementSample};

use crate::bus::BusTransport;

const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CALIB_TP: u8 = 0x88;
const REG_CALIB_HUM: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

const CHIP_ID_BMP280: u8 = 0x58;
const CHIP_ID_BME280: u8 = 0x60;

const RESET_WORD: u8 = 0xB6;

const STATUS_IM_UPDATE: u8 = 0x01;
const STATUS_MEASURING: u8 = 0x08;

const MODE_SLEEP: u8 = 0b00;
const MODE_FORCED: u8 = 0b01;

/// Bounded poll after reset. The calibration copy settles well inside this;
/// expiry means the part is wedged.
const RESET_POLL_LIMIT: u32 = 20;
const RESET_POLL_DELAY: Duration = Duration::from_millis(5);

/// Step between status polls while a conversion runs. The poll budget is the
/// gap between the worst-case and typical conversion times.
const MEASURE_POLL_DELAY: Duration = Duration::from_micros(250);

const TEMPERATURE_MIN: f64 = -40.0;
const TEMPERATURE_MAX: f64 = 85.0;
const PRESSURE_MIN: f64 = 30_000.0;
const PRESSURE_MAX: f64 = 110_000.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;

/// Per-channel oversampling factor. `Skipped` disables the channel; its
/// reading comes back as the chip's invalid-code and is not reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oversampling {
    Skipped,
    X1,
    X2,
    X4,
    X8,
    X16,
}

impl Oversampling {
    fn bits(self) -> u8 {
        match self {
            Self::Skipped => 0b000,
            Self::X1 => 0b001,
            Self::X2 => 0b010,
            Self::X4 => 0b011,
            Self::X8 => 0b100,
            Self::X16 => 0b101,
        }
    }

    fn factor(self) -> u32 {
        match self {
            Self::Skipped => 0,
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X8 => 8,
            Self::X16 => 16,
        }
    }
}

/// IIR filter coefficient applied by the chip to pressure and temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Off,
    X2,
    X4,
    X8,
    X16,
}

impl Filter {
    fn bits(self) -> u8 {
        match self {
            Self::Off => 0b000,
            Self::X2 => 0b001,
            Self::X4 => 0b010,
            Self::X8 => 0b011,
            Self::X16 => 0b100,
        }
    }
}

/// Inactive time between normal-mode conversions. The two chips reuse the
/// last two codes for different durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standby {
    Ms0_5,
    Ms62_5,
    Ms125,
    Ms250,
    Ms500,
    Ms1000,
    /// 2000 ms on the pressure-only part, 10 ms on the humidity part.
    Slot6,
    /// 4000 ms on the pressure-only part, 20 ms on the humidity part.
    Slot7,
}

impl Standby {
    fn bits(self) -> u8 {
        match self {
            Self::Ms0_5 => 0b000,
            Self::Ms62_5 => 0b001,
            Self::Ms125 => 0b010,
            Self::Ms250 => 0b011,
            Self::Ms500 => 0b100,
            Self::Ms1000 => 0b101,
            Self::Slot6 => 0b110,
            Self::Slot7 => 0b111,
        }
    }

    pub fn duration(self, model: DeviceModel) -> Duration {
        let micros = match self {
            Self::Ms0_5 => 500,
            Self::Ms62_5 => 62_500,
            Self::Ms125 => 125_000,
            Self::Ms250 => 250_000,
            Self::Ms500 => 500_000,
            Self::Ms1000 => 1_000_000,
            Self::Slot6 if model == DeviceModel::Bme280 => 10_000,
            Self::Slot6 => 2_000_000,
            Self::Slot7 if model == DeviceModel::Bme280 => 20_000,
            Self::Slot7 => 4_000_000,
        };
        Duration::from_micros(micros)
    }
}

/// Factory trimming constants read once at construction. Raw ADC codes are
/// meaningless without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    p2: i16,
    p3: i16,
    p4: i16,
    p5: i16,
    p6: i16,
    p7: i16,
    p8: i16,
    p9: i16,
    h1: u8,
    h2: i16,
    h3: u8,
    h4: i16,
    h5: i16,
    h6: i8,
}

impl Calibration {
    /// `tp` is the 26-byte block at 0x88; `hum` the 7-byte block at 0xE1,
    /// present only on the humidity part.
    fn parse(tp: &[u8], hum: Option<&[u8]>) -> DeviceResult<Self> {
        if tp.len() < 26 {
            return Err(DeviceError::Protocol(format!(
                "short calibration block ({} bytes)",
                tp.len()
            )));
        }

        let u16_at = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);

        let mut calibration = Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            h1: tp[25],
            h2: 0,
            h3: 0,
            h4: 0,
            h5: 0,
            h6: 0,
        };

        if calibration.t1 == 0 || calibration.p1 == 0 {
            return Err(DeviceError::Protocol(
                "calibration block reads as blank".into(),
            ));
        }

        if let Some(hum) = hum {
            if hum.len() < 7 {
                return Err(DeviceError::Protocol(format!(
                    "short humidity calibration block ({} bytes)",
                    hum.len()
                )));
            }
            calibration.h2 = i16::from_le_bytes([hum[0], hum[1]]);
            calibration.h3 = hum[2];
            // H4 and H5 share the middle byte, four bits each. Both are
            // signed 12-bit values; the full byte carries the sign.
            calibration.h4 = (i16::from(hum[3] as i8) << 4) | i16::from(hum[4] & 0x0F);
            calibration.h5 = (i16::from(hum[5] as i8) << 4) | i16::from(hum[4] >> 4);
            calibration.h6 = hum[6] as i8;
        }

        Ok(calibration)
    }
}

/// Temperature compensation. Returns the fine-resolution intermediate the
/// pressure and humidity formulas consume, plus degrees Celsius. Always run
/// first for a given raw sample.
fn compensate_temperature(cal: &Calibration, adc_t: i32) -> (i32, f64) {
    let t1 = i32::from(cal.t1);
    let t2 = i32::from(cal.t2);
    let t3 = i32::from(cal.t3);

    let var1 = (((adc_t >> 3) - (t1 << 1)) * t2) >> 11;
    let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * t3) >> 14;
    let t_fine = var1 + var2;

    let centi = (t_fine * 5 + 128) >> 8;
    (t_fine, f64::from(centi) / 100.0)
}

/// 64-bit fixed-point pressure compensation, in pascals.
fn compensate_pressure(cal: &Calibration, adc_p: i32, t_fine: i32) -> f64 {
    let p1 = i64::from(cal.p1);
    let p2 = i64::from(cal.p2);
    let p3 = i64::from(cal.p3);
    let p4 = i64::from(cal.p4);
    let p5 = i64::from(cal.p5);
    let p6 = i64::from(cal.p6);
    let p7 = i64::from(cal.p7);
    let p8 = i64::from(cal.p8);
    let p9 = i64::from(cal.p9);

    let mut var1 = i64::from(t_fine) - 128_000;
    let mut var2 = var1 * var1 * p6;
    var2 += (var1 * p5) << 17;
    var2 += p4 << 35;
    var1 = ((var1 * var1 * p3) >> 8) + ((var1 * p2) << 12);
    var1 = ((1i64 << 47) + var1) * p1 >> 33;
    if var1 == 0 {
        return 0.0;
    }

    let mut p = 1_048_576i64 - i64::from(adc_p);
    p = (((p << 31) - var2) * 3125) / var1;
    let var3 = (p9 * (p >> 13) * (p >> 13)) >> 25;
    let var4 = (p8 * p) >> 19;
    p = ((p + var3 + var4) >> 8) + (p7 << 4);

    p as f64 / 256.0
}

/// 32-bit fixed-point relative-humidity compensation, in percent.
fn compensate_humidity(cal: &Calibration, adc_h: i32, t_fine: i32) -> f64 {
    let h1 = i32::from(cal.h1);
    let h2 = i32::from(cal.h2);
    let h3 = i32::from(cal.h3);
    let h4 = i32::from(cal.h4);
    let h5 = i32::from(cal.h5);
    let h6 = i32::from(cal.h6);

    let v = t_fine - 76_800;
    let left = (((adc_h << 14) - (h4 << 20) - (h5 * v)) + 16_384) >> 15;
    let inner = ((((v * h6) >> 10) * (((v * h3) >> 11) + 32_768)) >> 10) + 2_097_152;
    let right = (inner * h2 + 8_192) >> 14;
    let mut acc = left * right;
    acc -= (((acc >> 15) * (acc >> 15)) >> 7) * h1 >> 4;
    let acc = acc.clamp(0, 419_430_400);

    f64::from(acc >> 12) / 1024.0
}

/// Register-driver for the Bosch barometric family. The pressure-only and
/// humidity variants share everything except the humidity channel and the
/// short standby slots.
pub struct BoschSensor {
    id: String,
    bus: Box<dyn BusTransport>,
    address: u16,
    model: DeviceModel,
    calibration: Calibration,
    temperature_oversampling: Oversampling,
    pressure_oversampling: Oversampling,
    humidity_oversampling: Oversampling,
}

impl fmt::Debug for BoschSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoschSensor")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BoschSensor {
    /// Verifies the chip identifies as the configured variant, resets it,
    /// waits for the calibration copy to finish, and reads the trimming
    /// constants.
    pub async fn connect(
        id: &str,
        expected: DeviceModel,
        mut bus: Box<dyn BusTransport>,
        address: u16,
    ) -> DeviceResult<Self> {
        if !matches!(expected, DeviceModel::Bmp280 | DeviceModel::Bme280) {
            return Err(DeviceError::Construction(format!(
                "{expected} is not a barometric sensor"
            )));
        }

        if !bus.probe(address).await? {
            return Err(DeviceError::Construction(format!(
                "no device answers at address {address:#04x}"
            )));
        }

        let chip_id = bus.read(address, REG_CHIP_ID, 1).await?;
        let model = match chip_id.first() {
            Some(&CHIP_ID_BMP280) => DeviceModel::Bmp280,
            Some(&CHIP_ID_BME280) => DeviceModel::Bme280,
            other => {
                return Err(DeviceError::Construction(format!(
                    "unrecognized chip id {other:?} at address {address:#04x}"
                )))
            }
        };
        if model != expected {
            return Err(DeviceError::Construction(format!(
                "address {address:#04x} carries a {model}, config says {expected}"
            )));
        }

        bus.write(address, REG_RESET, &[RESET_WORD]).await?;
        let mut settled = false;
        for _ in 0..RESET_POLL_LIMIT {
            tokio::time::sleep(RESET_POLL_DELAY).await;
            let status = bus.read(address, REG_STATUS, 1).await?;
            if status.first().copied().unwrap_or(STATUS_IM_UPDATE) & STATUS_IM_UPDATE == 0 {
                settled = true;
                break;
            }
        }
        if !settled {
            return Err(DeviceError::Timing(
                "calibration copy still running after reset".into(),
            ));
        }

        let tp = bus.read(address, REG_CALIB_TP, 26).await?;
        let hum = if model == DeviceModel::Bme280 {
            Some(bus.read(address, REG_CALIB_HUM, 7).await?)
        } else {
            None
        };
        let calibration = Calibration::parse(&tp, hum.as_deref())?;

        let mut sensor = Self {
            id: id.to_string(),
            bus,
            address,
            model,
            calibration,
            temperature_oversampling: Oversampling::X1,
            pressure_oversampling: Oversampling::X1,
            humidity_oversampling: Oversampling::X1,
        };
        sensor.configure(Filter::Off, Standby::Ms0_5).await?;

        debug!(device = id, %model, "barometric sensor connected");
        Ok(sensor)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn set_oversampling(
        &mut self,
        temperature: Oversampling,
        pressure: Oversampling,
        humidity: Oversampling,
    ) {
        self.temperature_oversampling = temperature;
        self.pressure_oversampling = pressure;
        self.humidity_oversampling = humidity;
    }

    /// Typical conversion time for the current oversampling settings.
    pub fn measure_time(&self) -> Duration {
        let mut micros = 1_000u64;
        micros += 2_000 * u64::from(self.temperature_oversampling.factor());
        if self.pressure_oversampling != Oversampling::Skipped {
            micros += 2_000 * u64::from(self.pressure_oversampling.factor()) + 500;
        }
        if self.model == DeviceModel::Bme280
            && self.humidity_oversampling != Oversampling::Skipped
        {
            micros += 2_000 * u64::from(self.humidity_oversampling.factor()) + 500;
        }
        Duration::from_micros(micros)
    }

    /// Worst-case conversion time, used as the wait before polling.
    pub fn max_measure_time(&self) -> Duration {
        let mut micros = 1_250u64;
        micros += 2_300 * u64::from(self.temperature_oversampling.factor());
        if self.pressure_oversampling != Oversampling::Skipped {
            micros += 2_300 * u64::from(self.pressure_oversampling.factor()) + 575;
        }
        if self.model == DeviceModel::Bme280
            && self.humidity_oversampling != Oversampling::Skipped
        {
            micros += 2_300 * u64::from(self.humidity_oversampling.factor()) + 575;
        }
        Duration::from_micros(micros)
    }

    pub async fn configure(&mut self, filter: Filter, standby: Standby) -> DeviceResult<()> {
        self.update_register(REG_CONFIG, 0b1111_1100, (standby.bits() << 5) | (filter.bits() << 2))
            .await
    }

    /// Runs one forced-mode conversion and reads the compensated result.
    /// Temperature always comes first; the other channels depend on its
    /// fine-resolution intermediate.
    pub async fn measure(
        &mut self,
        now: DateTime<FixedOffset>,
    ) -> DeviceResult<Vec<MeasurementSample>> {
        // Humidity oversampling only latches on a ctrl_meas write, so the
        // humidity register is always written first.
        if self.model == DeviceModel::Bme280 {
            self.update_register(REG_CTRL_HUM, 0b0000_0111, self.humidity_oversampling.bits())
                .await?;
        }
        let meas = (self.temperature_oversampling.bits() << 5)
            | (self.pressure_oversampling.bits() << 2)
            | MODE_FORCED;
        self.bus.write(self.address, REG_CTRL_MEAS, &[meas]).await?;

        let typical = self.measure_time();
        tokio::time::sleep(typical).await;
        self.await_conversion(self.max_measure_time().saturating_sub(typical))
            .await?;

        let length = if self.model == DeviceModel::Bme280 { 8 } else { 6 };
        let data = self.bus.read(self.address, REG_DATA, length).await?;
        if data.len() < length {
            return Err(DeviceError::Protocol(format!(
                "short measurement burst ({} bytes)",
                data.len()
            )));
        }

        let adc_p = (i32::from(data[0]) << 12) | (i32::from(data[1]) << 4) | (i32::from(data[2]) >> 4);
        let adc_t = (i32::from(data[3]) << 12) | (i32::from(data[4]) << 4) | (i32::from(data[5]) >> 4);

        let (t_fine, celsius) = compensate_temperature(&self.calibration, adc_t);
        let celsius = celsius.clamp(TEMPERATURE_MIN, TEMPERATURE_MAX);
        let pascals = compensate_pressure(&self.calibration, adc_p, t_fine)
            .clamp(PRESSURE_MIN, PRESSURE_MAX);

        let mut samples = vec![
            MeasurementSample {
                timestamp: now,
                quantity: "temperature".to_string(),
                value: format!("{celsius:.2}"),
                unit: "°C".to_string(),
                minimum: TEMPERATURE_MIN,
                maximum: TEMPERATURE_MAX,
            },
            MeasurementSample {
                timestamp: now,
                quantity: "pressure".to_string(),
                value: format!("{pascals:.1}"),
                unit: "Pa".to_string(),
                minimum: PRESSURE_MIN,
                maximum: PRESSURE_MAX,
            },
        ];

        if self.model == DeviceModel::Bme280 {
            let adc_h = (i32::from(data[6]) << 8) | i32::from(data[7]);
            let humidity = compensate_humidity(&self.calibration, adc_h, t_fine)
                .clamp(HUMIDITY_MIN, HUMIDITY_MAX);
            samples.push(MeasurementSample {
                timestamp: now,
                quantity: "humidity".to_string(),
                value: format!("{humidity:.1}"),
                unit: "%RH".to_string(),
                minimum: HUMIDITY_MIN,
                maximum: HUMIDITY_MAX,
            });
        }

        Ok(samples)
    }

    /// Polls the measuring bit until it clears or `budget` runs out.
    async fn await_conversion(&mut self, budget: Duration) -> DeviceResult<()> {
        let polls = (budget.as_micros() / MEASURE_POLL_DELAY.as_micros()).max(1) as u32;
        for _ in 0..polls {
            let status = self.read_register(REG_STATUS).await?;
            if status & STATUS_MEASURING == 0 {
                return Ok(());
            }
            tokio::time::sleep(MEASURE_POLL_DELAY).await;
        }
        let status = self.read_register(REG_STATUS).await?;
        if status & STATUS_MEASURING == 0 {
            return Ok(());
        }
        Err(DeviceError::Timing(
            "conversion still running past the worst-case window".into(),
        ))
    }

    async fn read_register(&mut self, register: u8) -> DeviceResult<u8> {
        let bytes = self.bus.read(self.address, register, 1).await?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| DeviceError::Protocol(format!("empty read of register {register:#04x}")))
    }

    /// Read-modify-write of the bits under `mask`, preserving the rest.
    async fn update_register(&mut self, register: u8, mask: u8, value: u8) -> DeviceResult<()> {
        let current = self.read_register(register).await?;
        let next = (current & !mask) | (value & mask);
        self.bus.write(self.address, register, &[next]).await
    }
}
