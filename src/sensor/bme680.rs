//! Bosch BME680 over Linux I²C (`rppal`).
//!
//! Measurements run in forced mode: one conversion per [`Sensor::sample`]
//! call, after which the chip returns to sleep. Raw ADC counts are converted
//! with the datasheet floating point formulas and the factory coefficients
//! stored on the chip.

use super::{HeaterProfile, RawSample, Sensor, SensorError, SensorSettings};
use async_trait::async_trait;
use rppal::i2c::I2c;
use std::time::Duration;
use tracing::{debug, info, warn};

const CHIP_ID: u8 = 0x61;

const REG_CHIP_ID: u8 = 0xD0;
const REG_SOFT_RESET: u8 = 0xE0;
const SOFT_RESET_CMD: u8 = 0xB6;

const REG_COEFF_1: u8 = 0x89;
const COEFF_1_LEN: usize = 25;
const REG_COEFF_2: u8 = 0xE1;
const COEFF_2_LEN: usize = 16;

const REG_RES_HEAT_VAL: u8 = 0x00;
const REG_RES_HEAT_RANGE: u8 = 0x02;
const REG_RANGE_SW_ERR: u8 = 0x04;

const REG_FIELD_0: u8 = 0x1D;
const FIELD_LEN: usize = 15;

const REG_RES_HEAT_0: u8 = 0x5A;
const REG_GAS_WAIT_0: u8 = 0x64;
const REG_CTRL_GAS_0: u8 = 0x70;
const REG_CTRL_GAS_1: u8 = 0x71;
const REG_CTRL_HUM: u8 = 0x72;
const REG_CTRL_MEAS: u8 = 0x74;
const REG_CONFIG: u8 = 0x75;

const MODE_FORCED: u8 = 0x01;
const HEAT_OFF: u8 = 0x08;
const RUN_GAS: u8 = 0x10;

const NEW_DATA: u8 = 0x80;
const GAS_VALID: u8 = 0x20;
const HEAT_STABLE: u8 = 0x10;

const READY_POLLS: u32 = 10;
const READY_POLL_PERIOD: Duration = Duration::from_millis(10);

const GAS_RANGE_K1: [f64; 16] = [
    0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, -0.8, 0.0, 0.0, -0.2, -0.5, 0.0, -1.0, 0.0, 0.0,
];
const GAS_RANGE_K2: [f64; 16] = [
    0.0, 0.0, 0.0, 0.0, 0.1, 0.7, 0.0, -0.8, -0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
];

/// Factory trimming coefficients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    pub par_t1: u16,
    pub par_t2: i16,
    pub par_t3: i8,
    pub par_p1: u16,
    pub par_p2: i16,
    pub par_p3: i8,
    pub par_p4: i16,
    pub par_p5: i16,
    pub par_p6: i8,
    pub par_p7: i8,
    pub par_p8: i16,
    pub par_p9: i16,
    pub par_p10: u8,
    pub par_h1: u16,
    pub par_h2: u16,
    pub par_h3: i8,
    pub par_h4: i8,
    pub par_h5: i8,
    pub par_h6: u8,
    pub par_h7: i8,
    pub par_gh1: i8,
    pub par_gh2: i16,
    pub par_gh3: i8,
    pub res_heat_range: u8,
    pub res_heat_val: i8,
    pub range_sw_err: i8,
}

impl Calibration {
    /// Decodes the concatenation of both coefficient blocks (41 bytes).
    pub fn from_coefficients(c: &[u8; COEFF_1_LEN + COEFF_2_LEN]) -> Self {
        let word = |msb: usize, lsb: usize| u16::from_le_bytes([c[lsb], c[msb]]);

        Self {
            par_t1: word(34, 33),
            par_t2: word(2, 1) as i16,
            par_t3: c[3] as i8,
            par_p1: word(6, 5),
            par_p2: word(8, 7) as i16,
            par_p3: c[9] as i8,
            par_p4: word(12, 11) as i16,
            par_p5: word(14, 13) as i16,
            par_p6: c[16] as i8,
            par_p7: c[15] as i8,
            par_p8: word(20, 19) as i16,
            par_p9: word(22, 21) as i16,
            par_p10: c[23],
            par_h1: ((c[27] as u16) << 4) | ((c[26] as u16) & 0x0F),
            par_h2: ((c[25] as u16) << 4) | ((c[26] as u16) >> 4),
            par_h3: c[28] as i8,
            par_h4: c[29] as i8,
            par_h5: c[30] as i8,
            par_h6: c[31],
            par_h7: c[32] as i8,
            par_gh1: c[37] as i8,
            par_gh2: word(36, 35) as i16,
            par_gh3: c[38] as i8,
            ..Self::default()
        }
    }

    /// Returns `(temperature °C, t_fine)`.
    pub fn temperature(&self, adc: u32) -> (f64, f64) {
        let adc = adc as f64;
        let t1 = self.par_t1 as f64;
        let var1 = (adc / 16384.0 - t1 / 1024.0) * self.par_t2 as f64;
        let var2 = (adc / 131072.0 - t1 / 8192.0).powi(2) * (self.par_t3 as f64 * 16.0);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pressure in Pa.
    pub fn pressure(&self, adc: u32, t_fine: f64) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * (self.par_p6 as f64 / 131072.0);
        var2 += var1 * self.par_p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.par_p4 as f64 * 65536.0;
        var1 = (self.par_p3 as f64 * var1 * var1 / 16384.0 + self.par_p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.par_p1 as f64;

        if var1 == 0.0 {
            return 0.0;
        }

        let mut pressure = 1048576.0 - adc as f64;
        pressure = (pressure - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.par_p9 as f64 * pressure * pressure / 2147483648.0;
        let var2 = pressure * (self.par_p8 as f64 / 32768.0);
        let var3 = (pressure / 256.0).powi(3) * (self.par_p10 as f64 / 131072.0);
        pressure + (var1 + var2 + var3 + self.par_p7 as f64 * 128.0) / 16.0
    }

    /// Relative humidity in %, clamped to 0..=100.
    pub fn humidity(&self, adc: u16, t_fine: f64) -> f64 {
        let temp = t_fine / 5120.0;
        let var1 = adc as f64
            - (self.par_h1 as f64 * 16.0 + (self.par_h3 as f64 / 2.0) * temp);
        let var2 = var1
            * ((self.par_h2 as f64 / 262144.0)
                * (1.0
                    + (self.par_h4 as f64 / 16384.0) * temp
                    + (self.par_h5 as f64 / 1048576.0) * temp * temp));
        let var3 = self.par_h6 as f64 / 16384.0;
        let var4 = self.par_h7 as f64 / 2097152.0;
        let humidity = var2 + (var3 + var4 * temp) * var2 * var2;
        humidity.clamp(0.0, 100.0)
    }

    /// Gas resistance in Ω.
    pub fn gas_resistance(&self, adc: u16, range: u8) -> f64 {
        let range = (range & 0x0F) as usize;
        let var1 = 1340.0 + 5.0 * self.range_sw_err as f64;
        let var2 = var1 * (1.0 + GAS_RANGE_K1[range] / 100.0);
        let var3 = 1.0 + GAS_RANGE_K2[range] / 100.0;
        1.0 / (var3 * 0.000000125 * (1u32 << range) as f64 * ((adc as f64 - 512.0) / var2 + 1.0))
    }

    /// Heater resistance register value for `target` °C at `ambient` °C.
    pub fn heater_resistance(&self, target: u16, ambient: f64) -> u8 {
        let target = target.min(400) as f64;
        let var1 = self.par_gh1 as f64 / 16.0 + 49.0;
        let var2 = (self.par_gh2 as f64 / 32768.0) * 0.0005 + 0.00235;
        let var3 = self.par_gh3 as f64 / 1024.0;
        let var4 = var1 * (1.0 + var2 * target);
        let var5 = var4 + var3 * ambient;
        let res_heat = 3.4
            * (var5
                * (4.0 / (4.0 + self.res_heat_range as f64))
                * (1.0 / (1.0 + self.res_heat_val as f64 * 0.002))
                - 25.0);
        res_heat.clamp(0.0, 255.0) as u8
    }
}

/// Gas wait register encoding: 6-bit mantissa, 2-bit ×4 multiplier.
pub fn heater_duration(duration_ms: u16) -> u8 {
    if duration_ms >= 0xFC0 {
        return 0xFF;
    }
    let mut duration = duration_ms;
    let mut factor = 0u8;
    while duration > 0x3F {
        duration /= 4;
        factor += 1;
    }
    duration as u8 + factor * 64
}

/// Register-level access to the chip.
pub trait RegisterBus: Send {
    fn read_registers(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), SensorError>;
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError>;
}

impl RegisterBus for I2c {
    fn read_registers(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), SensorError> {
        self.write_read(&[register], buffer)
            .map_err(|e| SensorError::Transfer(format!("read 0x{:02x}: {}", register, e)))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.write(&[register, value])
            .map(|_| ())
            .map_err(|e| SensorError::Transfer(format!("write 0x{:02x}: {}", register, e)))
    }
}

pub struct Bme680<B = I2c> {
    regs: B,
    bus: u8,
    address: u16,
    calibration: Calibration,
    settings: SensorSettings,
    ambient_temperature: f64,
}

impl Bme680<I2c> {
    /// Opens the bus and attaches to the chip at `address`.
    pub async fn open(bus: u8, address: u16) -> Result<Self, SensorError> {
        info!("Opening BME680 on I2C bus {} at 0x{:02x}", bus, address);
        let mut i2c = I2c::with_bus(bus).map_err(|e| SensorError::BusUnavailable {
            bus,
            reason: e.to_string(),
        })?;
        i2c.set_slave_address(address)
            .map_err(|e| SensorError::BusUnavailable {
                bus,
                reason: e.to_string(),
            })?;

        Self::attach(i2c, bus, address).await
    }
}

impl<B: RegisterBus> Bme680<B> {
    /// Verifies the chip id, resets the chip and reads its calibration.
    pub async fn attach(regs: B, bus: u8, address: u16) -> Result<Self, SensorError> {
        let mut sensor = Self {
            regs,
            bus,
            address,
            calibration: Calibration::default(),
            settings: SensorSettings::default(),
            ambient_temperature: 25.0,
        };

        let chip_id = sensor.read_register(REG_CHIP_ID)?;
        if chip_id != CHIP_ID {
            return Err(SensorError::WrongChip {
                address,
                expected: CHIP_ID,
                found: chip_id,
            });
        }

        sensor.regs.write_register(REG_SOFT_RESET, SOFT_RESET_CMD)?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        sensor.calibration = sensor.read_calibration()?;
        debug!("BME680 calibration: {:?}", sensor.calibration);
        Ok(sensor)
    }

    fn read_register(&mut self, register: u8) -> Result<u8, SensorError> {
        let mut value = [0u8; 1];
        self.regs.read_registers(register, &mut value)?;
        Ok(value[0])
    }

    fn read_calibration(&mut self) -> Result<Calibration, SensorError> {
        let mut coefficients = [0u8; COEFF_1_LEN + COEFF_2_LEN];
        self.regs
            .read_registers(REG_COEFF_1, &mut coefficients[..COEFF_1_LEN])?;
        self.regs
            .read_registers(REG_COEFF_2, &mut coefficients[COEFF_1_LEN..])?;

        let mut calibration = Calibration::from_coefficients(&coefficients);
        calibration.res_heat_range = (self.read_register(REG_RES_HEAT_RANGE)? & 0x30) >> 4;
        calibration.res_heat_val = self.read_register(REG_RES_HEAT_VAL)? as i8;
        calibration.range_sw_err = (self.read_register(REG_RANGE_SW_ERR)? as i8) >> 4;
        Ok(calibration)
    }

    /// Heater set-point for the latest ambient temperature.
    fn write_heater_resistance(&mut self, heater: HeaterProfile) -> Result<(), SensorError> {
        let resistance = self
            .calibration
            .heater_resistance(heater.temperature_celsius, self.ambient_temperature);
        self.regs
            .write_register(REG_RES_HEAT_0 + heater.profile, resistance)
    }

    fn write_heater(&mut self) -> Result<(), SensorError> {
        match self.settings.heater {
            Some(heater) => {
                self.write_heater_resistance(heater)?;
                self.regs.write_register(
                    REG_GAS_WAIT_0 + heater.profile,
                    heater_duration(heater.duration_ms),
                )?;
                self.regs.write_register(REG_CTRL_GAS_0, 0x00)?;
                self.regs
                    .write_register(REG_CTRL_GAS_1, RUN_GAS | (heater.profile & 0x0F))
            }
            None => {
                self.regs.write_register(REG_CTRL_GAS_0, HEAT_OFF)?;
                self.regs.write_register(REG_CTRL_GAS_1, 0x00)
            }
        }
    }

    fn ctrl_meas(&self, mode: u8) -> u8 {
        (self.settings.temperature_oversampling.bits() << 5)
            | (self.settings.pressure_oversampling.bits() << 2)
            | mode
    }

    fn measurement_duration(&self) -> Duration {
        let cycles = self.settings.temperature_oversampling.cycles()
            + self.settings.pressure_oversampling.cycles()
            + self.settings.humidity_oversampling.cycles();
        let micros = cycles * 1963 + 477 * 4 + 477 * 5 + 500;
        let mut millis = (micros as u64 + 500) / 1000 + 1;
        if let Some(heater) = self.settings.heater {
            millis += heater.duration_ms as u64;
        }
        Duration::from_millis(millis)
    }
}

#[async_trait]
impl<B: RegisterBus> Sensor for Bme680<B> {
    async fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError> {
        info!("Configuring {} with {:?}", self.describe(), settings);
        if let Some(heater) = settings.heater {
            if heater.profile > 9 {
                return Err(SensorError::InvalidSettings(format!(
                    "heater profile {} out of range 0-9",
                    heater.profile
                )));
            }
        }
        self.settings = *settings;

        self.regs
            .write_register(REG_CTRL_HUM, settings.humidity_oversampling.bits() & 0x07)?;
        self.regs
            .write_register(REG_CONFIG, (settings.filter.bits() << 2) & 0x1C)?;
        let sleep_mode = self.ctrl_meas(0);
        self.regs.write_register(REG_CTRL_MEAS, sleep_mode)?;
        self.write_heater()
    }

    async fn sample(&mut self) -> Result<RawSample, SensorError> {
        if let Some(heater) = self.settings.heater {
            self.write_heater_resistance(heater)?;
        }
        let forced = self.ctrl_meas(MODE_FORCED);
        self.regs.write_register(REG_CTRL_MEAS, forced)?;
        let conversion = self.measurement_duration();
        tokio::time::sleep(conversion).await;

        let mut field = [0u8; FIELD_LEN];
        let mut attempts = 0;
        loop {
            self.regs.read_registers(REG_FIELD_0, &mut field)?;
            if field[0] & NEW_DATA != 0 {
                break;
            }
            attempts += 1;
            if attempts >= READY_POLLS {
                return Err(SensorError::NotReady { attempts });
            }
            tokio::time::sleep(READY_POLL_PERIOD).await;
        }

        let pressure_adc =
            ((field[2] as u32) << 12) | ((field[3] as u32) << 4) | ((field[4] as u32) >> 4);
        let temperature_adc =
            ((field[5] as u32) << 12) | ((field[6] as u32) << 4) | ((field[7] as u32) >> 4);
        let humidity_adc = ((field[8] as u16) << 8) | field[9] as u16;
        let gas_adc = ((field[13] as u16) << 2) | ((field[14] as u16) >> 6);
        let gas_range = field[14] & 0x0F;

        let gas_status = field[14] & (GAS_VALID | HEAT_STABLE);
        if self.settings.heater.is_some() && gas_status != (GAS_VALID | HEAT_STABLE) {
            warn!(
                "Gas measurement not stable (status 0x{:02x}), resistance may be inaccurate",
                field[14]
            );
        }

        let (temperature, t_fine) = self.calibration.temperature(temperature_adc);
        self.ambient_temperature = temperature;

        let sample = RawSample {
            temperature,
            pressure: self.calibration.pressure(pressure_adc, t_fine) / 100.0,
            humidity: self.calibration.humidity(humidity_adc, t_fine),
            gas_resistance: self.calibration.gas_resistance(gas_adc, gas_range),
        };
        debug!("BME680 sample: {:?}", sample);
        Ok(sample)
    }

    fn describe(&self) -> String {
        format!("BME680 (i2c-{} @ 0x{:02x})", self.bus, self.address)
    }
}
