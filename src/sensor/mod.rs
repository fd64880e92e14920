//! # Environmental Sensor
//!
//! The publish loop only sees the [`Sensor`] trait: configure once, then
//! sample on demand. [`bme680`] provides the I²C adapter for the Bosch BME680
//! on a Raspberry Pi bus.
//!
//! Errors carry a severity. A fatal error (wrong chip, missing bus) stops the
//! daemon; anything else costs a single poll cycle.

pub mod bme680;

use async_trait::async_trait;
use thiserror::Error;

/// One raw measurement in sensor units (°C, hPa, %RH, Ω).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub gas_resistance: f64,
}

/// Oversampling factor for one measurement channel.
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
    /// 3-bit register encoding.
    pub fn bits(self) -> u8 {
        match self {
            Oversampling::Skipped => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 3,
            Oversampling::X8 => 4,
            Oversampling::X16 => 5,
        }
    }

    pub fn cycles(self) -> u32 {
        match self {
            Oversampling::Skipped => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// IIR filter coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSize {
    Off,
    Size1,
    Size3,
    Size7,
    Size15,
    Size31,
    Size63,
    Size127,
}

impl FilterSize {
    pub fn bits(self) -> u8 {
        match self {
            FilterSize::Off => 0,
            FilterSize::Size1 => 1,
            FilterSize::Size3 => 2,
            FilterSize::Size7 => 3,
            FilterSize::Size15 => 4,
            FilterSize::Size31 => 5,
            FilterSize::Size63 => 6,
            FilterSize::Size127 => 7,
        }
    }
}

/// Gas heater set-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaterProfile {
    pub profile: u8,
    pub temperature_celsius: u16,
    pub duration_ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSettings {
    pub humidity_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub temperature_oversampling: Oversampling,
    pub filter: FilterSize,
    /// `None` disables the gas measurement.
    pub heater: Option<HeaterProfile>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            humidity_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X4,
            temperature_oversampling: Oversampling::X8,
            filter: FilterSize::Size3,
            heater: Some(HeaterProfile {
                profile: 0,
                temperature_celsius: 320,
                duration_ms: 150,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Failed to open I2C bus {bus}: {reason}")]
    BusUnavailable { bus: u8, reason: String },

    #[error("Unexpected chip id 0x{found:02x} at address 0x{address:02x} (expected 0x{expected:02x})")]
    WrongChip { address: u16, expected: u8, found: u8 },

    #[error("I2C transfer failed: {0}")]
    Transfer(String),

    #[error("Measurement not ready after {attempts} polls")]
    NotReady { attempts: u32 },

    #[error("Invalid sensor configuration: {0}")]
    InvalidSettings(String),
}

impl SensorError {
    /// Whether the daemon can no longer expect a usable reading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SensorError::BusUnavailable { .. }
                | SensorError::WrongChip { .. }
                | SensorError::InvalidSettings(_)
        )
    }
}

#[async_trait]
pub trait Sensor: Send {
    /// Applies oversampling, filter and heater settings.
    async fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError>;

    /// Takes one measurement.
    async fn sample(&mut self) -> Result<RawSample, SensorError>;

    /// Short human readable identity for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_settings() {
        let settings = SensorSettings::default();
        assert_eq!(settings.humidity_oversampling, Oversampling::X2);
        assert_eq!(settings.pressure_oversampling, Oversampling::X4);
        assert_eq!(settings.temperature_oversampling, Oversampling::X8);
        assert_eq!(settings.filter.bits(), 2);
        let heater = settings.heater.unwrap();
        assert_eq!(heater.temperature_celsius, 320);
        assert_eq!(heater.duration_ms, 150);
        assert_eq!(heater.profile, 0);
    }

    #[test]
    fn only_identity_and_setup_errors_are_fatal() {
        assert!(SensorError::WrongChip {
            address: 0x76,
            expected: 0x61,
            found: 0x60
        }
        .is_fatal());
        assert!(!SensorError::NotReady { attempts: 10 }.is_fatal());
        assert!(!SensorError::Transfer("nack".into()).is_fatal());
    }
}
