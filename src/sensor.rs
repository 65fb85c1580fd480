//! Sensor variants.
//!
//! Each supported sensor is a [`SensorKind`] variant resolved once from the
//! configured name. Register contents stay opaque: calibration replays the
//! register values supplied in [`SensorProperties`].

use crate::bus::{AddressWidth, Command, CommandScript};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque register value supplied by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    pub register: u16,
    pub value: Vec<u8>,
}

/// Per-run sensor settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorProperties {
    /// Exposure time in milliseconds
    #[serde(default)]
    pub exposure_ms: Option<f32>,

    /// Per-channel gains (R, Gr, Gb, B)
    #[serde(default)]
    pub gains: Option<[f32; 4]>,

    #[serde(default)]
    pub registers: Vec<RegisterValue>,
}

/// Where and how to reach the sensor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Bus device the sensor hangs off
    #[serde(default)]
    pub bus_device: u32,

    /// 7-bit address, the sensor's default when absent
    #[serde(default)]
    pub sensor_address: Option<u8>,

    #[serde(default)]
    pub crystal_frequency_mhz: Option<f32>,
}

/// Capabilities every sensor variant provides
pub trait SensorProfile {
    fn name(&self) -> &'static str;

    fn address_width(&self) -> AddressWidth;

    /// Fragment embedded in output filenames
    fn filename_tag(&self, properties: &SensorProperties) -> String;

    /// Register script applying `properties` to the sensor
    fn calibrate(&self, properties: &SensorProperties, params: &CalibrationParameters) -> Result<CommandScript>;
}

/// Supported sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Ov10640,
    Ar0231,
}

impl SensorKind {
    pub const ALL: [SensorKind; 2] = [SensorKind::Ov10640, SensorKind::Ar0231];

    /// Resolve a configured name such as "OV10640" or "ar0231-rccb"
    pub fn resolve(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| lower.starts_with(kind.name()))
            .ok_or_else(|| PipelineError::Config(format!("unsupported sensor `{name}`")))
    }

    /// Longest exposure the sensor accepts at its nominal frame rate
    pub fn max_exposure_ms(&self) -> f32 {
        match self {
            SensorKind::Ov10640 => 30.0,
            SensorKind::Ar0231 => 33.0,
        }
    }

    /// Default 7-bit bus address
    pub fn default_address(&self) -> u8 {
        match self {
            SensorKind::Ov10640 => 0x30,
            SensorKind::Ar0231 => 0x10,
        }
    }

    fn exposure(&self, properties: &SensorProperties) -> Result<Option<f32>> {
        match properties.exposure_ms {
            Some(ms) if !(0.0..=self.max_exposure_ms()).contains(&ms) => Err(PipelineError::Config(format!(
                "{} exposure {ms} ms outside 0..={} ms",
                self.name(),
                self.max_exposure_ms()
            ))),
            other => Ok(other),
        }
    }
}

impl SensorProfile for SensorKind {
    fn name(&self) -> &'static str {
        match self {
            SensorKind::Ov10640 => "ov10640",
            SensorKind::Ar0231 => "ar0231",
        }
    }

    fn address_width(&self) -> AddressWidth {
        AddressWidth::Two
    }

    fn filename_tag(&self, properties: &SensorProperties) -> String {
        let Some(exposure) = properties.exposure_ms else {
            return String::new();
        };
        let gain = properties.gains.map(|g| g[0]).unwrap_or(1.0);
        match self {
            SensorKind::Ov10640 => format!("_e{exposure:.2}ms_g{gain:.2}"),
            SensorKind::Ar0231 => format!("_et{exposure:.2}_dg{gain:.2}"),
        }
    }

    fn calibrate(&self, properties: &SensorProperties, params: &CalibrationParameters) -> Result<CommandScript> {
        self.exposure(properties)?;
        let address = params.sensor_address.unwrap_or_else(|| self.default_address());

        let mut script = CommandScript::new();
        script.push(Command::device_select(params.bus_device))?;
        for entry in &properties.registers {
            script.push(Command::write(self.address_width(), address, entry.register, entry.value.clone()))?;
        }
        tracing::debug!(
            "{} calibration: {} register writes on device {}",
            self.name(),
            properties.registers.len(),
            params.bus_device
        );
        Ok(script)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CommandKind;

    #[test]
    fn test_resolve_by_prefix() {
        assert_eq!(SensorKind::resolve("OV10640").unwrap(), SensorKind::Ov10640);
        assert_eq!(SensorKind::resolve("ar0231-rccb").unwrap(), SensorKind::Ar0231);
        assert!(matches!(
            SensorKind::resolve("imx390"),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_filename_tags() {
        let properties = SensorProperties {
            exposure_ms: Some(11.5),
            gains: Some([2.0, 1.0, 1.0, 1.5]),
            registers: Vec::new(),
        };
        assert_eq!(SensorKind::Ov10640.filename_tag(&properties), "_e11.50ms_g2.00");
        assert_eq!(SensorKind::Ar0231.filename_tag(&properties), "_et11.50_dg2.00");
        assert_eq!(SensorKind::Ar0231.filename_tag(&SensorProperties::default()), "");
    }

    #[test]
    fn test_calibrate_emits_device_select_then_writes() {
        let properties = SensorProperties {
            exposure_ms: Some(10.0),
            gains: None,
            registers: vec![
                RegisterValue { register: 0x3012, value: vec![0x01, 0x00] },
                RegisterValue { register: 0x3060, value: vec![0x22] },
            ],
        };
        let params = CalibrationParameters {
            bus_device: 3,
            ..Default::default()
        };
        let script = SensorKind::Ar0231.calibrate(&properties, &params).unwrap();
        let commands = script.commands();

        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].kind, CommandKind::DeviceSelect);
        assert_eq!(commands[0].argument, 3);
        assert_eq!(commands[1].kind, CommandKind::Write2);
        assert_eq!(commands[1].target.device, 0x10);
        assert_eq!(commands[2].payload, vec![0x22]);
    }

    #[test]
    fn test_exposure_limit() {
        let properties = SensorProperties {
            exposure_ms: Some(31.0),
            ..Default::default()
        };
        let params = CalibrationParameters::default();
        assert!(SensorKind::Ov10640.calibrate(&properties, &params).is_err());
        assert!(SensorKind::Ar0231.calibrate(&properties, &params).is_ok());
    }
}
