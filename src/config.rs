//! Instrument connection settings
//!
//! Every field has a default, so a config file only lists what differs:
//!
//! ```yaml
//! host: 192.168.0.7
//! transport:
//!   retry:
//!     max_attempts: 5
//! ```

use serde::{Deserialize, Serialize};

use crate::decode::Calibration;
use crate::error::{ModbusError, ModbusResult};
use crate::reader::ReaderConfig;
use crate::transport::TransportConfig;
use crate::utils::validation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub transport: TransportConfig,
    pub reader: ReaderConfig,
    pub calibration: Calibration,
    /// Fail reads whose reply CRC does not match
    pub strict_crc: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::DEFAULT_PORT,
            unit_id: crate::DEFAULT_UNIT_ID,
            transport: TransportConfig::default(),
            reader: ReaderConfig::default(),
            calibration: Calibration::default(),
            strict_crc: false,
        }
    }
}

impl InstrumentConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.json` file as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::configuration("Host must not be empty"));
        }
        if self.port == 0 {
            return Err(ModbusError::configuration("Port must not be 0"));
        }
        validation::validate_slave_id(self.unit_id)
            .map_err(|e| ModbusError::configuration(e.to_string()))?;
        if self.transport.retry.max_attempts == 0 {
            return Err(ModbusError::configuration("Retry policy needs at least one attempt"));
        }
        if self.transport.inter_byte_timeout_ms == 0 || self.transport.connect_timeout_ms == 0 {
            return Err(ModbusError::configuration("Timeouts must be positive"));
        }
        if self.reader.max_chunk == 0 || self.reader.max_chunk > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::configuration(format!(
                "Chunk size {} outside 1-{}",
                self.reader.max_chunk,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        let spectrum = &self.calibration.spectrum;
        if !(spectrum.baseline_fraction > 0.0 && spectrum.baseline_fraction <= 1.0) {
            return Err(ModbusError::configuration(format!(
                "Baseline fraction {} outside (0, 1]",
                spectrum.baseline_fraction
            )));
        }
        let order = &self.calibration.order;
        if !(order.nominal_low < order.nominal_high) {
            return Err(ModbusError::configuration("Nominal low bound must be below the high bound"));
        }
        Ok(())
    }
}
