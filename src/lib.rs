//! # Xeus Modbus - Spectrometer Client over Modbus RTU/TCP
//!
//! Async client for a laboratory spectrometer that speaks Modbus RTU framing directly
//! over a raw TCP stream (no MBAP header). It pulls IR and NMR spectra and PXE point
//! series out of the instrument's input registers and decodes them into physical values.
//!
//! ## Features
//!
//! - **RTU over TCP**: CRC16 framing, garbage-prefix recovery, soft CRC checking
//! - **Resilient session**: bounded reconnect and retry on connection-level failures
//! - **Chunked reads**: gapped register ranges split into device-sized requests, with
//!   optional ranges zero-filled when the device refuses them
//! - **Float decoding**: four byte orders with heuristic order detection
//! - **Profiles**: IR spectrum (normalized or raw), NMR spectrum, PXE series
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Use |
//! |------|----------|-----|
//! | 0x03 | Read Holding Registers | generic reads |
//! | 0x04 | Read Input Registers | measurement profiles, scalars |
//! | 0x06 | Write Single Register | relay control |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xeus_modbus::{InstrumentClient, InstrumentConfig, ModbusResult, ProfileKind};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = InstrumentConfig::new("192.168.0.7", 503);
//!     let mut client = InstrumentClient::connect(&config).await?;
//!
//!     let spectrum = client.read_profile(ProfileKind::Ir).await?;
//!     println!("{}", serde_json::to_string_pretty(&spectrum)?);
//!
//!     client.set_relay(1021, 2).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Profiles     │  IR / NMR / PXE layouts and decoding
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │     Reader      │  chunking, gaps, missing ranges
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │     Client      │  frames, CRC policy, scalars, relays
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Transport    │  TCP session, reconnect and retry
//! └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// RTU frame building and parsing
pub mod protocol;

/// TCP session carrying RTU frames
pub mod transport;

/// Instrument client
pub mod client;

/// Connection and decoding settings
pub mod config;

/// Sparse register storage for one logical read
pub mod register_map;

/// Chunked register reads over gapped ranges
pub mod reader;

/// Float and spectrum decoding
pub mod decode;

/// Measurement profiles
pub mod profiles;

/// Utility functions and performance monitoring
pub mod utils;

/// Callback-based frame logging
pub mod logging;

// Re-export main types for convenience
pub use client::{InstrumentClient, RegisterBlock};
pub use config::InstrumentConfig;
pub use decode::{ByteOrder, Calibration, OrderCalibration, Point, SpectrumCalibration};
pub use error::{MissingRange, ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use profiles::{
    IrRawSamples, IrSpectrum, MeasurementResult, NmrSpectrum, ProfileKind, PxeSeries, ReadInfo,
};
pub use protocol::{ModbusFunction, Response, ResponseKind};
pub use reader::{read_ranges, RangeReadOutcome, ReadPlan, ReaderConfig};
pub use transport::{
    Connector, ModbusTransport, RetryPolicy, TcpConnector, TcpRtuTransport, TransportConfig,
    TransportStats,
};
pub use utils::{OperationTimer, PerformanceMetrics};

/// TCP port the instrument's RTU gateway listens on
pub const DEFAULT_PORT: u16 = 503;

pub const DEFAULT_UNIT_ID: u8 = 1;

/// Maximum number of registers in a single read request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Xeus Modbus v{} - spectrometer client over Modbus RTU/TCP", VERSION)
}
