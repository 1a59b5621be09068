//! Instrument client
//!
//! [`InstrumentClient`] is the caller-facing façade over one transport session. It builds
//! frames, parses replies, applies the CRC policy and exposes register reads and writes,
//! scalar helpers, relay control and the measurement profiles.
//!
//! The device sometimes swallows the first request after a (re)connection, so
//! state-dependent operations use the primed pattern: send the read twice, keep the
//! second reply.

use log::{debug, warn};

use crate::config::InstrumentConfig;
use crate::decode::{float_from_words, int16_from_u16, ByteOrder, Calibration};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::profiles::{self, MeasurementResult, ProfileKind};
use crate::protocol::{
    build_read_frame, build_write_frame, parse_response, ModbusFunction, Response, SlaveId,
    MIN_FRAME_LEN,
};
use crate::reader::ReaderConfig;
use crate::transport::{ModbusTransport, TcpRtuTransport, TransportStats};
use crate::utils::{validation, OperationTimer, PerformanceMetrics};

/// Registers of one successful read request
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock {
    pub registers: Vec<u16>,
    /// False when the reply CRC did not match and strict mode is off
    pub crc_valid: bool,
}

/// Client for the spectrometer over any [`ModbusTransport`]
pub struct InstrumentClient<T: ModbusTransport> {
    transport: T,
    unit_id: SlaveId,
    logger: Option<CallbackLogger>,
    metrics: PerformanceMetrics,
    strict_crc: bool,
    reader: ReaderConfig,
    calibration: Calibration,
}

impl InstrumentClient<TcpRtuTransport> {
    /// Connect to the instrument described by `config`
    pub async fn connect(config: &InstrumentConfig) -> ModbusResult<Self> {
        config.validate()?;
        let transport =
            TcpRtuTransport::connect(&config.host, config.port, config.transport.clone()).await?;
        let mut client = Self::new(transport, config.unit_id)?;
        client.strict_crc = config.strict_crc;
        client.reader = config.reader.clone();
        client.calibration = config.calibration.clone();
        Ok(client)
    }
}

impl<T: ModbusTransport> InstrumentClient<T> {
    pub fn new(transport: T, unit_id: SlaveId) -> ModbusResult<Self> {
        validation::validate_slave_id(unit_id)?;
        Ok(Self {
            transport,
            unit_id,
            logger: None,
            metrics: PerformanceMetrics::new(),
            strict_crc: false,
            reader: ReaderConfig::default(),
            calibration: Calibration::default(),
        })
    }

    /// Create a client that reports every frame to `logger`
    pub fn with_logger(transport: T, unit_id: SlaveId, logger: CallbackLogger) -> ModbusResult<Self> {
        let mut client = Self::new(transport, unit_id)?;
        client.logger = Some(logger);
        Ok(client)
    }

    pub fn set_logger(&mut self, logger: Option<CallbackLogger>) {
        self.logger = logger;
    }

    /// Reject replies with a bad CRC instead of flagging them
    pub fn set_strict_crc(&mut self, strict: bool) {
        self.strict_crc = strict;
    }

    pub fn set_reader_config(&mut self, reader: ReaderConfig) {
        self.reader = reader;
    }

    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    pub fn unit_id(&self) -> SlaveId {
        self.unit_id
    }

    pub fn reader_config(&self) -> &ReaderConfig {
        &self.reader
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    pub async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    /// Send one frame and parse the reply
    async fn execute(&mut self, frame: &[u8], function: ModbusFunction) -> ModbusResult<Response> {
        if let Some(ref logger) = self.logger {
            logger.log_request(frame);
        }

        let reply = self.transport.exchange(frame).await?;

        if let Some(ref logger) = self.logger {
            logger.log_response(&reply, self.unit_id, function);
        }
        if reply.is_empty() {
            return Err(ModbusError::short_response(0, MIN_FRAME_LEN));
        }

        let response = parse_response(&reply, self.unit_id, function)?;
        if response.skipped > 0 {
            debug!("Skipped {} garbage bytes before reply", response.skipped);
        }
        if !response.crc_valid {
            if self.strict_crc {
                return response.require_valid_crc();
            }
            warn!(
                "CRC mismatch on {} reply (received 0x{:04X}, calculated 0x{:04X})",
                function, response.received_crc, response.calculated_crc
            );
        }
        Ok(response)
    }

    /// Read `quantity` registers with one request
    ///
    /// A reply with fewer registers than requested fails with
    /// [`ModbusError::Truncated`] carrying what did arrive.
    pub async fn read_block(
        &mut self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<RegisterBlock> {
        let timer = OperationTimer::start(format!("{} {}+{}", function, address, quantity));
        let result = self.read_block_inner(function, address, quantity).await;
        self.metrics.record(timer.finish(result.is_ok()), result.is_ok());
        result
    }

    async fn read_block_inner(
        &mut self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<RegisterBlock> {
        let frame = build_read_frame(function, address, quantity, self.unit_id)?;
        let response = self.execute(&frame, function).await?;
        let crc_valid = response.crc_valid;
        let mut registers = response.into_registers()?;

        if registers.len() < quantity as usize {
            let available = registers.len() * 2;
            return Err(ModbusError::truncated(quantity as usize * 2, available, registers));
        }
        if registers.len() > quantity as usize {
            warn!(
                "Reply at {} carried {} registers, {} requested; dropping the excess",
                address,
                registers.len(),
                quantity
            );
            registers.truncate(quantity as usize);
        }
        Ok(RegisterBlock { registers, crc_valid })
    }

    /// Read input registers; every register must arrive
    pub async fn read_registers(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let block = self
            .read_block(ModbusFunction::ReadInputRegisters, address, quantity)
            .await?;
        Ok(block.registers)
    }

    /// Read twice and keep the second reply
    ///
    /// The first attempt only wakes the device; its failure is logged and ignored.
    pub async fn read_registers_primed(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        if let Err(e) = self.read_registers(address, quantity).await {
            debug!("Priming read at {} failed: {}", address, e);
        }
        self.read_registers(address, quantity).await
    }

    /// Write one holding register and check the echo
    pub async fn write_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let timer = OperationTimer::start(format!("write {}={}", address, value));
        let result = self.write_register_inner(address, value).await;
        self.metrics.record(timer.finish(result.is_ok()), result.is_ok());
        result
    }

    async fn write_register_inner(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let frame = build_write_frame(address, value, self.unit_id)?;
        let response = self.execute(&frame, ModbusFunction::WriteSingleRegister).await?;
        let (echo_address, echo_value) = response.into_write_echo()?;
        if echo_address != address || echo_value != value {
            return Err(ModbusError::frame(format!(
                "Write echo mismatch: sent {}={}, got {}={}",
                address, value, echo_address, echo_value
            )));
        }
        Ok(())
    }

    /// Unsigned value of one input register
    pub async fn read_u16(&mut self, address: u16) -> ModbusResult<u16> {
        let registers = self.read_registers(address, 1).await?;
        Ok(registers[0])
    }

    /// Signed value of one input register
    pub async fn read_i16(&mut self, address: u16) -> ModbusResult<i16> {
        Ok(int16_from_u16(self.read_u16(address).await?))
    }

    /// Float stored low word first at `address`, `address + 1`
    pub async fn read_float(&mut self, address: u16) -> ModbusResult<f32> {
        let registers = self.read_registers(address, 2).await?;
        Ok(float_from_words(registers[0], registers[1], ByteOrder::CDAB))
    }

    /// Switch on relay `relay` (1-8), a bit in the low byte of `address`
    ///
    /// Reads the register (primed), sets the bit keeping the high byte and writes the
    /// value back twice. Returns the value written.
    pub async fn set_relay(&mut self, address: u16, relay: u8) -> ModbusResult<u16> {
        validation::validate_relay(relay)?;

        let current = self.read_registers_primed(address, 1).await?[0];
        let low = (current & 0x00FF) | (1 << (relay - 1));
        let value = (current & 0xFF00) | low;
        debug!(
            "Relay {} at {}: 0x{:04X} -> 0x{:04X}",
            relay, address, current, value
        );

        let first = self.write_register(address, value).await;
        if let Err(ref e) = first {
            debug!("First relay write failed: {}", e);
        }
        match self.write_register(address, value).await {
            Ok(()) => Ok(value),
            Err(e) if first.is_ok() => {
                warn!("Repeated relay write failed after a confirmed write: {}", e);
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Read and decode a measurement profile
    pub async fn read_profile(&mut self, kind: ProfileKind) -> ModbusResult<MeasurementResult> {
        profiles::read_profile(self, kind).await
    }
}
