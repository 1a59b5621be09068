//! Modbus RTU frame codec
//!
//! Builds request frames and parses instrument replies for RTU framing carried over a
//! raw TCP stream (no MBAP header):
//!
//! ```text
//! [unit_id:1][function:1][payload][crc_lo:1][crc_hi:1]
//! ```
//!
//! Replies are parsed once into a tagged [`Response`] which downstream layers consume
//! exhaustively. CRC validity is reported as a flag, not enforced.

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};
use crate::utils::validation;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Smallest valid reply: unit + function + one byte + CRC
pub const MIN_FRAME_LEN: usize = 5;

/// Length of a write-single-register request or echo
pub const WRITE_FRAME_LEN: usize = 8;

/// Bit set on the function code of exception replies
pub const EXCEPTION_BIT: u8 = 0x80;

/// CRC calculator for RTU (poly 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function codes spoken by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            _ => Err(ModbusError::invalid_data(format!(
                "Unsupported function code: 0x{:02X}",
                value
            ))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes emitted by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    MemoryParityError = 0x08,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::SlaveDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::SlaveDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::SlaveDeviceFailure => "Slave Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::SlaveDeviceBusy => "Slave Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
        };
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), name)
    }
}

/// Compute the Modbus CRC16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC16 trailer, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Build a read request frame (function 0x03 or 0x04)
pub fn build_read_frame(
    function: ModbusFunction,
    address: ModbusAddress,
    quantity: u16,
    unit_id: SlaveId,
) -> ModbusResult<Vec<u8>> {
    if !function.is_read_function() {
        return Err(ModbusError::invalid_data(format!(
            "{} is not a read function",
            function
        )));
    }
    validation::validate_slave_id(unit_id)?;
    validation::validate_register_count(quantity)?;
    validation::validate_address_range(address, quantity)?;

    let mut frame = Vec::with_capacity(WRITE_FRAME_LEN);
    frame.push(unit_id);
    frame.push(function.to_u8());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    append_crc(&mut frame);
    Ok(frame)
}

/// Build a write-single-register request frame (function 0x06)
pub fn build_write_frame(
    address: ModbusAddress,
    value: ModbusValue,
    unit_id: SlaveId,
) -> ModbusResult<Vec<u8>> {
    validation::validate_slave_id(unit_id)?;

    let mut frame = Vec::with_capacity(WRITE_FRAME_LEN);
    frame.push(unit_id);
    frame.push(ModbusFunction::WriteSingleRegister.to_u8());
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    Ok(frame)
}

/// Build a register read reply, as the instrument would send it
pub fn build_read_response(unit_id: SlaveId, function: ModbusFunction, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + registers.len() * 2);
    frame.push(unit_id);
    frame.push(function.to_u8());
    frame.push((registers.len() * 2) as u8);
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Build an exception reply, as the instrument would send it
pub fn build_exception_response(unit_id: SlaveId, function: ModbusFunction, code: u8) -> Vec<u8> {
    let mut frame = vec![unit_id, function.to_u8() | EXCEPTION_BIT, code];
    append_crc(&mut frame);
    frame
}

/// Decoded body of an instrument reply
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Register values of a 0x03/0x04 reply
    ReadOk { registers: Vec<u16> },
    /// Echo of a 0x06 write
    WriteOk { address: ModbusAddress, value: ModbusValue },
    /// Exception reply; `function` has the exception bit cleared
    Exception { function: u8, code: u8 },
    /// Frame recognized but structurally unusable
    Malformed { reason: String },
}

/// Parsed view of one received frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub unit_id: SlaveId,
    pub kind: ResponseKind,
    /// Soft integrity signal; decoding continues on mismatch
    pub crc_valid: bool,
    pub received_crc: u16,
    pub calculated_crc: u16,
    /// Garbage bytes skipped before the frame start
    pub skipped: usize,
}

impl Response {
    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        matches!(self.kind, ResponseKind::Exception { .. })
    }

    /// Turn a CRC mismatch into a hard error
    pub fn require_valid_crc(self) -> ModbusResult<Self> {
        if self.crc_valid {
            Ok(self)
        } else {
            Err(ModbusError::crc_mismatch(self.calculated_crc, self.received_crc))
        }
    }

    /// Extract register values, mapping every other outcome to an error
    pub fn into_registers(self) -> ModbusResult<Vec<u16>> {
        match self.kind {
            ResponseKind::ReadOk { registers } => Ok(registers),
            ResponseKind::Exception { function, code } => Err(ModbusError::exception(function, code)),
            ResponseKind::WriteOk { .. } => Err(ModbusError::unexpected_function(
                ModbusFunction::ReadInputRegisters.to_u8(),
                ModbusFunction::WriteSingleRegister.to_u8(),
            )),
            ResponseKind::Malformed { reason } => Err(ModbusError::frame(reason)),
        }
    }

    /// Extract the write echo, mapping every other outcome to an error
    pub fn into_write_echo(self) -> ModbusResult<(ModbusAddress, ModbusValue)> {
        match self.kind {
            ResponseKind::WriteOk { address, value } => Ok((address, value)),
            ResponseKind::Exception { function, code } => Err(ModbusError::exception(function, code)),
            ResponseKind::ReadOk { .. } => Err(ModbusError::unexpected_function(
                ModbusFunction::WriteSingleRegister.to_u8(),
                ModbusFunction::ReadInputRegisters.to_u8(),
            )),
            ResponseKind::Malformed { reason } => Err(ModbusError::frame(reason)),
        }
    }
}

fn locate_frame(buffer: &[u8], unit_id: SlaveId, function: u8) -> Option<usize> {
    buffer.windows(2).position(|pair| {
        pair[0] == unit_id && (pair[1] == function || pair[1] == function | EXCEPTION_BIT)
    })
}

/// Offset of the first `[unit_id, function | function+0x80]` signature
///
/// The transport occasionally prepends stray bytes to replies. Returns 0 when no
/// signature is present so callers parse the buffer as-is.
pub fn find_frame_start(buffer: &[u8], unit_id: SlaveId, function: u8) -> usize {
    locate_frame(buffer, unit_id, function).unwrap_or(0)
}

/// Total buffer length at which the reply frame is complete
///
/// Returns `None` while the header needed to size the frame has not arrived yet.
pub fn expected_frame_len(buffer: &[u8], unit_id: SlaveId, function: u8) -> Option<usize> {
    let start = locate_frame(buffer, unit_id, function)?;
    let frame = &buffer[start..];
    if frame[1] & EXCEPTION_BIT != 0 {
        return Some(start + MIN_FRAME_LEN);
    }
    match function {
        0x03 | 0x04 => frame.get(2).map(|&byte_count| start + MIN_FRAME_LEN + byte_count as usize),
        0x06 => Some(start + WRITE_FRAME_LEN),
        _ => None,
    }
}

fn check_crc(frame: &[u8]) -> (bool, u16, u16) {
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = crc16(&frame[..data_len]);
    (received == calculated, received, calculated)
}

fn registers_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Parse a reply to a request of `expected` function
///
/// Garbage before the frame signature is skipped. Exceptions and structurally odd
/// frames come back as `Ok` with the matching [`ResponseKind`]; `Err` is reserved for
/// replies that cannot be interpreted at all.
pub fn parse_response(
    bytes: &[u8],
    unit_id: SlaveId,
    expected: ModbusFunction,
) -> ModbusResult<Response> {
    let skipped = find_frame_start(bytes, unit_id, expected.to_u8());
    let frame = &bytes[skipped..];

    if frame.len() < MIN_FRAME_LEN {
        return Err(ModbusError::short_response(frame.len(), MIN_FRAME_LEN));
    }

    let reply_unit = frame[0];
    let function = frame[1];

    let respond = |frame: &[u8], kind: ResponseKind| {
        let (crc_valid, received_crc, calculated_crc) = check_crc(frame);
        Response {
            unit_id: reply_unit,
            kind,
            crc_valid,
            received_crc,
            calculated_crc,
            skipped,
        }
    };

    if reply_unit != unit_id {
        let reason = format!("unit id mismatch: expected {}, got {}", unit_id, reply_unit);
        return Ok(respond(frame, ResponseKind::Malformed { reason }));
    }

    if function == expected.to_u8() | EXCEPTION_BIT {
        let frame = &frame[..MIN_FRAME_LEN];
        let kind = ResponseKind::Exception {
            function: function & !EXCEPTION_BIT,
            code: frame[2],
        };
        return Ok(respond(frame, kind));
    }

    if function != expected.to_u8() {
        return Err(ModbusError::unexpected_function(expected.to_u8(), function));
    }

    match expected {
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            let byte_count = frame[2] as usize;
            let needed = MIN_FRAME_LEN + byte_count;
            if frame.len() < needed {
                // Whatever precedes the last two bytes is usable register data
                let available = frame.len() - MIN_FRAME_LEN;
                let salvaged = registers_from_bytes(&frame[3..3 + available]);
                return Err(ModbusError::truncated(byte_count, available, salvaged));
            }
            let frame = &frame[..needed];
            if byte_count % 2 != 0 {
                let reason = format!("odd register byte count {}", byte_count);
                return Ok(respond(frame, ResponseKind::Malformed { reason }));
            }
            let registers = registers_from_bytes(&frame[3..3 + byte_count]);
            Ok(respond(frame, ResponseKind::ReadOk { registers }))
        }
        ModbusFunction::WriteSingleRegister => {
            if frame.len() < WRITE_FRAME_LEN {
                return Err(ModbusError::short_response(frame.len(), WRITE_FRAME_LEN));
            }
            let frame = &frame[..WRITE_FRAME_LEN];
            let address = u16::from_be_bytes([frame[2], frame[3]]);
            let value = u16::from_be_bytes([frame[4], frame[5]]);
            Ok(respond(frame, ResponseKind::WriteOk { address, value }))
        }
    }
}
