//! Application-facing frame logging
//!
//! [`CallbackLogger`] hands human-readable descriptions of every RTU request and reply
//! to a caller-supplied callback, independent of the `log`/`tracing` pipeline. Useful
//! for instrument consoles that show the traffic next to the measurement.

use std::sync::Arc;

use crate::protocol::{parse_response, ModbusException, ModbusFunction, ResponseKind};
use crate::utils::format::registers_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// How frames are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Hex bytes only
    Raw,
    /// Decoded fields only
    Interpreted,
    /// Decoded fields at the requested level, hex at debug
    Both,
}

/// Callback receiving a level and a rendered message
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that forwards rendered frames to a callback
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Timestamped stdout/stderr output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    fn emit(&self, arrow: &str, frame: &[u8], interpreted: impl FnOnce() -> String) {
        let raw = || format!("{} Raw: {}", arrow, hex::encode_upper(frame));
        match self.mode {
            LoggingMode::Raw => self.info(&raw()),
            LoggingMode::Interpreted => self.info(&format!("{} {}", arrow, interpreted())),
            LoggingMode::Both => {
                self.info(&format!("{} {}", arrow, interpreted()));
                self.debug(&raw());
            }
        }
    }

    /// Log an outgoing request frame
    pub fn log_request(&self, frame: &[u8]) {
        if self.callback.is_none() {
            return;
        }
        self.emit("Request ->", frame, || describe_request(frame));
    }

    /// Log a reply to a request of `expected` function
    pub fn log_response(&self, frame: &[u8], unit_id: u8, expected: ModbusFunction) {
        if self.callback.is_none() {
            return;
        }
        if frame.is_empty() {
            self.warn("Response <- none (device silent)");
            return;
        }
        self.emit("Response <-", frame, || describe_response(frame, unit_id, expected));
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn function_name(code: u8) -> &'static str {
    match ModbusFunction::from_u8(code & 0x7F) {
        Ok(ModbusFunction::ReadHoldingRegisters) => "Read Holding Registers",
        Ok(ModbusFunction::ReadInputRegisters) => "Read Input Registers",
        Ok(ModbusFunction::WriteSingleRegister) => "Write Single Register",
        Err(_) => "Unknown Function",
    }
}

fn describe_request(frame: &[u8]) -> String {
    if frame.len() < 6 {
        return format!("Data: {}", hex::encode_upper(frame));
    }
    let field = u16::from_be_bytes([frame[4], frame[5]]);
    let label = if frame[1] == ModbusFunction::WriteSingleRegister.to_u8() {
        "Value"
    } else {
        "Quantity"
    };
    format!(
        "Unit: {}, Function: {} (0x{:02X}), Address: {}, {}: {}",
        frame[0],
        function_name(frame[1]),
        frame[1],
        u16::from_be_bytes([frame[2], frame[3]]),
        label,
        field
    )
}

fn describe_response(frame: &[u8], unit_id: u8, expected: ModbusFunction) -> String {
    let response = match parse_response(frame, unit_id, expected) {
        Ok(response) => response,
        Err(e) => return format!("Unparseable ({}): {}", e, hex::encode_upper(frame)),
    };

    let crc = if response.crc_valid { "" } else { " [CRC mismatch]" };
    let body = match response.kind {
        ResponseKind::ReadOk { registers } => format!(
            "Registers ({}): {}",
            registers.len(),
            registers_to_hex(&registers[..registers.len().min(8)])
        ),
        ResponseKind::WriteOk { address, value } => {
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        ResponseKind::Exception { code, .. } => match ModbusException::from_u8(code) {
            Some(exception) => format!("Exception code {} ({})", code, exception),
            None => format!("Exception code {}", code),
        },
        ResponseKind::Malformed { reason } => format!("Malformed: {}", reason),
    };
    format!(
        "Unit: {}, Function: {} (0x{:02X}), {}{}",
        response.unit_id,
        function_name(expected.to_u8()),
        expected.to_u8(),
        body,
        crc
    )
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_exception_response, build_read_frame, build_read_response};
    use std::sync::Mutex;

    fn capture(mode: LoggingMode, level: LogLevel) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message: &str| {
            sink.lock().unwrap().push(format!("{} {}", level.as_str(), message));
        });
        (CallbackLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_request_interpretation() {
        let (logger, lines) = capture(LoggingMode::Interpreted, LogLevel::Info);
        let frame = build_read_frame(ModbusFunction::ReadInputRegisters, 400, 15, 1).unwrap();
        logger.log_request(&frame);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Read Input Registers"));
        assert!(lines[0].contains("Address: 400"));
        assert!(lines[0].contains("Quantity: 15"));
    }

    #[test]
    fn test_response_interpretation() {
        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Debug);
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[0x4446]);
        logger.log_response(&reply, 1, ModbusFunction::ReadInputRegisters);

        let exception = build_exception_response(1, ModbusFunction::ReadInputRegisters, 2);
        logger.log_response(&exception, 1, ModbusFunction::ReadInputRegisters);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("INFO") && lines[0].ends_with("Registers (1): 4446"));
        assert!(lines[1].starts_with("DEBUG") && lines[1].contains("Raw: 010402"));
        assert!(lines[2].contains("Exception code 2"));
    }

    #[test]
    fn test_level_filtering_and_silence() {
        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Info);
        let reply = build_read_response(1, ModbusFunction::ReadInputRegisters, &[1]);
        logger.log_response(&reply, 1, ModbusFunction::ReadInputRegisters);
        logger.log_response(&[], 1, ModbusFunction::ReadInputRegisters);

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("WARN"));
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::default();
        logger.log_request(&[0x01, 0x04]);
        logger.info("nothing happens");
        assert_eq!(logger.mode(), LoggingMode::Interpreted);
    }
}
