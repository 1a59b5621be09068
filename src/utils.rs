//! Shared helpers: request metrics, operation timing, argument validation and
//! hex formatting used across the client stack.

use std::time::{Duration, Instant};
use log::{debug, warn};
use crate::error::{ModbusError, ModbusResult};

/// Request accounting kept by the instrument client
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished operation
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.total_requests += 1;
        self.total_duration += duration;
        if success {
            self.successful_requests += 1;
            self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
            self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        } else {
            self.failed_requests += 1;
        }
    }

    /// Mean duration over every recorded operation
    pub fn avg_duration(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.total_requests as u32
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring a named operation
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn start(operation_name: impl Into<String>) -> Self {
        let operation_name = operation_name.into();
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name,
        }
    }

    /// Stop the timer, log the outcome and return the elapsed time
    pub fn finish(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Argument validation shared by the codec and the client
pub mod validation {
    use super::*;

    /// Validate unit ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> ModbusResult<()> {
        if slave_id == 0 || slave_id > 247 {
            return Err(ModbusError::invalid_data(format!(
                "Invalid unit ID: {} (must be 1-247)",
                slave_id
            )));
        }
        Ok(())
    }

    /// Validate that `count` registers from `start` stay inside the address space
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 || (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }

    /// Validate register count for a single read request
    pub fn validate_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate relay index (1-8)
    pub fn validate_relay(relay: u8) -> ModbusResult<()> {
        if !(1..=8).contains(&relay) {
            return Err(ModbusError::invalid_data(format!(
                "Invalid relay: {} (must be 1-8)",
                relay
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as spaced hex
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex words
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else {
            format!("{:.2}s", duration.as_secs_f64())
        }
    }

    /// One-line summary of client metrics
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        format!(
            "requests={} ok={} ({:.1}%) failed={} avg={} max={}",
            metrics.total_requests,
            metrics.successful_requests,
            metrics.success_rate(),
            metrics.failed_requests,
            format_duration(metrics.avg_duration()),
            metrics.max_duration.map_or("n/a".to_string(), format_duration),
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize env_logger for tests; repeated calls are ignored
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
