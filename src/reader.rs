//! Chunked register reads over gapped address ranges
//!
//! A [`ReadPlan`] describes one logical read: a base address, the sub-ranges to fetch
//! relative to it and whether each sub-range must succeed. [`read_ranges`] splits the
//! sub-ranges into device-sized requests, reassembles the replies into one dense array
//! and records which optional registers could not be read.
//!
//! Failure rules per chunk:
//! - device exceptions, empty and truncated replies fail an optional chunk; it is
//!   retried, then zero-filled and reported missing
//! - a required chunk that fails aborts the whole read; only an empty reply is
//!   retried first
//! - any other error (transport, CRC in strict mode) aborts the read
//! - an illegal address on the very first chunk restarts the plan once at the
//!   fallback base, when one is configured

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::client::InstrumentClient;
use crate::error::{MissingRange, ModbusError, ModbusResult, EXCEPTION_ILLEGAL_DATA_ADDRESS};
use crate::protocol::ModbusFunction;
use crate::register_map::RegisterMap;
use crate::transport::ModbusTransport;

/// One contiguous block of registers relative to the plan base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRange {
    pub offset: u16,
    pub quantity: u16,
    pub required: bool,
}

impl SubRange {
    pub fn end(&self) -> u32 {
        self.offset as u32 + self.quantity as u32
    }
}

/// Reader tuning shared by every plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Upper bound on registers per request
    pub max_chunk: u16,
    /// Extra attempts for a failed optional chunk
    pub optional_retries: u32,
    /// Extra attempts for a chunk that got no reply at all
    pub silent_retries: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_chunk: crate::MAX_REGISTERS_PER_REQUEST,
            optional_retries: 1,
            silent_retries: 1,
        }
    }
}

/// Description of one logical register read
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    pub function: ModbusFunction,
    pub primary_base: u16,
    pub fallback_base: Option<u16>,
    pub ranges: Vec<SubRange>,
    pub max_chunk: u16,
    pub optional_retries: u32,
    pub silent_retries: u32,
}

impl ReadPlan {
    pub fn new(function: ModbusFunction, primary_base: u16) -> Self {
        let defaults = ReaderConfig::default();
        Self {
            function,
            primary_base,
            fallback_base: None,
            ranges: Vec::new(),
            max_chunk: defaults.max_chunk,
            optional_retries: defaults.optional_retries,
            silent_retries: defaults.silent_retries,
        }
    }

    pub fn with_fallback(mut self, base: u16) -> Self {
        self.fallback_base = Some(base);
        self
    }

    pub fn required(mut self, offset: u16, quantity: u16) -> Self {
        self.ranges.push(SubRange { offset, quantity, required: true });
        self
    }

    pub fn optional(mut self, offset: u16, quantity: u16) -> Self {
        self.ranges.push(SubRange { offset, quantity, required: false });
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: u16) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    /// Apply reader settings; a plan's own chunk limit is never raised
    pub fn with_config(mut self, config: &ReaderConfig) -> Self {
        self.max_chunk = self.max_chunk.min(config.max_chunk);
        self.optional_retries = config.optional_retries;
        self.silent_retries = config.silent_retries;
        self
    }

    /// Length of the dense output array
    pub fn span(&self) -> usize {
        self.ranges.iter().map(|r| r.end() as usize).max().unwrap_or(0)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if !self.function.is_read_function() {
            return Err(ModbusError::invalid_data(format!(
                "{} cannot be used for a register read",
                self.function
            )));
        }
        if self.ranges.is_empty() {
            return Err(ModbusError::invalid_data("Read plan has no ranges"));
        }
        if self.max_chunk == 0 || self.max_chunk > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid chunk size: {} (must be 1-{})",
                self.max_chunk,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        for range in &self.ranges {
            if range.quantity == 0 {
                return Err(ModbusError::invalid_address(range.offset, range.quantity));
            }
        }
        Ok(())
    }
}

/// Result of a plan execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeReadOutcome {
    /// Base address the data was finally read at
    pub base_address: u16,
    /// Dense registers indexed by offset; unread slots are zero
    pub registers: Vec<u16>,
    pub missing: Vec<MissingRange>,
    /// Chunks whose CRC did not match
    pub crc_warnings: u32,
}

impl RangeReadOutcome {
    /// Registers `offset..offset+len`, clamped to the read span
    pub fn slice(&self, offset: u16, len: u16) -> &[u16] {
        let start = (offset as usize).min(self.registers.len());
        let end = (offset as usize + len as usize).min(self.registers.len());
        &self.registers[start..end]
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Treat any missing optional register as an error
    pub fn require_complete(self) -> ModbusResult<Self> {
        if self.missing.is_empty() {
            Ok(self)
        } else {
            Err(ModbusError::partial_data(self.missing))
        }
    }

    /// True if any register of `offset..offset+len` was not read
    pub fn is_missing(&self, offset: u16, len: u16) -> bool {
        let end = offset as u32 + len as u32;
        self.missing
            .iter()
            .any(|m| (m.offset as u32) < end && (offset as u32) < m.offset as u32 + m.quantity as u32)
    }
}

struct PlanFailure {
    error: ModbusError,
    at_first_chunk: bool,
}

impl PlanFailure {
    fn fatal(error: ModbusError) -> Self {
        Self { error, at_first_chunk: false }
    }
}

/// Errors that fail a single chunk instead of the whole read
fn is_chunk_failure(error: &ModbusError, required: bool) -> bool {
    error.is_unavailable_range()
        || matches!(
            error,
            ModbusError::ShortResponse { .. } | ModbusError::Truncated { .. }
        )
        || (!required && matches!(error, ModbusError::Exception { .. }))
}

fn is_silence(error: &ModbusError) -> bool {
    matches!(error, ModbusError::ShortResponse { received: 0, .. })
}

fn push_missing(missing: &mut Vec<MissingRange>, offset: u16, quantity: u16) {
    if let Some(last) = missing.last_mut() {
        if last.offset as u32 + last.quantity as u32 == offset as u32 {
            last.quantity += quantity;
            return;
        }
    }
    missing.push(MissingRange { offset, quantity });
}

/// Execute `plan` against the instrument
pub async fn read_ranges<T: ModbusTransport>(
    client: &mut InstrumentClient<T>,
    plan: &ReadPlan,
) -> ModbusResult<RangeReadOutcome> {
    plan.validate()?;

    match read_at_base(client, plan, plan.primary_base).await {
        Ok(outcome) => Ok(outcome),
        Err(failure)
            if failure.at_first_chunk
                && failure.error.exception_code() == Some(EXCEPTION_ILLEGAL_DATA_ADDRESS) =>
        {
            match plan.fallback_base {
                Some(fallback) => {
                    info!(
                        "Base {} rejected ({}), retrying plan at {}",
                        plan.primary_base, failure.error, fallback
                    );
                    read_at_base(client, plan, fallback)
                        .await
                        .map_err(|failure| failure.error)
                }
                None => Err(failure.error),
            }
        }
        Err(failure) => Err(failure.error),
    }
}

async fn read_at_base<T: ModbusTransport>(
    client: &mut InstrumentClient<T>,
    plan: &ReadPlan,
    base: u16,
) -> Result<RangeReadOutcome, PlanFailure> {
    let mut map = RegisterMap::new();
    let mut missing = Vec::new();
    let mut crc_warnings = 0;
    let mut first_chunk = true;

    for range in &plan.ranges {
        let end = range.end();
        let mut offset = range.offset as u32;

        while offset < end {
            let quantity = (end - offset).min(plan.max_chunk as u32) as u16;
            let chunk_offset = offset as u16;
            let address = u16::try_from(base as u32 + offset)
                .map_err(|_| PlanFailure::fatal(ModbusError::invalid_address(base, quantity)))?;

            let mut attempts = 0;
            let mut silent = 0;
            let failure = loop {
                attempts += 1;
                match client.read_block(plan.function, address, quantity).await {
                    Ok(block) => {
                        if !block.crc_valid {
                            crc_warnings += 1;
                        }
                        map.insert_block(chunk_offset, &block.registers);
                        break None;
                    }
                    Err(e) if is_chunk_failure(&e, range.required) => {
                        if let ModbusError::Truncated { salvaged, .. } = &e {
                            map.insert_block(chunk_offset, salvaged);
                        }
                        let retry = if is_silence(&e) && silent < plan.silent_retries {
                            silent += 1;
                            true
                        } else {
                            !range.required && attempts <= plan.optional_retries
                        };
                        if retry {
                            debug!("Retrying registers {}+{}: {}", address, quantity, e);
                            continue;
                        }
                        break Some(e);
                    }
                    Err(e) => {
                        return Err(PlanFailure {
                            error: e,
                            at_first_chunk: first_chunk,
                        })
                    }
                }
            };

            if let Some(error) = failure {
                if range.required || (first_chunk && plan.fallback_base.is_some()
                    && error.exception_code() == Some(EXCEPTION_ILLEGAL_DATA_ADDRESS))
                {
                    return Err(PlanFailure {
                        error,
                        at_first_chunk: first_chunk,
                    });
                }
                let read = (0..quantity)
                    .take_while(|i| map.contains(chunk_offset + i))
                    .count() as u16;
                warn!(
                    "Registers {}..{} unavailable ({}), zero-filling",
                    address as u32 + read as u32,
                    address as u32 + quantity as u32,
                    error
                );
                push_missing(&mut missing, chunk_offset + read, quantity - read);
            }

            first_chunk = false;
            offset += quantity as u32;
        }
    }

    Ok(RangeReadOutcome {
        base_address: base,
        registers: map.into_dense(plan.span()),
        missing,
        crc_warnings,
    })
}
