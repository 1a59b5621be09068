//! Measurement profiles of the instrument
//!
//! Each profile is a static register layout plus a decode step:
//!
//! | Profile | Base (fallback) | Metadata        | Data                         |
//! |---------|-----------------|-----------------|------------------------------|
//! | IR      | 400 (399)       | 15 @ +0, req.   | 58 @ +20, optional           |
//! | IR raw  | 400 (399)       | 15 @ +0, req.   | 58 @ +20, required           |
//! | NMR     | 100 (99)        | 17 @ +0, req.   | 256 @ +20 in 30s, optional   |
//! | PXE     | 500             | 2 @ +0, req.    | 2n @ 520 in 30s, optional    |
//!
//! The decode functions are pure and work on plain register slices; the `read_*`
//! functions drive the reader and feed them.

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::client::InstrumentClient;
use crate::decode::{
    decode_spectrum, detect_order, float_from_words, int16_from_u16, pick_variant_in_range,
    point_series, ByteOrder, Calibration, Point,
};
use crate::error::{MissingRange, ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;
use crate::reader::{read_ranges, RangeReadOutcome, ReadPlan, ReaderConfig};
use crate::transport::ModbusTransport;

/// Selectable measurement profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Ir,
    IrRaw,
    Nmr,
    Pxe,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProfileKind::Ir => "ir",
            ProfileKind::IrRaw => "ir_raw",
            ProfileKind::Nmr => "nmr",
            ProfileKind::Pxe => "pxe",
        };
        f.write_str(name)
    }
}

impl FromStr for ProfileKind {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ir" => Ok(ProfileKind::Ir),
            "ir_raw" | "ir-raw" | "ir_int" => Ok(ProfileKind::IrRaw),
            "nmr" => Ok(ProfileKind::Nmr),
            "pxe" => Ok(ProfileKind::Pxe),
            other => Err(ModbusError::configuration(format!("Unknown profile: {}", other))),
        }
    }
}

/// Static register layout of a metadata + data profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileLayout {
    pub primary_base: u16,
    pub fallback_base: Option<u16>,
    pub metadata: (u16, u16),
    pub data: (u16, u16),
    pub data_required: bool,
    pub max_chunk: u16,
}

impl ProfileLayout {
    pub fn plan(&self, config: &ReaderConfig) -> ReadPlan {
        let mut plan = ReadPlan::new(ModbusFunction::ReadInputRegisters, self.primary_base)
            .required(self.metadata.0, self.metadata.1);
        plan = if self.data_required {
            plan.required(self.data.0, self.data.1)
        } else {
            plan.optional(self.data.0, self.data.1)
        };
        if let Some(fallback) = self.fallback_base {
            plan = plan.with_fallback(fallback);
        }
        plan.with_max_chunk(self.max_chunk).with_config(config)
    }
}

pub const IR_LAYOUT: ProfileLayout = ProfileLayout {
    primary_base: 400,
    fallback_base: Some(399),
    metadata: (0, 15),
    data: (20, 58),
    data_required: false,
    max_chunk: crate::MAX_REGISTERS_PER_REQUEST,
};

pub const IR_RAW_LAYOUT: ProfileLayout = ProfileLayout {
    data_required: true,
    ..IR_LAYOUT
};

pub const NMR_LAYOUT: ProfileLayout = ProfileLayout {
    primary_base: 100,
    fallback_base: Some(99),
    metadata: (0, 17),
    data: (20, 256),
    data_required: false,
    max_chunk: 30,
};

/// PXE header: sample count and fit flag
pub const PXE_HEADER_ADDRESS: u16 = 500;
/// PXE interleaved x/y samples
pub const PXE_DATA_ADDRESS: u16 = 520;
pub const PXE_CHUNK: u16 = 30;

/// How the registers behind a result were obtained
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadInfo {
    pub base_address: u16,
    /// Optional ranges that were zero-filled
    pub missing: Vec<MissingRange>,
    pub crc_warnings: u32,
}

impl ReadInfo {
    pub fn crc_valid(&self) -> bool {
        self.crc_warnings == 0
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl From<&RangeReadOutcome> for ReadInfo {
    fn from(outcome: &RangeReadOutcome) -> Self {
        Self {
            base_address: outcome.base_address,
            missing: outcome.missing.clone(),
            crc_warnings: outcome.crc_warnings,
        }
    }
}

fn finite(value: f32) -> Option<f64> {
    value.is_finite().then_some(value as f64)
}

fn pair(registers: &[u16], index: usize) -> (u16, u16) {
    (registers[index], registers[index + 1])
}

fn require_len(registers: &[u16], len: usize, what: &str) -> ModbusResult<()> {
    if registers.len() < len {
        return Err(ModbusError::invalid_data(format!(
            "{} needs {} registers, got {}",
            what,
            len,
            registers.len()
        )));
    }
    Ok(())
}

/// Decoded IR metadata block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrMetadata {
    pub status: u16,
    /// `None` when detection failed and nominal bounds were substituted
    pub byte_order: Option<ByteOrder>,
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
    pub resonance_frequency: Option<f64>,
    pub frequency: Option<f64>,
    pub integral: Option<f64>,
}

/// Decode the 15 IR metadata registers
///
/// Layout: status, then x_min, x_max, y_min, y_max, resonance frequency, frequency and
/// integral as register pairs.
pub fn decode_ir_metadata(meta: &[u16], calibration: &Calibration) -> ModbusResult<IrMetadata> {
    require_len(meta, 15, "IR metadata")?;

    let status = meta[0];
    let (res, freq, integral) = (pair(meta, 9), pair(meta, 11), pair(meta, 13));

    match detect_order(pair(meta, 1), pair(meta, 3), &calibration.order) {
        Some(detection) => {
            let order = detection.order;
            let (lo, hi) = (detection.low, detection.high);
            debug!("IR float layout {} (score {:.3})", order, detection.score);

            // Resonance and frequency must sit inside the x window; other layouts rescue them
            let in_window = |(w1, w2): (u16, u16)| {
                let value = float_from_words(w1, w2, order);
                if value.is_finite() && (lo..=hi).contains(&value) {
                    Some(value as f64)
                } else {
                    pick_variant_in_range(w1, w2, lo, hi)
                        .map(|v| v as f64)
                        .or_else(|| finite(value))
                }
            };

            Ok(IrMetadata {
                status,
                byte_order: Some(order),
                x_min: lo as f64,
                x_max: hi as f64,
                y_min: finite(float_from_words(meta[5], meta[6], order)),
                y_max: finite(float_from_words(meta[7], meta[8], order)),
                resonance_frequency: in_window(res),
                frequency: in_window(freq),
                integral: finite(float_from_words(integral.0, integral.1, order)),
            })
        }
        None => {
            let (lo, hi) = (
                calibration.order.nominal_low as f32,
                calibration.order.nominal_high as f32,
            );
            warn!("IR float layout not detected, assuming {}..{}", lo, hi);

            let swapped = |(w1, w2): (u16, u16)| finite(float_from_words(w1, w2, ByteOrder::BADC));
            let in_window = |(w1, w2): (u16, u16)| {
                pick_variant_in_range(w1, w2, lo, hi)
                    .map(|v| v as f64)
                    .or_else(|| swapped((w1, w2)))
            };

            Ok(IrMetadata {
                status,
                byte_order: None,
                x_min: lo as f64,
                x_max: hi as f64,
                y_min: swapped(pair(meta, 5)),
                y_max: swapped(pair(meta, 7)),
                resonance_frequency: in_window(res),
                frequency: in_window(freq),
                integral: swapped(integral),
            })
        }
    }
}

/// IR absorption spectrum
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrSpectrum {
    pub status: u16,
    pub byte_order: Option<ByteOrder>,
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub resonance_frequency: Option<f64>,
    pub frequency: Option<f64>,
    pub integral: Option<f64>,
    pub baseline: f64,
    pub max_value: f64,
    pub max_index: Option<usize>,
    pub raw: Vec<u16>,
    pub values: Vec<f64>,
    pub points: Vec<Point>,
    pub read: ReadInfo,
}

/// Decode IR metadata and samples into a spectrum
pub fn decode_ir(
    meta: &[u16],
    data: &[u16],
    calibration: &Calibration,
    read: ReadInfo,
) -> ModbusResult<IrSpectrum> {
    let metadata = decode_ir_metadata(meta, calibration)?;
    let spectrum = decode_spectrum(data, &calibration.spectrum);

    let (y_min, y_max) = match (spectrum.min_value(), spectrum.peak()) {
        (Some(min), Some(max)) => (min, max),
        _ => (metadata.y_min.unwrap_or(0.0), metadata.y_max.unwrap_or(1.0)),
    };
    let points = point_series(&spectrum.values, metadata.x_min, metadata.x_max);

    Ok(IrSpectrum {
        status: metadata.status,
        byte_order: metadata.byte_order,
        x_min: metadata.x_min,
        x_max: metadata.x_max,
        y_min,
        y_max,
        resonance_frequency: metadata.resonance_frequency,
        frequency: metadata.frequency,
        integral: metadata.integral,
        baseline: spectrum.baseline,
        max_value: spectrum.max_value,
        max_index: spectrum.max_index,
        raw: data.to_vec(),
        values: spectrum.values,
        points,
        read,
    })
}

/// IR samples as signed integers, without normalization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrRawSamples {
    pub status: u16,
    /// Register address of the first sample
    pub start_address: u16,
    pub values: Vec<i16>,
    pub min_value: Option<i16>,
    pub max_value: Option<i16>,
    pub read: ReadInfo,
}

pub fn decode_ir_raw(meta: &[u16], data: &[u16], read: ReadInfo) -> ModbusResult<IrRawSamples> {
    require_len(meta, 1, "IR metadata")?;
    let values: Vec<i16> = data.iter().map(|&v| int16_from_u16(v)).collect();
    Ok(IrRawSamples {
        status: meta[0],
        start_address: read.base_address.wrapping_add(IR_RAW_LAYOUT.data.0),
        min_value: values.iter().copied().min(),
        max_value: values.iter().copied().max(),
        values,
        read,
    })
}

/// NMR spectrum; floats are word-swapped (CDAB)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NmrSpectrum {
    pub samples: u16,
    pub x_min: Option<f64>,
    pub x_max: Option<f64>,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
    pub frequency: Option<f64>,
    pub amplitude: Option<f64>,
    pub integral: Option<f64>,
    pub t2: Option<f64>,
    pub data: Vec<u16>,
    pub points: Vec<Point>,
    pub read: ReadInfo,
}

pub fn decode_nmr(meta: &[u16], data: &[u16], read: ReadInfo) -> ModbusResult<NmrSpectrum> {
    require_len(meta, 17, "NMR metadata")?;
    let cdab = |index: usize| finite(float_from_words(meta[index], meta[index + 1], ByteOrder::CDAB));

    let x_min = cdab(1);
    let x_max = cdab(3);
    let y: Vec<f64> = data.iter().map(|&v| v as f64).collect();
    let points = point_series(&y, x_min.unwrap_or(f64::NAN), x_max.unwrap_or(f64::NAN));

    Ok(NmrSpectrum {
        samples: meta[0],
        x_min,
        x_max,
        y_min: cdab(5),
        y_max: cdab(7),
        frequency: cdab(9),
        amplitude: cdab(11),
        integral: cdab(13),
        t2: cdab(15),
        data: data.to_vec(),
        points,
        read,
    })
}

/// PXE point series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PxeSeries {
    pub sample_count: u16,
    pub fit: u16,
    pub x: Vec<u16>,
    pub y: Vec<u16>,
    pub points: Vec<Point>,
    pub read: ReadInfo,
}

impl PxeSeries {
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// De-interleave `x0 y0 x1 y1 ...` into a series of `sample_count` points
pub fn decode_pxe(sample_count: u16, fit: u16, data: &[u16], read: ReadInfo) -> PxeSeries {
    let (x, y): (Vec<u16>, Vec<u16>) = data
        .chunks_exact(2)
        .take(sample_count as usize)
        .map(|pair| (pair[0], pair[1]))
        .unzip();
    let points = x
        .iter()
        .zip(&y)
        .map(|(&x, &y)| Point { x: x as f64, y: y as f64 })
        .collect();

    PxeSeries {
        sample_count,
        fit,
        x,
        y,
        points,
        read,
    }
}

/// Any decoded measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum MeasurementResult {
    Ir(IrSpectrum),
    IrRaw(IrRawSamples),
    Nmr(NmrSpectrum),
    Pxe(PxeSeries),
}

impl MeasurementResult {
    pub fn kind(&self) -> ProfileKind {
        match self {
            MeasurementResult::Ir(_) => ProfileKind::Ir,
            MeasurementResult::IrRaw(_) => ProfileKind::IrRaw,
            MeasurementResult::Nmr(_) => ProfileKind::Nmr,
            MeasurementResult::Pxe(_) => ProfileKind::Pxe,
        }
    }

    pub fn read_info(&self) -> &ReadInfo {
        match self {
            MeasurementResult::Ir(r) => &r.read,
            MeasurementResult::IrRaw(r) => &r.read,
            MeasurementResult::Nmr(r) => &r.read,
            MeasurementResult::Pxe(r) => &r.read,
        }
    }
}

fn split(outcome: &RangeReadOutcome, layout: &ProfileLayout) -> (Vec<u16>, Vec<u16>) {
    (
        outcome.slice(layout.metadata.0, layout.metadata.1).to_vec(),
        outcome.slice(layout.data.0, layout.data.1).to_vec(),
    )
}

/// Read and decode the IR spectrum
pub async fn read_ir<T: ModbusTransport>(client: &mut InstrumentClient<T>) -> ModbusResult<IrSpectrum> {
    let plan = IR_LAYOUT.plan(client.reader_config());
    let outcome = read_ranges(client, &plan).await?;
    let (meta, data) = split(&outcome, &IR_LAYOUT);
    let spectrum = decode_ir(&meta, &data, client.calibration(), ReadInfo::from(&outcome))?;
    info!(
        "IR spectrum: {} points, x {:.3}..{:.3}, base {}",
        spectrum.points.len(),
        spectrum.x_min,
        spectrum.x_max,
        outcome.base_address
    );
    Ok(spectrum)
}

/// Read the IR samples as signed integers
pub async fn read_ir_raw<T: ModbusTransport>(client: &mut InstrumentClient<T>) -> ModbusResult<IrRawSamples> {
    let plan = IR_RAW_LAYOUT.plan(client.reader_config());
    let outcome = read_ranges(client, &plan).await?;
    let (meta, data) = split(&outcome, &IR_RAW_LAYOUT);
    decode_ir_raw(&meta, &data, ReadInfo::from(&outcome))
}

/// Read and decode the NMR spectrum
pub async fn read_nmr<T: ModbusTransport>(client: &mut InstrumentClient<T>) -> ModbusResult<NmrSpectrum> {
    let plan = NMR_LAYOUT.plan(client.reader_config());
    let outcome = read_ranges(client, &plan).await?;
    if outcome.is_missing(NMR_LAYOUT.data.0, NMR_LAYOUT.data.1) {
        warn!("NMR data incomplete: {:?}", outcome.missing);
    }
    let (meta, data) = split(&outcome, &NMR_LAYOUT);
    decode_nmr(&meta, &data, ReadInfo::from(&outcome))
}

/// Read the PXE header, then the number of samples it announces
pub async fn read_pxe<T: ModbusTransport>(client: &mut InstrumentClient<T>) -> ModbusResult<PxeSeries> {
    let header_plan = ReadPlan::new(ModbusFunction::ReadInputRegisters, PXE_HEADER_ADDRESS)
        .required(0, 2)
        .with_config(client.reader_config());
    let header = read_ranges(client, &header_plan).await?;
    let (sample_count, fit) = (header.registers[0], header.registers[1]);

    if sample_count == 0 {
        debug!("PXE reports no samples (fit {})", fit);
        return Ok(decode_pxe(0, fit, &[], ReadInfo::from(&header)));
    }

    let array_size = sample_count as u32 * 2;
    if PXE_DATA_ADDRESS as u32 + array_size > 65536 {
        return Err(ModbusError::invalid_data(format!(
            "PXE sample count {} exceeds the register space",
            sample_count
        )));
    }

    let data_plan = ReadPlan::new(ModbusFunction::ReadInputRegisters, PXE_DATA_ADDRESS)
        .optional(0, array_size as u16)
        .with_max_chunk(PXE_CHUNK)
        .with_config(client.reader_config());
    let data = read_ranges(client, &data_plan).await?;

    let mut read = ReadInfo::from(&data);
    read.crc_warnings += header.crc_warnings;
    Ok(decode_pxe(sample_count, fit, &data.registers, read))
}

/// Read any profile by kind
pub async fn read_profile<T: ModbusTransport>(
    client: &mut InstrumentClient<T>,
    kind: ProfileKind,
) -> ModbusResult<MeasurementResult> {
    Ok(match kind {
        ProfileKind::Ir => MeasurementResult::Ir(read_ir(client).await?),
        ProfileKind::IrRaw => MeasurementResult::IrRaw(read_ir_raw(client).await?),
        ProfileKind::Nmr => MeasurementResult::Nmr(read_nmr(client).await?),
        ProfileKind::Pxe => MeasurementResult::Pxe(read_pxe(client).await?),
    })
}
