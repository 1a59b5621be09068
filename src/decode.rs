//! Numeric decoding of instrument registers
//!
//! Floats span two registers and the firmware is not consistent about byte and word
//! order, so every float can be decoded under the four common layouts. For the IR
//! profile the layout is guessed from a pair of values with a known nominal range.
//!
//! Byte labels follow the usual convention: the first register carries bytes `A B`,
//! the second `C D`, most significant first.

use byteorder::{BigEndian, ByteOrder as _};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Layout of a 32-bit float across two registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Big-endian, first register high
    ABCD,
    /// Bytes swapped inside each register
    BADC,
    /// Registers swapped
    CDAB,
    /// Fully reversed
    DCBA,
}

impl ByteOrder {
    /// Candidate orders, in tie-break order
    pub const ALL: [ByteOrder; 4] = [ByteOrder::ABCD, ByteOrder::BADC, ByteOrder::CDAB, ByteOrder::DCBA];

    fn arrange(self, [a, b, c, d]: [u8; 4]) -> [u8; 4] {
        match self {
            ByteOrder::ABCD => [a, b, c, d],
            ByteOrder::BADC => [b, a, d, c],
            ByteOrder::CDAB => [c, d, a, b],
            ByteOrder::DCBA => [d, c, b, a],
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decode a float from two registers under `order`
pub fn float_from_words(first: u16, second: u16, order: ByteOrder) -> f32 {
    let mut raw = [0u8; 4];
    BigEndian::write_u16(&mut raw[..2], first);
    BigEndian::write_u16(&mut raw[2..], second);
    BigEndian::read_f32(&order.arrange(raw))
}

/// Finite decodes of a register pair under every order
pub fn float_variants(first: u16, second: u16) -> Vec<(ByteOrder, f32)> {
    ByteOrder::ALL
        .iter()
        .map(|&order| (order, float_from_words(first, second, order)))
        .filter(|(_, value)| value.is_finite())
        .collect()
}

/// Reinterpret a register as a two's complement integer
pub fn int16_from_u16(value: u16) -> i16 {
    value as i16
}

/// Parameters for guessing the float layout from a known range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderCalibration {
    /// Expected `high - low`
    pub target_width: f64,
    pub nominal_low: f64,
    pub nominal_high: f64,
    /// Weight of the distance to the nominal bounds
    pub weight: f64,
    /// Decodes larger than this are rejected
    pub max_magnitude: f64,
}

impl Default for OrderCalibration {
    fn default() -> Self {
        Self {
            target_width: 6.0,
            nominal_low: 792.0,
            nominal_high: 798.0,
            weight: 0.1,
            max_magnitude: 1e6,
        }
    }
}

/// Winning layout of an order detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderDetection {
    pub order: ByteOrder,
    pub low: f32,
    pub high: f32,
    /// Lower is better
    pub score: f64,
}

/// Guess the float layout from a `(low, high)` pair of register pairs
///
/// An order qualifies when both values decode finite, `high > low`, both stay within
/// `max_magnitude` and so does their difference. The qualifying order closest to the
/// expected width and nominal bounds wins; ties go to the earlier entry of
/// [`ByteOrder::ALL`].
pub fn detect_order(
    low: (u16, u16),
    high: (u16, u16),
    calibration: &OrderCalibration,
) -> Option<OrderDetection> {
    let mut best: Option<OrderDetection> = None;

    for order in ByteOrder::ALL {
        let lo = float_from_words(low.0, low.1, order);
        let hi = float_from_words(high.0, high.1, order);
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            continue;
        }
        let (lo64, hi64) = (lo as f64, hi as f64);
        if lo64.abs() > calibration.max_magnitude || hi64.abs() > calibration.max_magnitude {
            continue;
        }
        let width = hi64 - lo64;
        if width <= 0.0 || width > calibration.max_magnitude {
            continue;
        }

        let score = (width - calibration.target_width).abs()
            + calibration.weight * (lo64 - calibration.nominal_low).abs()
            + calibration.weight * (hi64 - calibration.nominal_high).abs();

        if best.map_or(true, |b| score < b.score) {
            best = Some(OrderDetection { order, low: lo, high: hi, score });
        }
    }

    best
}

/// Any-order decode inside `[lo, hi]`, closest to the window midpoint
pub fn pick_variant_in_range(first: u16, second: u16, lo: f32, hi: f32) -> Option<f32> {
    let mid = (lo as f64 + hi as f64) / 2.0;
    float_variants(first, second)
        .into_iter()
        .map(|(_, value)| value)
        .filter(|value| (lo..=hi).contains(value))
        .min_by(|a, b| {
            let da = (*a as f64 - mid).abs();
            let db = (*b as f64 - mid).abs();
            da.total_cmp(&db)
        })
}

/// Spectrum normalization constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumCalibration {
    /// Multiplier applied after baseline subtraction
    pub scale: f64,
    /// Leading share of samples averaged into the baseline
    pub baseline_fraction: f64,
}

impl Default for SpectrumCalibration {
    fn default() -> Self {
        Self {
            scale: 460.0,
            baseline_fraction: 0.2,
        }
    }
}

/// Every tunable decoding constant
///
/// Defaults match the IR channel of the instrument this crate was written against;
/// other units or firmware revisions may need their own values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub order: OrderCalibration,
    pub spectrum: SpectrumCalibration,
}

/// Baseline-corrected, scaled spectrum
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    /// Baseline in percent of full scale
    pub baseline: f64,
    pub values: Vec<f64>,
    pub max_value: f64,
    pub max_index: Option<usize>,
}

impl Spectrum {
    pub fn min_value(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn peak(&self) -> Option<f64> {
        self.max_index.map(|_| self.max_value)
    }
}

/// Normalize raw samples to percent, remove the leading baseline and scale
pub fn decode_spectrum(raw: &[u16], calibration: &SpectrumCalibration) -> Spectrum {
    if raw.is_empty() {
        return Spectrum {
            baseline: 0.0,
            values: Vec::new(),
            max_value: 0.0,
            max_index: None,
        };
    }

    let percent: Vec<f64> = raw.iter().map(|&v| v as f64 * 100.0 / 65535.0).collect();
    let n = percent.len();
    let n_avg = ((n as f64 * calibration.baseline_fraction).ceil() as usize).clamp(1, n);
    let baseline = percent[..n_avg].iter().sum::<f64>() / n_avg as f64;

    let values: Vec<f64> = percent
        .iter()
        .map(|p| (p - baseline) * calibration.scale)
        .collect();

    let (max_index, max_value) = values
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });

    Spectrum {
        baseline,
        values,
        max_value,
        max_index: Some(max_index),
    }
}

/// One point of a measurement series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Spread `y` evenly over `[x_min, x_max]`; falls back to the index as x
pub fn point_series(y: &[f64], x_min: f64, x_max: f64) -> Vec<Point> {
    if y.len() >= 2 && x_max != x_min && x_min.is_finite() && x_max.is_finite() {
        let step = (x_max - x_min) / (y.len() - 1) as f64;
        y.iter()
            .enumerate()
            .map(|(i, &y)| Point { x: x_min + step * i as f64, y })
            .collect()
    } else {
        y.iter()
            .enumerate()
            .map(|(i, &y)| Point { x: i as f64, y })
            .collect()
    }
}
