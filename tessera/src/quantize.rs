//! Weight-only quantization.
//!
//! [`WeightQuantizer`] is the seam to a quantization kernel: given a float
//! matrix laid out `[in_features, out_features]`, it returns a packed integer
//! payload plus one scale per output channel. [`SymmetricQuantizer`] is the
//! host reference implementation.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::tensor::HostTensor;
use crate::{Error, Result};

/// Bit width of a weight-only quantized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightOnlyPrecision {
    /// Signed 8-bit weights (`W8A16`)
    Int8,
    /// Signed 4-bit weights packed two per byte (`W4A16`)
    Int4,
}

impl WeightOnlyPrecision {
    /// Largest representable magnitude on the positive side.
    #[must_use]
    pub const fn qmax(self) -> f32 {
        match self {
            Self::Int8 => 127.0,
            Self::Int4 => 7.0,
        }
    }

    /// Smallest representable value.
    #[must_use]
    pub const fn qmin(self) -> f32 {
        match self {
            Self::Int8 => -128.0,
            Self::Int4 => -8.0,
        }
    }

    /// Dtype of the packed payload.
    #[must_use]
    pub const fn packed_dtype(self) -> DType {
        match self {
            Self::Int8 => DType::I8,
            Self::Int4 => DType::I4x2,
        }
    }
}

impl fmt::Display for WeightOnlyPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
        }
    }
}

impl FromStr for WeightOnlyPrecision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            other => Err(Error::Config(format!(
                "unknown weight-only precision '{other}', expected int8 or int4"
            ))),
        }
    }
}

/// A quantization kernel for weight-only linear layers.
pub trait WeightQuantizer {
    /// Quantize a `[in_features, out_features]` float matrix.
    ///
    /// Returns `(packed, per_channel_scale)`; the scale has shape
    /// `[out_features]` and the weight's float dtype.
    ///
    /// # Errors
    /// Returns an error if the input dtype or shape is unsupported.
    fn quantize(
        &self,
        weight: &HostTensor,
        precision: WeightOnlyPrecision,
    ) -> Result<(HostTensor, HostTensor)>;
}

/// Symmetric per-output-channel quantization along the last axis.
///
/// `scale[c] = max_r |w[r, c]| / qmax`, and `q = round(w / scale)` clamped to
/// the signed range. An all-zero channel gets scale 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymmetricQuantizer;

impl WeightQuantizer for SymmetricQuantizer {
    fn quantize(
        &self,
        weight: &HostTensor,
        precision: WeightOnlyPrecision,
    ) -> Result<(HostTensor, HostTensor)> {
        if !weight.dtype.is_float() {
            return Err(Error::UnsupportedDtype(format!(
                "quantize: expected a float weight, got {}",
                weight.dtype
            )));
        }
        let &[rows, cols] = weight.shape.as_slice() else {
            return Err(Error::InvalidShape(format!(
                "quantize: expected 2D weight, got {:?}",
                weight.shape
            )));
        };
        if precision == WeightOnlyPrecision::Int4 && cols % 2 != 0 {
            return Err(Error::InvalidShape(format!(
                "quantize: int4 packing needs an even number of output channels, got {cols}"
            )));
        }

        let values = weight.to_f32_vec()?;
        let qmax = precision.qmax();
        let mut scales = vec![0.0_f32; cols];
        for (c, scale) in scales.iter_mut().enumerate() {
            let max_abs = (0..rows)
                .map(|r| values[r * cols + c].abs())
                .fold(0.0_f32, f32::max);
            *scale = if max_abs == 0.0 { 1.0 } else { max_abs / qmax };
        }

        let quantized: Vec<i8> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                (v / scales[i % cols])
                    .round()
                    .clamp(precision.qmin(), qmax) as i8
            })
            .collect();

        let (packed_cols, data): (usize, Vec<u8>) = match precision {
            WeightOnlyPrecision::Int8 => (cols, quantized.iter().map(|&q| q as u8).collect()),
            WeightOnlyPrecision::Int4 => (
                cols / 2,
                quantized
                    .chunks_exact(2)
                    .map(|pair| ((pair[1] as u8) << 4) | (pair[0] as u8 & 0x0F))
                    .collect(),
            ),
        };
        let packed = HostTensor::from_raw(&[rows, packed_cols], precision.packed_dtype(), data)?;
        let scale = HostTensor::from_f32_as(&[cols], &scales, weight.dtype)?;
        Ok((packed, scale))
    }
}

/// Expand a packed payload back to `f32`, for verification.
///
/// # Errors
/// Returns an error if `packed` is not an integer payload or `scale` does
/// not have one entry per output channel.
pub fn dequantize(packed: &HostTensor, scale: &HostTensor) -> Result<HostTensor> {
    let scales = scale.to_f32_vec()?;
    let (rows, levels): (usize, Vec<i8>) = match (packed.dtype, packed.shape.as_slice()) {
        (DType::I8, &[rows, _]) => (rows, packed.data.iter().map(|&b| b as i8).collect()),
        (DType::I4x2, &[rows, _]) => (
            rows,
            packed
                .data
                .iter()
                .flat_map(|&b| [((b << 4) as i8) >> 4, (b as i8) >> 4])
                .collect(),
        ),
        _ => {
            return Err(Error::UnsupportedDtype(format!(
                "dequantize: expected a 2D int payload, got {} {:?}",
                packed.dtype, packed.shape
            )))
        }
    };
    let cols = levels.len() / rows.max(1);
    if scales.len() != cols {
        return Err(Error::ShapeMismatch {
            expected: vec![cols],
            got: scale.shape.clone(),
        });
    }
    let values: Vec<f32> = levels
        .iter()
        .enumerate()
        .map(|(i, &q)| f32::from(q) * scales[i % cols])
        .collect();
    Ok(HostTensor::from_f32(&[rows, cols], &values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight() -> HostTensor {
        // [in=3, out=4]
        HostTensor::from_f32(
            &[3, 4],
            &[
                1.0, -2.5, 0.0, 0.5, //
                -0.5, 4.0, 0.0, 0.25, //
                0.25, 1.0, 0.0, -1.0,
            ],
        )
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!(
            "int8".parse::<WeightOnlyPrecision>().unwrap(),
            WeightOnlyPrecision::Int8
        );
        assert_eq!(
            "int4".parse::<WeightOnlyPrecision>().unwrap(),
            WeightOnlyPrecision::Int4
        );
        assert!(matches!(
            "int2".parse::<WeightOnlyPrecision>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_int8_scales_per_output_channel() {
        let (packed, scale) = SymmetricQuantizer
            .quantize(&weight(), WeightOnlyPrecision::Int8)
            .unwrap();
        assert_eq!(packed.dtype, DType::I8);
        assert_eq!(packed.shape, vec![3, 4]);
        assert_eq!(scale.shape, vec![4]);
        let s = scale.to_f32_vec().unwrap();
        assert!((s[0] - 1.0 / 127.0).abs() < 1e-7);
        assert!((s[1] - 4.0 / 127.0).abs() < 1e-7);
        assert_eq!(s[2], 1.0);
        // the channel maximum maps to qmax
        assert_eq!(packed.data[5] as i8, 127);
        assert_eq!(packed.data[0] as i8, 127);
    }

    #[test]
    fn test_int4_packs_two_per_byte() {
        let (packed, scale) = SymmetricQuantizer
            .quantize(&weight(), WeightOnlyPrecision::Int4)
            .unwrap();
        assert_eq!(packed.dtype, DType::I4x2);
        assert_eq!(packed.shape, vec![3, 2]);
        assert_eq!(scale.shape, vec![4]);
        // row 0: c0 = 1.0 / (1/7) = 7, c1 = -2.5 / (4/7) = -4.375 -> -4
        let byte = packed.data[0];
        assert_eq!(((byte << 4) as i8) >> 4, 7);
        assert_eq!((byte as i8) >> 4, -4);
    }

    #[test]
    fn test_dequantize_within_one_step() {
        for precision in [WeightOnlyPrecision::Int8, WeightOnlyPrecision::Int4] {
            let w = weight();
            let (packed, scale) = SymmetricQuantizer.quantize(&w, precision).unwrap();
            let restored = dequantize(&packed, &scale).unwrap();
            assert_eq!(restored.shape, w.shape);
            let steps = scale.to_f32_vec().unwrap();
            for (i, (a, b)) in w
                .to_f32_vec()
                .unwrap()
                .iter()
                .zip(restored.to_f32_vec().unwrap())
                .enumerate()
            {
                assert!((a - b).abs() <= steps[i % 4], "{precision}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_scale_keeps_weight_dtype() {
        let w = weight().cast(DType::BF16).unwrap();
        let (_, scale) = SymmetricQuantizer
            .quantize(&w, WeightOnlyPrecision::Int8)
            .unwrap();
        assert_eq!(scale.dtype, DType::BF16);
    }

    #[test]
    fn test_rejects_unsupported_inputs() {
        let odd = HostTensor::from_f32(&[2, 3], &[0.0; 6]);
        assert!(matches!(
            SymmetricQuantizer.quantize(&odd, WeightOnlyPrecision::Int4),
            Err(Error::InvalidShape(_))
        ));
        let flat = HostTensor::from_f32(&[4], &[0.0; 4]);
        assert!(SymmetricQuantizer
            .quantize(&flat, WeightOnlyPrecision::Int8)
            .is_err());
        let ints = HostTensor::zeros(&[2, 2], DType::I8);
        assert!(matches!(
            SymmetricQuantizer.quantize(&ints, WeightOnlyPrecision::Int8),
            Err(Error::UnsupportedDtype(_))
        ));
    }
}
