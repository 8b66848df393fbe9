//! Data types for tensor elements

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Supported data types for host tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point
    #[serde(rename = "float32", alias = "fp32", alias = "f32")]
    F32,
    /// 16-bit floating point (IEEE 754)
    #[serde(rename = "float16", alias = "fp16", alias = "f16")]
    F16,
    /// Brain floating point (16-bit)
    #[serde(rename = "bfloat16", alias = "bf16")]
    BF16,
    /// Signed 8-bit integer (weight-only int8 payload)
    #[serde(rename = "int8", alias = "i8")]
    I8,
    /// Two signed 4-bit integers packed per byte.
    ///
    /// The shape of an `I4x2` tensor counts bytes, so the packed inner
    /// dimension is half the logical one.
    #[serde(rename = "int4x2")]
    I4x2,
}

impl DType {
    /// Size of one stored element in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I8 | Self::I4x2 => 1,
        }
    }

    /// Whether this is a floating-point dtype
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Whether this is a weight-only quantized payload dtype
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::I8 | Self::I4x2)
    }

    /// Convert from a safetensors dtype
    #[must_use]
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::F32 => Some(Self::F32),
            safetensors::Dtype::F16 => Some(Self::F16),
            safetensors::Dtype::BF16 => Some(Self::BF16),
            safetensors::Dtype::I8 => Some(Self::I8),
            _ => None,
        }
    }

    /// The safetensors dtype used to store this dtype.
    ///
    /// Packed int4 has no native safetensors type and is stored as `I8`.
    #[must_use]
    pub const fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::F32 => safetensors::Dtype::F32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::I8 | Self::I4x2 => safetensors::Dtype::I8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "float32"),
            Self::F16 => write!(f, "float16"),
            Self::BF16 => write!(f, "bfloat16"),
            Self::I8 => write!(f, "int8"),
            Self::I4x2 => write!(f, "int4x2"),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" | "fp32" | "f32" => Ok(Self::F32),
            "float16" | "fp16" | "f16" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            "int8" | "i8" => Ok(Self::I8),
            "int4x2" => Ok(Self::I4x2),
            other => Err(Error::UnsupportedDtype(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I8.size_in_bytes(), 1);
        assert_eq!(DType::I4x2.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_from_str() {
        assert_eq!("float16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("fp16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("bf16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert!(matches!(
            "float64".parse::<DType>(),
            Err(Error::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_dtype_display_round_trips_through_from_str() {
        for dtype in [DType::F32, DType::F16, DType::BF16, DType::I8, DType::I4x2] {
            assert_eq!(dtype.to_string().parse::<DType>().unwrap(), dtype);
        }
    }

    #[test]
    fn test_dtype_serde_names() {
        assert_eq!(
            serde_json::to_string(&DType::BF16).unwrap(),
            "\"bfloat16\""
        );
        let parsed: DType = serde_json::from_str("\"fp16\"").unwrap();
        assert_eq!(parsed, DType::F16);
    }

    #[test]
    fn test_dtype_safetensors_mapping() {
        assert_eq!(
            DType::from_safetensors(safetensors::Dtype::BF16),
            Some(DType::BF16)
        );
        assert_eq!(DType::from_safetensors(safetensors::Dtype::F64), None);
        assert_eq!(DType::I4x2.to_safetensors(), safetensors::Dtype::I8);
    }

    #[test]
    fn test_dtype_classes() {
        assert!(DType::BF16.is_float());
        assert!(!DType::I8.is_float());
        assert!(DType::I4x2.is_quantized());
        assert!(!DType::F32.is_quantized());
    }
}
