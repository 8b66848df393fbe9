//! Packing of linear layers into the engine's parameter records.

use crate::params::ParamMap;
use crate::quantize::{WeightOnlyPrecision, WeightQuantizer};
use crate::tensor::HostTensor;
use crate::Result;

/// How linear weights are stored in the output checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearPacking {
    /// Dense float weight, stored as given.
    #[default]
    Dense,
    /// Weight-only quantized payload plus per-channel scale.
    WeightOnly(WeightOnlyPrecision),
}

impl From<Option<WeightOnlyPrecision>> for LinearPacking {
    fn from(precision: Option<WeightOnlyPrecision>) -> Self {
        precision.map_or(Self::Dense, Self::WeightOnly)
    }
}

impl LinearPacking {
    /// The weight-only precision, if quantizing.
    #[must_use]
    pub const fn precision(self) -> Option<WeightOnlyPrecision> {
        match self {
            Self::Dense => None,
            Self::WeightOnly(p) => Some(p),
        }
    }
}

/// Emit the named entries for one linear layer.
///
/// Dense packing yields `{prefix}.weight` as stored (`[out, in]`, row-major).
/// Weight-only packing transposes to `[in, out]`, runs `quantizer`, and
/// yields `{prefix}.weight` (packed) plus `{prefix}.per_channel_scale`.
/// The bias, when present, is emitted unquantized as `{prefix}.bias`.
///
/// # Errors
/// Returns an error if transposition or quantization fails.
pub fn pack_linear<Q: WeightQuantizer + ?Sized>(
    weight: HostTensor,
    prefix: &str,
    bias: Option<HostTensor>,
    packing: LinearPacking,
    quantizer: &Q,
) -> Result<ParamMap> {
    let mut results = ParamMap::new();
    match packing {
        LinearPacking::Dense => {
            results.insert(format!("{prefix}.weight"), weight);
        }
        LinearPacking::WeightOnly(precision) => {
            let transposed = weight.transpose_2d()?;
            let (packed, scale) = quantizer.quantize(&transposed, precision)?;
            results.insert(format!("{prefix}.weight"), packed);
            results.insert(format!("{prefix}.per_channel_scale"), scale);
        }
    }
    if let Some(bias) = bias {
        results.insert(format!("{prefix}.bias"), bias);
    }
    Ok(results)
}
