//! Target engine configuration and its projection from the source config.

use serde::Serialize;

use tessera::{DType, Error, Result, WeightOnlyPrecision};

use crate::args::ConversionArgs;
use crate::config::Phi3SmallConfig;

/// Models at or above this context length carry long-context RoPE fields.
pub const LONG_CONTEXT_THRESHOLD: usize = 128_000;

/// Architecture name the engine dispatches on.
pub const ARCHITECTURE: &str = "Phi3SmallForCausalLM";

/// Parallel layout of the converted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub world_size: usize,
    pub tp_size: usize,
    pub pp_size: usize,
}

/// Weight-only quantization algorithm tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuantAlgo {
    /// int8 weights, 16-bit activations
    W8A16,
    /// int4 weights, 16-bit activations
    W4A16,
}

impl From<WeightOnlyPrecision> for QuantAlgo {
    fn from(precision: WeightOnlyPrecision) -> Self {
        match precision {
            WeightOnlyPrecision::Int8 => Self::W8A16,
            WeightOnlyPrecision::Int4 => Self::W4A16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quantization {
    pub quant_algo: QuantAlgo,
}

/// Long-context rotary scaling fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongRope {
    pub original_max_position_embeddings: usize,
    pub longrope_scaling_short_factors: Vec<f64>,
    pub longrope_scaling_long_factors: Vec<f64>,
    pub longrope_long_mscale: f64,
    pub longrope_short_mscale: f64,
}

/// Engine configuration record for a converted Phi-3-small checkpoint.
///
/// Conditional blocks are omitted from the serialized form when absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetConfig {
    pub architecture: String,
    pub dtype: DType,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_kv_heads: usize,
    pub rotary_embedding_base: f64,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub hidden_act: String,
    pub share_embedding_table: bool,
    pub gegelu_limit: f64,
    pub mup_attn_multiplier: f64,
    pub mup_embedding_multiplier: f64,
    pub mup_use_scaling: bool,
    pub mup_width_multiplier: f64,
    pub blocksparse_block_size: usize,
    pub blocksparse_homo_head_pattern: bool,
    pub blocksparse_num_local_blocks: usize,
    pub blocksparse_vertical_stride: usize,
    pub dense_attention_every_n_layers: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Mapping>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_parallel_embedding: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_sharding_dim: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<Quantization>,

    #[serde(flatten)]
    pub long_rope: Option<LongRope>,
}

impl TargetConfig {
    /// Pretty-printed JSON for the engine's `config.json`.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Map source hyperparameters and conversion arguments to the target record.
///
/// The mapping and embedding policy are present only when `args` is given;
/// the quantization block only when weight-only quantization is requested.
///
/// # Errors
/// Returns `MissingField` if a long-context model lacks its rotary scaling
/// fields.
pub fn project_config(
    source: &Phi3SmallConfig,
    dtype: DType,
    args: Option<&ConversionArgs>,
) -> Result<TargetConfig> {
    let long_rope = if source.max_position_embeddings >= LONG_CONTEXT_THRESHOLD {
        Some(long_rope(source)?)
    } else {
        None
    };

    Ok(TargetConfig {
        architecture: ARCHITECTURE.to_string(),
        dtype,
        num_hidden_layers: source.num_hidden_layers,
        num_attention_heads: source.num_attention_heads,
        num_kv_heads: source.num_kv_heads(),
        rotary_embedding_base: source.rope_embedding_base,
        hidden_size: source.hidden_size,
        intermediate_size: source.intermediate_size,
        vocab_size: source.vocab_size,
        max_position_embeddings: source.max_position_embeddings,
        hidden_act: source.hidden_act.clone(),
        share_embedding_table: false,
        gegelu_limit: source.gegelu_limit,
        mup_attn_multiplier: source.mup_attn_multiplier,
        mup_embedding_multiplier: source.mup_embedding_multiplier,
        mup_use_scaling: source.mup_use_scaling,
        mup_width_multiplier: source.mup_width_multiplier,
        blocksparse_block_size: source.blocksparse_block_size,
        blocksparse_homo_head_pattern: source.blocksparse_homo_head_pattern,
        blocksparse_num_local_blocks: source.blocksparse_num_local_blocks,
        blocksparse_vertical_stride: source.blocksparse_vert_stride,
        dense_attention_every_n_layers: source.dense_attention_every_n_layers,
        mapping: args.map(|a| Mapping {
            world_size: a.world_size(),
            tp_size: a.tp_size,
            pp_size: a.pp_size,
        }),
        use_parallel_embedding: args.map(|a| a.use_parallel_embedding),
        embedding_sharding_dim: args.map(|a| a.embedding_sharding_dim),
        quantization: args.and_then(|a| a.packing().precision()).map(|p| Quantization {
            quant_algo: p.into(),
        }),
        long_rope,
    })
}

fn long_rope(source: &Phi3SmallConfig) -> Result<LongRope> {
    fn required<T>(value: Option<T>, name: &str) -> Result<T> {
        value.ok_or_else(|| Error::MissingField(name.to_string()))
    }

    let scaling = required(source.rope_scaling.as_ref(), "rope_scaling")?;
    Ok(LongRope {
        original_max_position_embeddings: required(
            source.original_max_position_embeddings,
            "original_max_position_embeddings",
        )?,
        longrope_scaling_short_factors: required(
            scaling.short_factor.clone(),
            "rope_scaling.short_factor",
        )?,
        longrope_scaling_long_factors: required(
            scaling.long_factor.clone(),
            "rope_scaling.long_factor",
        )?,
        longrope_long_mscale: required(scaling.long_mscale, "rope_scaling.long_mscale")?,
        longrope_short_mscale: required(scaling.short_mscale, "rope_scaling.short_mscale")?,
    })
}
