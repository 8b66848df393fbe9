//! Per-rank checkpoint conversion.
//!
//! Each layer is converted independently into its own [`ParamMap`]; the
//! maps are merged once at the end together with the embedding, the LM
//! head and the final norm. With the `parallel` feature the layers run on
//! the rayon pool. The output is the same either way.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info};

use tessera::{
    merge_disjoint, pack_linear, shard_tensor, split, split_embedding, LinearPacking, ParamMap,
    Result, ShardConfig, ShardStrategy, WeightQuantizer,
};

use crate::args::ConversionArgs;
use crate::config::Phi3SmallConfig;
use crate::naming::{
    layer_prefix, LayerWeights, Linear, Phi3SmallWeights, FINAL_NORM, LM_HEAD, VOCAB_EMBEDDING,
};
use crate::qkv::{shuffle_qkv, split_qkv, QkvLayout};

/// Everything a layer conversion needs besides its weights.
pub struct ConversionContext<'q, Q: ?Sized> {
    pub layout: QkvLayout,
    pub shard: ShardConfig,
    pub packing: LinearPacking,
    pub use_parallel_embedding: bool,
    pub embedding_sharding_dim: usize,
    pub quantizer: &'q Q,
}

impl<'q, Q: WeightQuantizer + Sync + ?Sized> ConversionContext<'q, Q> {
    /// # Errors
    /// Returns `Config` if the model or the arguments are inconsistent.
    pub fn new(config: &Phi3SmallConfig, args: &ConversionArgs, quantizer: &'q Q) -> Result<Self> {
        let layout = QkvLayout::from_config(config)?;
        args.validate(config)?;
        Ok(Self {
            layout,
            shard: args.shard()?,
            packing: args.packing(),
            use_parallel_embedding: args.use_parallel_embedding,
            embedding_sharding_dim: args.embedding_sharding_dim,
            quantizer,
        })
    }

    /// Slice one projection with `strategy`, slicing its bias too when
    /// `split_bias` is set, and pack it under `prefix`.
    fn split_linear(
        &self,
        linear: &Linear,
        prefix: &str,
        strategy: ShardStrategy,
        split_bias: bool,
    ) -> Result<ParamMap> {
        let weight = shard_tensor(&linear.weight, &self.shard, strategy)?.into_owned();
        let bias = match (&linear.bias, strategy.axis()) {
            (Some(bias), Some(_)) if split_bias => Some(split(bias, &self.shard, 0)?.into_owned()),
            (bias, _) => bias.clone(),
        };
        pack_linear(weight, prefix, bias, self.packing, self.quantizer)
    }
}

/// Convert the tensors of layer `index` for this rank.
///
/// # Errors
/// Returns the first shape, divisibility or quantization error hit.
pub fn convert_layer<Q: WeightQuantizer + Sync + ?Sized>(
    index: usize,
    layer: &LayerWeights,
    ctx: &ConversionContext<'_, Q>,
) -> Result<ParamMap> {
    let prefix = layer_prefix(index);
    let mut out = ParamMap::new();

    let qkv_weight = split_qkv(
        shuffle_qkv(&layer.qkv.weight, &ctx.layout)?,
        &ctx.layout,
        &ctx.shard,
    )?;
    let qkv_bias = layer
        .qkv
        .bias
        .as_ref()
        .map(|bias| split_qkv(shuffle_qkv(bias, &ctx.layout)?, &ctx.layout, &ctx.shard))
        .transpose()?;
    out.extend(pack_linear(
        qkv_weight,
        &format!("{prefix}.attention.qkv"),
        qkv_bias,
        ctx.packing,
        ctx.quantizer,
    )?);

    out.extend(ctx.split_linear(
        &layer.dense,
        &format!("{prefix}.attention.dense"),
        ShardStrategy::Row,
        false,
    )?);
    out.extend(ctx.split_linear(
        &layer.mlp_fc,
        &format!("{prefix}.mlp.fc"),
        ShardStrategy::Column,
        true,
    )?);
    out.extend(ctx.split_linear(
        &layer.mlp_proj,
        &format!("{prefix}.mlp.proj"),
        ShardStrategy::Row,
        false,
    )?);

    layer
        .input_layernorm
        .append_to(&format!("{prefix}.input_layernorm"), &mut out);
    layer
        .post_layernorm
        .append_to(&format!("{prefix}.post_layernorm"), &mut out);

    debug!(layer = index, tensors = out.len(), "Converted layer");
    Ok(out)
}

#[cfg(feature = "parallel")]
fn convert_layers<Q: WeightQuantizer + Sync + ?Sized>(
    layers: &[LayerWeights],
    ctx: &ConversionContext<'_, Q>,
) -> Result<Vec<ParamMap>> {
    layers
        .par_iter()
        .enumerate()
        .map(|(index, layer)| convert_layer(index, layer, ctx))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn convert_layers<Q: WeightQuantizer + Sync + ?Sized>(
    layers: &[LayerWeights],
    ctx: &ConversionContext<'_, Q>,
) -> Result<Vec<ParamMap>> {
    layers
        .iter()
        .enumerate()
        .map(|(index, layer)| convert_layer(index, layer, ctx))
        .collect()
}

/// Shard every tensor of the checkpoint for `ctx.shard`.
///
/// The LM head is always split along the vocabulary and is never padded,
/// so its row count must divide evenly. A checkpoint without one gets a
/// copy of the vocabulary embedding.
///
/// # Errors
/// Returns the first error hit by any layer or global tensor.
pub fn split_weights<Q: WeightQuantizer + Sync + ?Sized>(
    weights: &Phi3SmallWeights,
    ctx: &ConversionContext<'_, Q>,
) -> Result<ParamMap> {
    let mut out = ParamMap::new();
    for part in convert_layers(&weights.layers, ctx)? {
        merge_disjoint(&mut out, part)?;
    }

    if let Some(embedding) = split_embedding(
        Some(&weights.vocab_embedding),
        &ctx.shard,
        ctx.use_parallel_embedding,
        ctx.embedding_sharding_dim,
    )? {
        out.insert(VOCAB_EMBEDDING.to_string(), embedding.into_owned());
    }

    let lm_head = weights.lm_head.as_ref().unwrap_or(&weights.vocab_embedding);
    out.insert(
        LM_HEAD.to_string(),
        split(lm_head, &ctx.shard, 0)?.into_owned(),
    );

    let mut globals = ParamMap::new();
    weights.final_norm.append_to(FINAL_NORM, &mut globals);
    globals.extend(
        weights
            .passthrough
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.clone())),
    );
    merge_disjoint(&mut out, globals)?;
    Ok(out)
}

/// Convert a source checkpoint into this rank's engine parameters.
///
/// # Errors
/// Returns `Config` for inconsistent model or arguments, `WeightNotFound`
/// for a missing tensor, and any shape or quantization error. No partial
/// output is returned.
pub fn convert_checkpoint<Q: WeightQuantizer + Sync + ?Sized>(
    source: ParamMap,
    config: &Phi3SmallConfig,
    args: &ConversionArgs,
    quantizer: &Q,
) -> Result<ParamMap> {
    let ctx = ConversionContext::new(config, args, quantizer)?;
    info!(
        layers = config.num_hidden_layers,
        tp_size = ctx.shard.world_size,
        rank = ctx.shard.rank,
        dtype = %args.dtype,
        "Converting Phi-3-small checkpoint"
    );

    let weights = Phi3SmallWeights::from_source(source, config, args.dtype)?;
    let params = split_weights(&weights, &ctx)?;

    info!(tensors = params.len(), rank = ctx.shard.rank, "Conversion complete");
    Ok(params)
}
