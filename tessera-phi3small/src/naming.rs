//! Source-to-target parameter naming and the typed weight records.
//!
//! The source checkpoint is renamed once, up front, and every tensor is
//! cast to the target dtype. Layer tensors land in [`LayerWeights`] fields
//! so later stages never assemble names to find them.

use tracing::warn;

use tessera::{DType, Error, HostTensor, ParamMap, Result};

use crate::config::Phi3SmallConfig;

/// Target name of the vocabulary embedding.
pub const VOCAB_EMBEDDING: &str = "transformer.vocab_embedding.weight";
/// Target name of the output projection.
pub const LM_HEAD: &str = "lm_head.weight";
/// Target prefix of the final layer norm.
pub const FINAL_NORM: &str = "transformer.ln_f";

const LAYER_REWRITES: &[(&str, &str)] = &[
    ("model.layers.", "transformer.layers."),
    ("self_attn.", "attention."),
    ("query_key_value.", "qkv."),
    ("mlp.up_proj.", "mlp.fc."),
    ("mlp.down_proj.", "mlp.proj."),
    ("post_attention_layernorm.", "post_layernorm."),
];

/// Rewrite a source parameter name into the target naming scheme.
#[must_use]
pub fn rename_source_key(key: &str) -> String {
    let mut key = key.to_string();
    if key.contains("model.layers.") {
        for (from, to) in LAYER_REWRITES {
            key = key.replace(from, to);
        }
    }
    key.replace("model.embed_tokens.weight", VOCAB_EMBEDDING)
        .replace("model.final_layernorm.", "transformer.ln_f.")
}

/// Target prefix for layer `index`.
#[must_use]
pub fn layer_prefix(index: usize) -> String {
    format!("transformer.layers.{index}")
}

/// A linear projection's weight (`[out, in]`) and optional bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: HostTensor,
    pub bias: Option<HostTensor>,
}

/// A layer norm's scale and optional shift.
#[derive(Debug, Clone, PartialEq)]
pub struct Norm {
    pub weight: HostTensor,
    pub bias: Option<HostTensor>,
}

impl Norm {
    /// Emit `{prefix}.weight` and `{prefix}.bias` unchanged.
    pub fn append_to(&self, prefix: &str, out: &mut ParamMap) {
        out.insert(format!("{prefix}.weight"), self.weight.clone());
        if let Some(bias) = &self.bias {
            out.insert(format!("{prefix}.bias"), bias.clone());
        }
    }
}

/// All tensors of one transformer block.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    /// Fused query/key/value projection, still in the per-kv-group layout
    pub qkv: Linear,
    /// Attention output projection
    pub dense: Linear,
    /// MLP fan-in projection
    pub mlp_fc: Linear,
    /// MLP fan-out projection
    pub mlp_proj: Linear,
    pub input_layernorm: Norm,
    pub post_layernorm: Norm,
}

/// The whole checkpoint in target naming, before sharding.
#[derive(Debug, Clone, PartialEq)]
pub struct Phi3SmallWeights {
    pub layers: Vec<LayerWeights>,
    pub vocab_embedding: HostTensor,
    /// Learned output projection; `None` when the checkpoint omits it
    pub lm_head: Option<HostTensor>,
    pub final_norm: Norm,
    /// Renamed tensors with no dedicated slot, replicated as-is
    pub passthrough: ParamMap,
}

#[derive(Default)]
struct LinearSlots {
    weight: Option<HostTensor>,
    bias: Option<HostTensor>,
}

impl LinearSlots {
    fn finish(self, name: &str) -> Result<Linear> {
        let weight = self
            .weight
            .ok_or_else(|| Error::WeightNotFound(format!("{name}.weight")))?;
        Ok(Linear {
            weight,
            bias: self.bias,
        })
    }

    fn finish_norm(self, name: &str) -> Result<Norm> {
        let Linear { weight, bias } = self.finish(name)?;
        Ok(Norm { weight, bias })
    }

    fn slot(&mut self, field: &str) -> Option<&mut Option<HostTensor>> {
        match field {
            "weight" => Some(&mut self.weight),
            "bias" => Some(&mut self.bias),
            _ => None,
        }
    }
}

#[derive(Default)]
struct LayerSlots {
    qkv: LinearSlots,
    dense: LinearSlots,
    mlp_fc: LinearSlots,
    mlp_proj: LinearSlots,
    input_layernorm: LinearSlots,
    post_layernorm: LinearSlots,
}

impl LayerSlots {
    fn slot(&mut self, module: &str, field: &str) -> Option<&mut Option<HostTensor>> {
        let slots = match module {
            "attention.qkv" => &mut self.qkv,
            "attention.dense" => &mut self.dense,
            "mlp.fc" => &mut self.mlp_fc,
            "mlp.proj" => &mut self.mlp_proj,
            "input_layernorm" => &mut self.input_layernorm,
            "post_layernorm" => &mut self.post_layernorm,
            _ => return None,
        };
        slots.slot(field)
    }

    fn finish(self, index: usize) -> Result<LayerWeights> {
        let prefix = layer_prefix(index);
        Ok(LayerWeights {
            qkv: self.qkv.finish(&format!("{prefix}.attention.qkv"))?,
            dense: self.dense.finish(&format!("{prefix}.attention.dense"))?,
            mlp_fc: self.mlp_fc.finish(&format!("{prefix}.mlp.fc"))?,
            mlp_proj: self.mlp_proj.finish(&format!("{prefix}.mlp.proj"))?,
            input_layernorm: self
                .input_layernorm
                .finish_norm(&format!("{prefix}.input_layernorm"))?,
            post_layernorm: self
                .post_layernorm
                .finish_norm(&format!("{prefix}.post_layernorm"))?,
        })
    }
}

/// Split `transformer.layers.<i>.<module>.<field>` into its parts.
fn parse_layer_key(key: &str) -> Option<(usize, &str, &str)> {
    let rest = key.strip_prefix("transformer.layers.")?;
    let (index, rest) = rest.split_once('.')?;
    let index = index.parse().ok()?;
    let (module, field) = rest.rsplit_once('.')?;
    Some((index, module, field))
}

impl Phi3SmallWeights {
    /// Rename, cast and slot every tensor of a source checkpoint.
    ///
    /// A missing `lm_head.weight` stays `None`; tensors that match no slot
    /// are kept in [`passthrough`](Self::passthrough).
    ///
    /// # Errors
    /// Returns `WeightNotFound` for a missing required tensor, `Config` for
    /// a layer tensor indexed past `num_hidden_layers`, and
    /// `UnsupportedDtype` if a tensor cannot be cast to `dtype`.
    pub fn from_source(source: ParamMap, config: &Phi3SmallConfig, dtype: DType) -> Result<Self> {
        let mut layers: Vec<LayerSlots> = (0..config.num_hidden_layers)
            .map(|_| LayerSlots::default())
            .collect();
        let mut vocab_embedding = None;
        let mut lm_head = None;
        let mut final_norm = LinearSlots::default();
        let mut passthrough = ParamMap::new();

        for (key, tensor) in source {
            let name = rename_source_key(&key);
            let tensor = tensor.cast(dtype)?;

            let slot = if name == VOCAB_EMBEDDING {
                Some(&mut vocab_embedding)
            } else if name == LM_HEAD {
                Some(&mut lm_head)
            } else if let Some(field) = name.strip_prefix("transformer.ln_f.") {
                final_norm.slot(field)
            } else if let Some((index, module, field)) = parse_layer_key(&name) {
                let Some(layer) = layers.get_mut(index) else {
                    return Err(Error::Config(format!(
                        "'{name}' belongs to layer {index}, but the model has {} layers",
                        config.num_hidden_layers
                    )));
                };
                layer.slot(module, field)
            } else {
                None
            };

            match slot {
                Some(slot) => *slot = Some(tensor),
                None => {
                    warn!(name = %name, "Keeping unrecognized parameter unsharded");
                    passthrough.insert(name, tensor);
                }
            }
        }

        let layers = layers
            .into_iter()
            .enumerate()
            .map(|(index, slots)| slots.finish(index))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            vocab_embedding: vocab_embedding
                .ok_or_else(|| Error::WeightNotFound(VOCAB_EMBEDDING.to_string()))?,
            lm_head,
            final_norm: final_norm.finish_norm(FINAL_NORM)?,
            passthrough,
        })
    }
}
