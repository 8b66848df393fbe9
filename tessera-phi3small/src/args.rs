//! Conversion arguments supplied by the caller

use serde::Deserialize;

use tessera::{DType, Error, LinearPacking, Result, ShardConfig, WeightOnlyPrecision};

use crate::config::Phi3SmallConfig;

/// Arguments for converting one tensor-parallel rank.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversionArgs {
    /// Tensor-parallel degree
    #[serde(default = "default_parallel_size")]
    pub tp_size: usize,

    /// Pipeline-parallel degree (recorded in the target mapping only)
    #[serde(default = "default_parallel_size")]
    pub pp_size: usize,

    /// Tensor-parallel rank to produce
    #[serde(default)]
    pub rank: usize,

    /// Float dtype every converted tensor is cast to
    #[serde(default = "default_dtype")]
    pub dtype: DType,

    /// Weight-only quantization precision; `None` keeps dense weights
    #[serde(default)]
    pub weight_only: Option<WeightOnlyPrecision>,

    /// Shard the vocabulary embedding instead of replicating it
    #[serde(default)]
    pub use_parallel_embedding: bool,

    /// Axis the vocabulary embedding is sharded along (0 = vocab, 1 = hidden)
    #[serde(default)]
    pub embedding_sharding_dim: usize,
}

fn default_parallel_size() -> usize {
    1
}

fn default_dtype() -> DType {
    DType::F16
}

impl Default for ConversionArgs {
    fn default() -> Self {
        Self {
            tp_size: default_parallel_size(),
            pp_size: default_parallel_size(),
            rank: 0,
            dtype: default_dtype(),
            weight_only: None,
            use_parallel_embedding: false,
            embedding_sharding_dim: 0,
        }
    }
}

impl ConversionArgs {
    /// Parse arguments from JSON
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Total number of workers across both parallel dimensions
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.tp_size * self.pp_size
    }

    /// The tensor-parallel shard this conversion produces.
    ///
    /// # Errors
    /// Returns `Config` if `rank` is out of range for `tp_size`.
    pub fn shard(&self) -> Result<ShardConfig> {
        ShardConfig::new(self.rank, self.tp_size)
    }

    /// How linear layers are packed.
    #[must_use]
    pub fn packing(&self) -> LinearPacking {
        LinearPacking::from(self.weight_only)
    }

    /// Check the arguments against the model.
    ///
    /// Each rank must hold whole query and key/value heads.
    ///
    /// # Errors
    /// Returns `Config` describing the first inconsistency found.
    pub fn validate(&self, config: &Phi3SmallConfig) -> Result<()> {
        let shard = self.shard()?;
        if self.pp_size == 0 {
            return Err(Error::Config("pipeline-parallel size must be positive".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Config(format!(
                "target dtype must be a float type, got {}",
                self.dtype
            )));
        }
        if self.embedding_sharding_dim > 1 {
            return Err(Error::Config(format!(
                "embedding_sharding_dim must be 0 or 1, got {}",
                self.embedding_sharding_dim
            )));
        }
        let tp = shard.world_size;
        for (what, heads) in [
            ("num_attention_heads", config.num_attention_heads),
            ("num_kv_heads", config.num_kv_heads()),
        ] {
            if heads % tp != 0 {
                return Err(Error::Config(format!(
                    "{what} {heads} cannot be split across tp_size {tp}"
                )));
            }
        }
        Ok(())
    }
}
