//! Phi-3-small source model configuration

use serde::Deserialize;

use tessera::{Error, Result};

/// Long-context RoPE scaling (`rope_scaling` in `config.json`).
///
/// Every field is optional upstream; the target config only requires them
/// for long-context models.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RopeScalingConfig {
    /// Scaling type, e.g. `"su"` or `"longrope"`
    #[serde(rename = "type", default)]
    pub scaling_type: Option<String>,

    /// Per-frequency factors for sequences within the original context
    #[serde(default)]
    pub short_factor: Option<Vec<f64>>,

    /// Per-frequency factors for sequences beyond the original context
    #[serde(default)]
    pub long_factor: Option<Vec<f64>>,

    /// Attention magnitude scale used with the short factors
    #[serde(default)]
    pub short_mscale: Option<f64>,

    /// Attention magnitude scale used with the long factors
    #[serde(default)]
    pub long_mscale: Option<f64>,
}

/// Configuration for Phi-3-small models
///
/// Parsed from the model's `config.json` file. Defaults follow the upstream
/// configuration class so that sparse configs still parse.
#[derive(Debug, Clone, Deserialize)]
pub struct Phi3SmallConfig {
    /// Vocabulary size
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Intermediate size for the gated MLP
    #[serde(alias = "ff_intermediate_size")]
    pub intermediate_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA, defaults to `num_attention_heads`)
    #[serde(default, alias = "num_kv_heads")]
    pub num_key_value_heads: Option<usize>,

    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Context length the rotary scaling factors were fitted against
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,

    /// Rotary position embedding base frequency
    #[serde(default = "default_rope_embedding_base")]
    pub rope_embedding_base: f64,

    /// Long-context rotary scaling
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,

    /// MLP activation (`"gegelu"` for Phi-3-small)
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,

    /// Clamp applied inside the gated GELU
    #[serde(default = "default_gegelu_limit")]
    pub gegelu_limit: f64,

    // --- muP scaling ---
    #[serde(default = "default_mup_attn_multiplier")]
    pub mup_attn_multiplier: f64,

    #[serde(default = "default_mup_embedding_multiplier")]
    pub mup_embedding_multiplier: f64,

    #[serde(default = "default_true")]
    pub mup_use_scaling: bool,

    #[serde(default = "default_mup_width_multiplier")]
    pub mup_width_multiplier: f64,

    // --- Block-sparse attention ---
    #[serde(default = "default_blocksparse_block_size")]
    pub blocksparse_block_size: usize,

    #[serde(default)]
    pub blocksparse_homo_head_pattern: bool,

    #[serde(default = "default_blocksparse_num_local_blocks")]
    pub blocksparse_num_local_blocks: usize,

    #[serde(default = "default_blocksparse_vert_stride")]
    pub blocksparse_vert_stride: usize,

    /// Every n-th layer uses dense instead of block-sparse attention
    #[serde(default = "default_dense_attention_every_n_layers")]
    pub dense_attention_every_n_layers: usize,
}

fn default_vocab_size() -> usize {
    100_352
}

fn default_max_position_embeddings() -> usize {
    8192
}

fn default_rope_embedding_base() -> f64 {
    1_000_000.0
}

fn default_hidden_act() -> String {
    "gegelu".to_string()
}

fn default_gegelu_limit() -> f64 {
    20.0
}

fn default_mup_attn_multiplier() -> f64 {
    1.0
}

fn default_mup_embedding_multiplier() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_mup_width_multiplier() -> f64 {
    8.0
}

fn default_blocksparse_block_size() -> usize {
    64
}

fn default_blocksparse_num_local_blocks() -> usize {
    16
}

fn default_blocksparse_vert_stride() -> usize {
    8
}

fn default_dense_attention_every_n_layers() -> usize {
    2
}

impl Phi3SmallConfig {
    /// Parse configuration from `config.json` contents
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or a required field is missing
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Get the number of key-value heads (for grouped-query attention)
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get the head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Get the number of query heads per key-value head
    #[must_use]
    pub fn num_q_per_kv(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    /// Check the head-count invariants the QKV layout depends on.
    ///
    /// # Errors
    /// Returns `Config` if a head count is zero or a ratio is not integral.
    pub fn validate(&self) -> Result<()> {
        let heads = self.num_attention_heads;
        let kv_heads = self.num_kv_heads();
        if heads == 0 || kv_heads == 0 {
            return Err(Error::Config(format!(
                "head counts must be positive (num_attention_heads={heads}, num_kv_heads={kv_heads})"
            )));
        }
        if heads % kv_heads != 0 {
            return Err(Error::Config(format!(
                "num_attention_heads {heads} is not a multiple of num_kv_heads {kv_heads}"
            )));
        }
        if self.hidden_size % heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} is not a multiple of num_attention_heads {heads}",
                self.hidden_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "hidden_size": 4096,
            "ff_intermediate_size": 14336,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8
        }"#;

        let config = Phi3SmallConfig::from_json(json).unwrap();

        assert_eq!(config.vocab_size, 100_352);
        assert_eq!(config.intermediate_size, 14336);
        assert_eq!(config.num_kv_heads(), 8);
        assert_eq!(config.num_q_per_kv(), 4);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.max_position_embeddings, 8192);
        assert_eq!(config.hidden_act, "gegelu");
        assert!(config.mup_use_scaling);
        assert!(!config.blocksparse_homo_head_pattern);
        assert!(config.rope_scaling.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_kv_heads_alias_and_default() {
        let json = r#"{
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "num_kv_heads": 2
        }"#;
        let config = Phi3SmallConfig::from_json(json).unwrap();
        assert_eq!(config.num_kv_heads(), 2);

        let json = r#"{
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 4
        }"#;
        let config = Phi3SmallConfig::from_json(json).unwrap();
        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.num_q_per_kv(), 1);
    }

    #[test]
    fn test_config_rope_scaling() {
        let json = r#"{
            "hidden_size": 4096,
            "ff_intermediate_size": 14336,
            "num_hidden_layers": 32,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "max_position_embeddings": 131072,
            "original_max_position_embeddings": 8192,
            "rope_scaling": {
                "type": "su",
                "short_factor": [1.0, 1.5],
                "long_factor": [2.0, 4.0],
                "short_mscale": 1.1,
                "long_mscale": 1.2
            }
        }"#;
        let config = Phi3SmallConfig::from_json(json).unwrap();
        let scaling = config.rope_scaling.unwrap();
        assert_eq!(scaling.scaling_type.as_deref(), Some("su"));
        assert_eq!(scaling.long_factor, Some(vec![2.0, 4.0]));
        assert_eq!(scaling.short_mscale, Some(1.1));
        assert_eq!(config.original_max_position_embeddings, Some(8192));
    }

    #[test]
    fn test_config_missing_required_field() {
        let json = r#"{ "hidden_size": 8 }"#;
        assert!(matches!(
            Phi3SmallConfig::from_json(json),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_head_ratios() {
        let json = r#"{
            "hidden_size": 12,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 6,
            "num_key_value_heads": 4
        }"#;
        let config = Phi3SmallConfig::from_json(json).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let json = r#"{
            "hidden_size": 10,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 4,
            "num_key_value_heads": 2
        }"#;
        let config = Phi3SmallConfig::from_json(json).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
