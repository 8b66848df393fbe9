//! Phi-3-small checkpoint conversion for Tessera
//!
//! Renames a Phi-3-small checkpoint into the engine's naming scheme,
//! reorders its fused QKV projection, shards every tensor for one
//! tensor-parallel rank and projects the model config.

pub mod args;
pub mod config;
pub mod convert;
pub mod naming;
pub mod qkv;
pub mod target;

pub use args::ConversionArgs;
pub use config::{Phi3SmallConfig, RopeScalingConfig};
pub use convert::{convert_checkpoint, convert_layer, split_weights, ConversionContext};
pub use naming::{rename_source_key, LayerWeights, Linear, Norm, Phi3SmallWeights};
pub use qkv::{shuffle_qkv, split_qkv, QkvLayout};
pub use target::{project_config, TargetConfig};
