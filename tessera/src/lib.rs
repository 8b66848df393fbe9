//! Tessera: host-side tensor sharding for tensor-parallel checkpoints
//!
//! This crate provides the model-agnostic building blocks for converting a
//! checkpoint into an execution engine's layout: host tensors, equal-shard
//! partitioning, vocabulary padding, and weight-only packing. Model-specific
//! conversion lives in separate crates.

pub mod dtype;
pub mod error;
pub mod linear;
pub mod params;
pub mod quantize;
pub mod shard;
pub mod tensor;

pub use dtype::DType;
pub use error::{Error, Result};
pub use linear::{pack_linear, LinearPacking};
pub use params::{from_safetensors_bytes, merge_disjoint, to_safetensors_bytes, ParamMap};
pub use quantize::{SymmetricQuantizer, WeightOnlyPrecision, WeightQuantizer};
pub use shard::{pad_vocab_size, shard_tensor, split, split_embedding, ShardConfig, ShardStrategy};
pub use tensor::HostTensor;
