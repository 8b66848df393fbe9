//! Tensor parallelism configuration and host-side partitioning.
//!
//! Describes which partition a rank owns and slices host tensors into
//! equal contiguous shards. Every function here is a pure function of its
//! inputs; ranks never coordinate.

use std::borrow::Cow;

use tracing::debug;

use crate::tensor::HostTensor;
use crate::{Error, Result};

/// Describes this worker's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This worker's rank (`0..world_size`)
    pub rank: usize,
    /// Total number of workers in the tensor-parallel group
    pub world_size: usize,
}

impl ShardConfig {
    /// Validate and build a shard config.
    ///
    /// # Errors
    /// Returns `Config` if `world_size` is zero or `rank` is out of range.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Config("tensor-parallel size must be positive".into()));
        }
        if rank >= world_size {
            return Err(Error::Config(format!(
                "rank {rank} out of range for tensor-parallel size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// The trivial single-worker group.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Whether there is nothing to partition.
    #[must_use]
    pub const fn is_single(&self) -> bool {
        self.world_size == 1
    }

    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Errors
    /// Returns `NotDivisible` if `dim` is not evenly divisible by `world_size`.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if dim % self.world_size != 0 {
            return Err(Error::NotDivisible {
                what: "shard range".into(),
                dim,
                parts: self.world_size,
            });
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }
}

/// How a specific weight tensor is sliced across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Replicate the full tensor on every rank (norms, biases summed after
    /// a row-parallel matmul).
    Replicate,
    /// Column-parallel: split along the output dimension (axis 0 of the
    /// weight matrix). Used for the fused QKV and the MLP fan-in.
    Column,
    /// Row-parallel: split along the input dimension (axis 1 of the weight
    /// matrix). Used for the attention and MLP output projections.
    Row,
}

impl ShardStrategy {
    /// The axis this strategy splits, if any.
    #[must_use]
    pub const fn axis(self) -> Option<usize> {
        match self {
            Self::Replicate => None,
            Self::Column => Some(0),
            Self::Row => Some(1),
        }
    }
}

/// Take partition `shard.rank` of `tensor` along `axis`.
///
/// A single-worker group gets the input back borrowed. Otherwise the shard
/// is copied into a new densely packed tensor. 1-D tensors are always split
/// along their only axis.
///
/// # Errors
/// Returns `InvalidShape` for a scalar or an out-of-range axis, and
/// `NotDivisible` if `shape[axis]` is not a multiple of `world_size`.
pub fn split<'a>(
    tensor: &'a HostTensor,
    shard: &ShardConfig,
    axis: usize,
) -> Result<Cow<'a, HostTensor>> {
    if shard.is_single() {
        return Ok(Cow::Borrowed(tensor));
    }
    let axis = if tensor.rank() == 1 { 0 } else { axis };
    if axis >= tensor.rank() {
        return Err(Error::InvalidShape(format!(
            "split: axis {axis} out of range for shape {:?}",
            tensor.shape
        )));
    }
    let dim = tensor.shape[axis];
    let (start, len) = shard.shard_range(dim).map_err(|_| Error::NotDivisible {
        what: format!("split of {:?} along axis {axis}", tensor.shape),
        dim,
        parts: shard.world_size,
    })?;
    Ok(Cow::Owned(tensor.narrow(axis, start, len)?))
}

/// Slice a tensor according to a named strategy.
///
/// # Errors
/// Propagates errors from [`split`].
pub fn shard_tensor<'a>(
    tensor: &'a HostTensor,
    shard: &ShardConfig,
    strategy: ShardStrategy,
) -> Result<Cow<'a, HostTensor>> {
    match strategy.axis() {
        None => Ok(Cow::Borrowed(tensor)),
        Some(axis) => split(tensor, shard, axis),
    }
}

/// Round `vocab_size` up to the next multiple of `world_size`.
///
/// A `world_size` of zero or one leaves `vocab_size` unchanged.
#[must_use]
pub const fn pad_vocab_size(vocab_size: usize, world_size: usize) -> usize {
    if world_size <= 1 {
        return vocab_size;
    }
    vocab_size.div_ceil(world_size) * world_size
}

/// Partition a `[vocab, hidden]` embedding table.
///
/// - `None` in gives `None` out (no learned table to shard).
/// - With parallel embedding disabled every rank gets the full table.
/// - Sharding along the vocabulary (axis 0) zero-pads the table at the end
///   up to a multiple of `world_size` first. Sharding along the hidden axis
///   (axis 1) never pads.
///
/// # Errors
/// Returns `InvalidShape` for a non-2D table or an axis other than 0 or 1,
/// and `NotDivisible` if the hidden size does not split evenly.
pub fn split_embedding<'a>(
    param: Option<&'a HostTensor>,
    shard: &ShardConfig,
    use_parallel_embedding: bool,
    sharding_dim: usize,
) -> Result<Option<Cow<'a, HostTensor>>> {
    let Some(param) = param else {
        return Ok(None);
    };
    if !use_parallel_embedding {
        return Ok(Some(Cow::Borrowed(param)));
    }
    let &[vocab_size, hidden_size] = param.shape.as_slice() else {
        return Err(Error::InvalidShape(format!(
            "split_embedding: expected [vocab, hidden], got {:?}",
            param.shape
        )));
    };

    match sharding_dim {
        0 if vocab_size % shard.world_size != 0 => {
            let padded_size = pad_vocab_size(vocab_size, shard.world_size);
            debug!(vocab_size, padded_size, "Padding vocabulary for sharding");
            let padded = param.pad_rows(padded_size)?;
            Ok(Some(Cow::Owned(split(&padded, shard, 0)?.into_owned())))
        }
        0 => Ok(Some(split(param, shard, 0)?)),
        1 => {
            if hidden_size % shard.world_size != 0 {
                return Err(Error::NotDivisible {
                    what: "embedding hidden size".into(),
                    dim: hidden_size,
                    parts: shard.world_size,
                });
            }
            Ok(Some(split(param, shard, 1)?))
        }
        other => Err(Error::InvalidShape(format!(
            "split_embedding: sharding_dim must be 0 or 1, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[allow(clippy::cast_precision_loss)]
    fn iota(shape: &[usize]) -> HostTensor {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
        HostTensor::from_f32(shape, &values)
    }

    fn shard(rank: usize, world_size: usize) -> ShardConfig {
        ShardConfig::new(rank, world_size).unwrap()
    }

    #[test]
    fn test_shard_range() {
        assert_eq!(shard(0, 4).shard_range(128).unwrap(), (0, 32));
        assert_eq!(shard(3, 4).shard_range(128).unwrap(), (96, 32));
    }

    #[test]
    fn test_shard_range_indivisible() {
        assert!(matches!(
            shard(0, 3).shard_range(128),
            Err(Error::NotDivisible {
                dim: 128,
                parts: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_shard_config_validation() {
        assert!(matches!(ShardConfig::new(0, 0), Err(Error::Config(_))));
        assert!(matches!(ShardConfig::new(2, 2), Err(Error::Config(_))));
        assert!(ShardConfig::single().is_single());
        assert!(!shard(1, 2).is_single());
    }

    #[test]
    fn test_strategy_axes() {
        assert_eq!(ShardStrategy::Replicate.axis(), None);
        assert_eq!(ShardStrategy::Column.axis(), Some(0));
        assert_eq!(ShardStrategy::Row.axis(), Some(1));
    }

    #[test]
    fn test_split_single_rank_borrows() {
        let t = iota(&[4, 6]);
        for axis in 0..2 {
            let s = split(&t, &ShardConfig::single(), axis).unwrap();
            assert!(matches!(s, Cow::Borrowed(_)));
            assert_eq!(*s, t);
        }
    }

    #[test]
    fn test_split_columns_reconstructs_matrix() {
        // 8x8 dense projection with distinct entries, two ranks along axis 1
        let t = iota(&[8, 8]);
        let left = split(&t, &shard(0, 2), 1).unwrap();
        let right = split(&t, &shard(1, 2), 1).unwrap();
        assert_eq!(left.shape, vec![8, 4]);
        assert_eq!(right.shape, vec![8, 4]);
        assert!(matches!(left, Cow::Owned(_)));
        let joined = HostTensor::concat(&[&left, &right], 1).unwrap();
        assert_eq!(joined, t);
    }

    #[test]
    fn test_split_rows() {
        let t = iota(&[4, 2]);
        let s = split(&t, &shard(1, 2), 0).unwrap();
        assert_eq!(s.to_f32_vec().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_split_1d_ignores_axis() {
        let t = iota(&[6]);
        let s = split(&t, &shard(2, 3), 1).unwrap();
        assert_eq!(s.to_f32_vec().unwrap(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_split_indivisible_is_config_error() {
        let t = iota(&[5, 2]);
        assert!(matches!(
            split(&t, &shard(0, 2), 0),
            Err(Error::NotDivisible { dim: 5, parts: 2, .. })
        ));
    }

    #[test]
    fn test_shard_tensor_replicate_borrows() {
        let t = iota(&[4, 4]);
        let s = shard_tensor(&t, &shard(1, 2), ShardStrategy::Replicate).unwrap();
        assert!(matches!(s, Cow::Borrowed(_)));
        let r = shard_tensor(&t, &shard(1, 2), ShardStrategy::Row).unwrap();
        assert_eq!(r.shape, vec![4, 2]);
    }

    #[test]
    fn test_pad_vocab_size() {
        assert_eq!(pad_vocab_size(30000, 8), 30000);
        assert_eq!(pad_vocab_size(30001, 8), 30008);
        assert_eq!(pad_vocab_size(7, 1), 7);
        assert_eq!(pad_vocab_size(5, 0), 5);
        assert_eq!(pad_vocab_size(0, 4), 0);
    }

    #[test]
    fn test_split_embedding_absent() {
        assert!(split_embedding(None, &shard(0, 2), true, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_split_embedding_replicated_when_disabled() {
        let t = iota(&[6, 4]);
        let s = split_embedding(Some(&t), &shard(1, 4), false, 0)
            .unwrap()
            .unwrap();
        assert!(matches!(s, Cow::Borrowed(_)));
        assert_eq!(*s, t);
    }

    #[test]
    fn test_split_embedding_divisible_matches_plain_split() {
        let t = iota(&[16, 4]);
        for rank in 0..8 {
            let cfg = shard(rank, 8);
            let a = split_embedding(Some(&t), &cfg, true, 0).unwrap().unwrap();
            let b = split(&t, &cfg, 0).unwrap();
            assert_eq!(*a, *b);
        }
    }

    #[test]
    fn test_split_embedding_pads_vocab() {
        let vocab = 30001;
        let hidden = 2;
        let t = HostTensor::from_f32(&[vocab, hidden], &vec![1.0; vocab * hidden]);
        let mut total_rows = 0;
        for rank in 0..8 {
            let s = split_embedding(Some(&t), &shard(rank, 8), true, 0)
                .unwrap()
                .unwrap();
            assert_eq!(s.shape, vec![3751, hidden]);
            total_rows += s.shape[0];
            if rank == 7 {
                let values = s.to_f32_vec().unwrap();
                // last 7 rows are padding
                let pad_start = (3751 - 7) * hidden;
                assert!(values[pad_start..].iter().all(|&v| v == 0.0));
                assert!(values[..pad_start].iter().all(|&v| v == 1.0));
            }
        }
        assert_eq!(total_rows, 30008);
    }

    #[test]
    fn test_split_embedding_hidden_axis() {
        let t = iota(&[5, 4]);
        let s = split_embedding(Some(&t), &shard(1, 2), true, 1)
            .unwrap()
            .unwrap();
        assert_eq!(s.shape, vec![5, 2]);

        let odd = iota(&[4, 3]);
        assert!(matches!(
            split_embedding(Some(&odd), &shard(0, 2), true, 1),
            Err(Error::NotDivisible { dim: 3, .. })
        ));
    }

    #[test]
    fn test_split_embedding_rejects_bad_input() {
        let t = iota(&[8]);
        assert!(matches!(
            split_embedding(Some(&t), &shard(0, 2), true, 0),
            Err(Error::InvalidShape(_))
        ));
        let t = HostTensor::zeros(&[4, 4], DType::BF16);
        assert!(matches!(
            split_embedding(Some(&t), &shard(0, 2), true, 2),
            Err(Error::InvalidShape(_))
        ));
    }
}
