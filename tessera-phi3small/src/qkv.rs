//! Fused QKV reassembly and tensor-parallel splitting.
//!
//! Phi-3-small stores the fused projection grouped by key/value head: for
//! each kv group, `num_q_per_kv` query heads, then that group's key head,
//! then its value head. The engine expects all query heads, then all key
//! heads, then all value heads, so that each rank can take a contiguous
//! slice of each.

use tessera::{split, Error, HostTensor, Result, ShardConfig};

use crate::config::Phi3SmallConfig;

/// Head geometry of the fused QKV projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvLayout {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl QkvLayout {
    /// # Errors
    /// Returns `Config` if a count is zero or `num_heads` is not a multiple
    /// of `num_kv_heads`.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Result<Self> {
        let layout = Self {
            num_heads,
            num_kv_heads,
            head_dim,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// # Errors
    /// Returns `Config` if the head counts are inconsistent.
    pub fn from_config(config: &Phi3SmallConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.num_attention_heads,
            config.num_kv_heads(),
            config.head_dim(),
        )
    }

    fn validate(&self) -> Result<()> {
        let Self {
            num_heads,
            num_kv_heads,
            head_dim,
        } = *self;
        if num_heads == 0 || num_kv_heads == 0 || head_dim == 0 {
            return Err(Error::Config(format!(
                "qkv layout needs positive sizes (heads={num_heads}, kv_heads={num_kv_heads}, head_dim={head_dim})"
            )));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(Error::Config(format!(
                "{num_heads} query heads cannot be grouped over {num_kv_heads} kv heads"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn num_q_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Rows of the query block (`num_heads * head_dim`).
    #[must_use]
    pub const fn q_rows(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Rows of the key block, and of the value block.
    #[must_use]
    pub const fn kv_rows(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Leading dimension of the fused tensor.
    #[must_use]
    pub const fn total_rows(&self) -> usize {
        self.q_rows() + 2 * self.kv_rows()
    }

    fn check_rows(&self, tensor: &HostTensor) -> Result<usize> {
        self.validate()?;
        let rows = tensor.shape.first().copied().unwrap_or(0);
        if rows != self.total_rows() {
            let mut expected = tensor.shape.clone();
            match expected.first_mut() {
                Some(first) => *first = self.total_rows(),
                None => expected.push(self.total_rows()),
            }
            return Err(Error::ShapeMismatch {
                expected,
                got: tensor.shape.clone(),
            });
        }
        Ok(rows)
    }
}

/// Reorder the fused QKV rows from per-kv-group to `[Q..., K..., V...]`.
///
/// Works for a `[rows, in]` weight and a `[rows]` bias alike; the output has
/// the input's shape.
///
/// # Errors
/// Returns `Config` for an inconsistent `layout` and `ShapeMismatch` if the
/// leading dimension does not match it.
pub fn shuffle_qkv(tensor: &HostTensor, layout: &QkvLayout) -> Result<HostTensor> {
    let rows = layout.check_rows(tensor)?;
    let original_shape = tensor.shape.clone();
    let cols = tensor.numel() / rows.max(1);

    let kv = layout.num_kv_heads;
    let q_per_kv = layout.num_q_per_kv();
    let hd = layout.head_dim;

    let grouped = tensor.clone().reshape(&[kv, q_per_kv + 2, hd, cols])?;
    let q = grouped
        .narrow(1, 0, q_per_kv)?
        .reshape(&[kv * q_per_kv, hd, cols])?;
    let k = grouped.narrow(1, q_per_kv, 1)?.reshape(&[kv, hd, cols])?;
    let v = grouped.narrow(1, q_per_kv + 1, 1)?.reshape(&[kv, hd, cols])?;

    let shuffled = HostTensor::concat(&[&q, &k, &v], 0)?.reshape(&original_shape)?;
    if shuffled.shape != original_shape {
        return Err(Error::ShapeMismatch {
            expected: original_shape,
            got: shuffled.shape,
        });
    }
    Ok(shuffled)
}

/// Split a reassembled MHA projection, where Q, K and V have equal size.
///
/// # Errors
/// Returns `NotDivisible` if the hidden size does not split across ranks.
pub fn split_qkv_mha(tensor: HostTensor, shard: &ShardConfig) -> Result<HostTensor> {
    let mut shape = tensor.shape.clone();
    let Some(&rows) = shape.first() else {
        return Err(Error::InvalidShape("split_qkv: scalar tensor".into()));
    };
    if rows % 3 != 0 {
        return Err(Error::NotDivisible {
            what: "fused qkv rows".into(),
            dim: rows,
            parts: 3,
        });
    }
    let hidden = rows / 3;

    let mut grouped_shape = vec![3, hidden];
    grouped_shape.extend_from_slice(&shape[1..]);
    let grouped = tensor.reshape(&grouped_shape)?;
    let local = split(&grouped, shard, 1)?.into_owned();

    shape[0] = local.shape[0] * local.shape[1];
    local.reshape(&shape)
}

/// Split a reassembled GQA projection by slicing Q, K and V separately.
///
/// # Errors
/// Returns `NotDivisible` if a head block does not split across ranks.
pub fn split_qkv_gqa(
    tensor: &HostTensor,
    layout: &QkvLayout,
    shard: &ShardConfig,
) -> Result<HostTensor> {
    layout.check_rows(tensor)?;
    let q = tensor.narrow(0, 0, layout.q_rows())?;
    let k = tensor.narrow(0, layout.q_rows(), layout.kv_rows())?;
    let v = tensor.narrow(0, layout.q_rows() + layout.kv_rows(), layout.kv_rows())?;

    let q = split(&q, shard, 0)?;
    let k = split(&k, shard, 0)?;
    let v = split(&v, shard, 0)?;
    HostTensor::concat(&[&q, &k, &v], 0)
}

/// Take this rank's slice of a reassembled QKV weight or bias.
///
/// Each rank receives its own query heads followed by its own key and
/// value heads. A single-rank group gets the tensor back unchanged.
///
/// # Errors
/// Propagates shape and divisibility errors from the chosen path.
pub fn split_qkv(
    tensor: HostTensor,
    layout: &QkvLayout,
    shard: &ShardConfig,
) -> Result<HostTensor> {
    if shard.is_single() {
        return Ok(tensor);
    }
    layout.validate()?;
    if layout.num_heads == layout.num_kv_heads {
        split_qkv_mha(tensor, shard)
    } else {
        split_qkv_gqa(&tensor, layout, shard)
    }
}
