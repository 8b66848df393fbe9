//! Host-side tensor buffers and layout operations.
//!
//! [`HostTensor`] holds raw, densely packed, row-major little-endian bytes.
//! Every operation here works on whole elements by byte size, so reshaping,
//! slicing and concatenation are dtype-agnostic. Only [`HostTensor::cast`]
//! and [`HostTensor::to_f32_vec`] interpret the element encoding.

use crate::dtype::DType;
use crate::{Error, Result};

/// Raw tensor data on the host.
///
/// The `data` field holds `numel * dtype.size_in_bytes()` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Logical shape (e.g., `[out_features, in_features]` for a 2D weight).
    pub shape: Vec<usize>,
    /// Element dtype.
    pub dtype: DType,
    /// Raw bytes in `dtype` encoding.
    pub data: Vec<u8>,
}

impl HostTensor {
    /// Wrap raw bytes, checking the byte count against the shape.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `data.len()` does not match `shape` and `dtype`.
    pub fn from_raw(shape: &[usize], dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "{} bytes for shape {shape:?} ({dtype}), expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            data,
        })
    }

    /// Build an `F32` tensor from values.
    ///
    /// # Panics
    /// Panics if `values.len()` does not match `shape`.
    #[must_use]
    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            values.len(),
            "from_f32: {} values for shape {shape:?}",
            values.len()
        );
        Self {
            shape: shape.to_vec(),
            dtype: DType::F32,
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// A zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            dtype,
            data: vec![0u8; numel * dtype.size_in_bytes()],
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Decode a floating-point tensor into `f32` values.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for integer payloads.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DType::F32 => Ok(self
                .data
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect()),
            DType::F16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect()),
            DType::BF16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect()),
            other => Err(Error::UnsupportedDtype(format!(
                "to_f32_vec: {other} is not a float dtype"
            ))),
        }
    }

    /// Encode `f32` values into a float tensor of the given dtype.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for integer dtypes and `InvalidShape` on a
    /// count mismatch.
    pub fn from_f32_as(shape: &[usize], values: &[f32], dtype: DType) -> Result<Self> {
        let data: Vec<u8> = match dtype {
            DType::F32 => bytemuck::cast_slice(values).to_vec(),
            DType::F16 => values
                .iter()
                .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
                .collect(),
            DType::BF16 => values
                .iter()
                .flat_map(|&v| half::bf16::from_f32(v).to_le_bytes())
                .collect(),
            other => {
                return Err(Error::UnsupportedDtype(format!(
                    "from_f32_as: cannot encode floats as {other}"
                )))
            }
        };
        Self::from_raw(shape, dtype, data)
    }

    /// Cast a float tensor to another float dtype.
    ///
    /// A tensor that already has `dtype` is returned as-is. Integer
    /// payloads are produced by a quantizer, never by a cast.
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` if either side is not a float dtype.
    pub fn cast(self, dtype: DType) -> Result<Self> {
        if self.dtype == dtype {
            return Ok(self);
        }
        if self.dtype.is_quantized() || dtype.is_quantized() {
            return Err(Error::UnsupportedDtype(format!(
                "cast: {} -> {dtype} needs a quantizer",
                self.dtype
            )));
        }
        let values = self.to_f32_vec()?;
        Self::from_f32_as(&self.shape, &values, dtype)
    }

    /// Reinterpret the tensor with a new shape of the same element count.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the element counts differ.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        if shape.iter().product::<usize>() != self.numel() {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                got: shape.to_vec(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            ..self
        })
    }

    /// Copy out `len` entries of `axis` starting at `start`.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `axis` or the range is out of bounds.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        if axis >= self.rank() {
            return Err(Error::InvalidShape(format!(
                "narrow: axis {axis} out of range for shape {:?}",
                self.shape
            )));
        }
        let dim = self.shape[axis];
        if start + len > dim {
            return Err(Error::InvalidShape(format!(
                "narrow: range {start}..{} exceeds dimension {dim} of {:?}",
                start + len,
                self.shape
            )));
        }

        let (outer, inner) = self.strides_around(axis);
        let src_block = dim * inner;
        let dst_block = len * inner;
        let mut data = Vec::with_capacity(outer * dst_block);
        for o in 0..outer {
            let begin = o * src_block + start * inner;
            data.extend_from_slice(&self.data[begin..begin + dst_block]);
        }

        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    /// Concatenate tensors along `axis`.
    ///
    /// All parts must share dtype, rank and every dimension except `axis`.
    ///
    /// # Errors
    /// Returns an error on an empty input or mismatched parts.
    pub fn concat(parts: &[&Self], axis: usize) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidShape("concat: no tensors given".into()))?;
        if axis >= first.rank() {
            return Err(Error::InvalidShape(format!(
                "concat: axis {axis} out of range for shape {:?}",
                first.shape
            )));
        }
        for part in &parts[1..] {
            if part.dtype != first.dtype {
                return Err(Error::DtypeMismatch {
                    expected: first.dtype.to_string(),
                    got: part.dtype.to_string(),
                });
            }
            let same_outline = part.rank() == first.rank()
                && part
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !same_outline {
                return Err(Error::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: part.shape.clone(),
                });
            }
        }

        let (outer, _) = first.strides_around(axis);
        let blocks: Vec<usize> = parts
            .iter()
            .map(|p| p.shape[axis] * p.strides_around(axis).1)
            .collect();
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for o in 0..outer {
            for (part, &block) in parts.iter().zip(&blocks) {
                data.extend_from_slice(&part.data[o * block..(o + 1) * block]);
            }
        }

        let mut shape = first.shape.clone();
        shape[axis] = parts.iter().map(|p| p.shape[axis]).sum();
        Ok(Self {
            shape,
            dtype: first.dtype,
            data,
        })
    }

    /// Transpose a 2D tensor.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the tensor is not 2D.
    pub fn transpose_2d(&self) -> Result<Self> {
        let shape = &self.shape;
        if shape.len() != 2 {
            return Err(Error::InvalidShape(format!(
                "transpose_2d: expected 2D tensor, got {shape:?}"
            )));
        }
        let (rows, cols) = (shape[0], shape[1]);
        let elem = self.dtype.size_in_bytes();
        let mut out = vec![0u8; self.data.len()];

        for r in 0..rows {
            for c in 0..cols {
                let src = (r * cols + c) * elem;
                let dst = (c * rows + r) * elem;
                out[dst..dst + elem].copy_from_slice(&self.data[src..src + elem]);
            }
        }

        Ok(Self {
            shape: vec![cols, rows],
            dtype: self.dtype,
            data: out,
        })
    }

    /// Append zero entries along axis 0 until it has `rows` entries.
    ///
    /// # Errors
    /// Returns `InvalidShape` for a scalar tensor or if `rows` is smaller than
    /// the current leading dimension.
    pub fn pad_rows(&self, rows: usize) -> Result<Self> {
        let Some(&current) = self.shape.first() else {
            return Err(Error::InvalidShape("pad_rows: scalar tensor".into()));
        };
        if rows < current {
            return Err(Error::InvalidShape(format!(
                "pad_rows: cannot shrink {current} rows to {rows}"
            )));
        }
        let row_bytes = self.strides_around(0).1;
        let mut data = self.data.clone();
        data.resize(rows * row_bytes, 0);

        let mut shape = self.shape.clone();
        shape[0] = rows;
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    /// `(number of outer blocks, bytes per entry of axis)` around `axis`.
    fn strides_around(&self, axis: usize) -> (usize, usize) {
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        (outer, inner * self.dtype.size_in_bytes())
    }
}
