//! Named parameter maps and their safetensors encoding.
//!
//! A [`ParamMap`] is ordered by key so that iteration, and therefore every
//! serialized output, is deterministic.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use safetensors::tensor::{SafeTensors, View};

use crate::dtype::DType;
use crate::tensor::HostTensor;
use crate::{Error, Result};

/// Parameter name to tensor, in key order.
pub type ParamMap = BTreeMap<String, HostTensor>;

impl View for &HostTensor {
    fn dtype(&self) -> safetensors::Dtype {
        self.dtype.to_safetensors()
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Merge `part` into `into`, refusing to overwrite an existing key.
///
/// # Errors
/// Returns `Config` naming the first duplicated key.
pub fn merge_disjoint(into: &mut ParamMap, part: ParamMap) -> Result<()> {
    for (name, tensor) in part {
        if into.contains_key(&name) {
            return Err(Error::Config(format!("duplicate parameter '{name}'")));
        }
        into.insert(name, tensor);
    }
    Ok(())
}

/// Encode a parameter map as a safetensors byte buffer.
///
/// # Errors
/// Returns `SafeTensors` if encoding fails.
pub fn to_safetensors_bytes(
    params: &ParamMap,
    metadata: Option<HashMap<String, String>>,
) -> Result<Vec<u8>> {
    Ok(safetensors::serialize(params.iter(), &metadata)?)
}

/// Decode a safetensors byte buffer into a parameter map.
///
/// # Errors
/// Returns `SafeTensors` if the buffer is malformed and `UnsupportedDtype`
/// for element types with no [`DType`] counterpart.
pub fn from_safetensors_bytes(bytes: &[u8]) -> Result<ParamMap> {
    let st = SafeTensors::deserialize(bytes)?;
    let mut params = ParamMap::new();
    for (name, view) in st.tensors() {
        let dtype = DType::from_safetensors(view.dtype()).ok_or_else(|| {
            Error::UnsupportedDtype(format!("{:?} for tensor '{name}'", view.dtype()))
        })?;
        let tensor = HostTensor::from_raw(view.shape(), dtype, view.data().to_vec())?;
        params.insert(name, tensor);
    }
    Ok(params)
}
