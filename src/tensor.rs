use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::num::{DataType, Scalar};

/// Position of a tensor in the [`TensorTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("%{_0}")]
pub struct TensorId(pub usize);

/// Metadata of a tensor buffer. The buffer itself lives in the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{name}: {}[{}]", r#type, shape.iter().format(", "))]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub r#type: DataType,
}

impl TensorInfo {
    #[inline]
    pub fn new(
        name: impl Into<String>,
        shape: impl IntoIterator<Item = usize>,
        r#type: DataType,
    ) -> Self {
        let name = name.into();
        let shape = shape.into_iter().collect();
        Self {
            name,
            shape,
            r#type,
        }
    }

    /// Number of (possibly packed) elements in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the tensor buffer in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.len() * self.r#type.size()
    }

    /// Two tensors may share one buffer if their sizes in bytes agree.
    #[inline]
    pub fn is_compatible(&self, other: &TensorInfo) -> bool {
        self.data_size() == other.data_size()
    }
}

/// The runtime's tensor table. Kernels refer to tensors by position.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deref)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorTable(Vec<TensorInfo>);

impl From<Vec<TensorInfo>> for TensorTable {
    #[inline]
    fn from(value: Vec<TensorInfo>) -> Self {
        Self(value)
    }
}

impl TensorTable {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tensor of element type `T` and returns its position.
    #[inline]
    pub fn push<T: Scalar>(
        &mut self,
        name: impl Into<String>,
        shape: impl IntoIterator<Item = usize>,
    ) -> TensorId {
        self.push_info(TensorInfo::new(name, shape, T::DATA_TYPE))
    }

    #[inline]
    pub fn push_info(&mut self, info: TensorInfo) -> TensorId {
        let id = TensorId(self.0.len());
        self.0.push(info);
        id
    }

    #[inline]
    pub fn info(&self, id: TensorId) -> Option<&TensorInfo> {
        self.0.get(id.0)
    }

    #[inline]
    pub fn contains(&self, id: TensorId) -> bool {
        id.0 < self.0.len()
    }

    /// Human-readable name of a tensor, falling back to its position.
    #[inline]
    pub fn name(&self, id: TensorId) -> String {
        match self.info(id) {
            Some(info) => info.name.clone(),
            None => id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{TensorId, TensorTable};
    use crate::num::{DataType, PackedF16x4};

    #[test]
    fn test_push() {
        let mut tensors = TensorTable::new();
        let x = tensors.push::<f32>("x", [4, 8]);
        let y = tensors.push::<f16>("y", [4, 8]);
        let z = tensors.push::<PackedF16x4>("z", [8]);

        assert_eq!(x, TensorId(0));
        assert_eq!(tensors.info(y).map(|info| info.r#type), Some(DataType::F16));
        assert_eq!(tensors[z.0].data_size(), 64);
        assert!(tensors[y.0].is_compatible(&tensors[z.0]));
        assert!(!tensors[x.0].is_compatible(&tensors[y.0]));

        assert!(!tensors.contains(TensorId(3)));
        assert_eq!(tensors.name(TensorId(3)), "%3");
        assert_eq!(tensors[x.0].to_string(), "x: F32[4, 8]");
    }
}
