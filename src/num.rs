use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of a tensor buffer referenced by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    U8,
    U16,
    U32,
    PackedU4x8,
    PackedU8x4,
    PackedF32x4,
    PackedF16x4,
}

impl DataType {
    /// Byte size of one element. Packed types count as a single element.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => size_of::<f32>(),
            DataType::F16 => size_of::<f16>(),
            DataType::U8 => size_of::<u8>(),
            DataType::U16 => size_of::<u16>(),
            DataType::U32 => size_of::<u32>(),
            DataType::PackedU4x8 => size_of::<PackedU4x8>(),
            DataType::PackedU8x4 => size_of::<PackedU8x4>(),
            DataType::PackedF32x4 => size_of::<PackedF32x4>(),
            DataType::PackedF16x4 => size_of::<PackedF16x4>(),
        }
    }
}

/// Eight 4-bit integers in one word.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PackedU4x8(pub u32);

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PackedU8x4(pub u32);

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PackedF32x4(pub [f32; 4]);

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PackedF16x4(pub [f16; 4]);

/// Element types that may back a tensor in the [`TensorTable`](crate::tensor::TensorTable).
pub trait Scalar: Sized + Copy + Send + Sync {
    const DATA_TYPE: DataType;
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:ident) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = DataType::$data_type;
        }
    };
}

impl_scalar!(f32, F32);
impl_scalar!(f16, F16);
impl_scalar!(u8, U8);
impl_scalar!(u16, U16);
impl_scalar!(u32, U32);
impl_scalar!(PackedU4x8, PackedU4x8);
impl_scalar!(PackedU8x4, PackedU8x4);
impl_scalar!(PackedF32x4, PackedF32x4);
impl_scalar!(PackedF16x4, PackedF16x4);

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{DataType, PackedF16x4, PackedU4x8, Scalar};

    #[test]
    fn test_packed_size() {
        assert_eq!(DataType::PackedF16x4.size(), 4 * size_of::<f16>());
        assert_eq!(DataType::PackedU4x8.size(), size_of::<u32>());
        assert_eq!(<PackedF16x4 as Scalar>::DATA_TYPE, DataType::PackedF16x4);
        assert_eq!(<PackedU4x8 as Scalar>::DATA_TYPE.size(), 4);
    }
}
