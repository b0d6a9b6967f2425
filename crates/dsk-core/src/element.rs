//! Numeric representation abstraction.
//!
//! Kernels are written once against `FloatElement` instead of being stamped
//! out per dtype. Narrow formats are widened to f32 with `to_f32` before any
//! arithmetic and narrowed back with `from_f32` (round-to-nearest-even) on
//! the final write.

use std::fmt;

use half::{bf16, f16};

use crate::dtype::DType;
use crate::storage::StorageData;

/// A scalar type that can live in a tensor buffer.
pub trait Element: Copy + Send + Sync + Default + PartialEq + fmt::Debug + 'static {
    /// Runtime tag for this type.
    const DTYPE: DType;

    /// Widen to the f32 accumulator type.
    fn to_f32(self) -> f32;

    /// Narrow from an f32 accumulator.
    fn from_f32(v: f32) -> Self;

    /// Borrow typed data out of a storage buffer, if the dtype matches.
    fn slice(data: &StorageData) -> Option<&[Self]>;

    /// Mutably borrow typed data out of a storage buffer, if the dtype matches.
    fn slice_mut(data: &mut StorageData) -> Option<&mut [Self]>;

    /// Wrap an owned vector as storage data.
    fn wrap(values: Vec<Self>) -> StorageData;
}

/// Floating-point element types the kernels are generic over.
pub trait FloatElement: Element {}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $dtype:expr, |$w:ident| $widen:expr, |$n:ident| $narrow:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            #[inline(always)]
            fn to_f32(self) -> f32 {
                let $w = self;
                $widen
            }

            #[inline(always)]
            fn from_f32(v: f32) -> Self {
                let $n = v;
                $narrow
            }

            fn slice(data: &StorageData) -> Option<&[Self]> {
                match data {
                    StorageData::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut StorageData) -> Option<&mut [Self]> {
                match data {
                    StorageData::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> StorageData {
                StorageData::$variant(values)
            }
        }
    };
}

impl_element!(f32, F32, DType::F32, |x| x, |v| v);
impl_element!(f16, F16, DType::F16, |x| x.to_f32(), |v| f16::from_f32(v));
impl_element!(bf16, BF16, DType::BF16, |x| x.to_f32(), |v| bf16::from_f32(v));
impl_element!(u8, U8, DType::U8, |x| x as f32, |v| v as u8);

impl FloatElement for f32 {}
impl FloatElement for f16 {}
impl FloatElement for bf16 {}
