use std::sync::Arc;

use crate::{DType, Device, DskError, Element, Result};

/// Typed backing data for a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageData {
    F32(Vec<f32>),
    F16(Vec<half::f16>),
    BF16(Vec<half::bf16>),
    U8(Vec<u8>),
}

impl StorageData {
    fn dtype(&self) -> DType {
        match self {
            StorageData::F32(_) => DType::F32,
            StorageData::F16(_) => DType::F16,
            StorageData::BF16(_) => DType::BF16,
            StorageData::U8(_) => DType::U8,
        }
    }

    fn len(&self) -> usize {
        match self {
            StorageData::F32(v) => v.len(),
            StorageData::F16(v) => v.len(),
            StorageData::BF16(v) => v.len(),
            StorageData::U8(v) => v.len(),
        }
    }
}

/// Shared, reference-counted tensor storage.
///
/// Cloning a `Storage` shares the buffer; the first mutable access on a
/// shared buffer copies it (copy-on-write).
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<StorageData>,
    device: Device,
}

impl Storage {
    /// Allocate zeroed storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize, device: Device) -> Self {
        let data = match dtype {
            DType::F32 => StorageData::F32(vec![0.0; numel]),
            DType::F16 => StorageData::F16(vec![half::f16::ZERO; numel]),
            DType::BF16 => StorageData::BF16(vec![half::bf16::ZERO; numel]),
            DType::U8 => StorageData::U8(vec![0; numel]),
        };
        Self {
            data: Arc::new(data),
            device,
        }
    }

    /// Take ownership of a typed vector.
    pub fn from_vec<T: Element>(values: Vec<T>, device: Device) -> Self {
        Self {
            data: Arc::new(T::wrap(values)),
            device,
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Borrow as a typed slice.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        T::slice(&self.data).ok_or(DskError::DTypeMismatch {
            expected: T::DTYPE,
            got: self.dtype(),
        })
    }

    /// Borrow as a mutable typed slice (copy-on-write).
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let got = self.dtype();
        T::slice_mut(Arc::make_mut(&mut self.data)).ok_or(DskError::DTypeMismatch {
            expected: T::DTYPE,
            got,
        })
    }

    /// Whether two storages share the same buffer.
    pub fn shares_buffer(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Place the same data on another device.
    ///
    /// Accelerator queues execute against host-addressable memory, so a
    /// transfer is a buffer copy plus a placement change. No-op if already there.
    pub fn to_device(&self, device: Device) -> Self {
        if device == self.device {
            return self.clone();
        }
        Self {
            data: Arc::new((*self.data).clone()),
            device,
        }
    }

    pub fn data(&self) -> &StorageData {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::BF16, 6, Device::Cpu);
        assert_eq!(s.dtype(), DType::BF16);
        assert_eq!(s.numel(), 6);
        assert_eq!(s.as_slice::<half::bf16>().unwrap(), &[half::bf16::ZERO; 6]);
    }

    #[test]
    fn test_typed_access() {
        let s = Storage::from_vec(vec![1.0f32, 2.0, 3.0], Device::Cpu);
        assert_eq!(s.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
        assert!(matches!(
            s.as_slice::<u8>(),
            Err(DskError::DTypeMismatch { expected: DType::U8, got: DType::F32 })
        ));
    }

    #[test]
    fn test_copy_on_write() {
        let a = Storage::from_vec(vec![1u8, 2, 3], Device::Cpu);
        let mut b = a.clone();
        assert!(a.shares_buffer(&b));
        b.as_slice_mut::<u8>().unwrap()[0] = 9;
        assert!(!a.shares_buffer(&b));
        assert_eq!(a.as_slice::<u8>().unwrap()[0], 1);
        assert_eq!(b.as_slice::<u8>().unwrap()[0], 9);
    }

    #[test]
    fn test_to_device() {
        let s = Storage::from_vec(vec![1.0f32], Device::Cpu);
        let x = s.to_device(Device::Xpu(0));
        assert_eq!(x.device(), Device::Xpu(0));
        assert!(!x.shares_buffer(&s));
        assert!(s.to_device(Device::Cpu).shares_buffer(&s));
    }
}
