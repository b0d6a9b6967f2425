use std::fmt;

use rand::Rng;
use smallvec::SmallVec;

use crate::{DType, Device, DskError, Element, Result, Shape, Storage};

/// A typed, shaped buffer handed to operators.
///
/// Operators never keep a tensor past the call that received it. They borrow
/// the contiguous data for one kernel submission and return freshly
/// allocated tensors.
///
/// # Examples
///
/// ```
/// use dsk_core::{Device, Tensor};
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).to(Device::Xpu(0));
/// assert_eq!(t.dims(), &[2, 2]);
/// assert!(t.is_contiguous());
/// assert!(!t.transpose().unwrap().is_contiguous());
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
}

impl Tensor {
    fn packed(storage: Storage, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Tensor { storage, shape, strides }
    }

    /// Wrap `data` as a row-major tensor on `device`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize], device: Device) -> Result<Self> {
        let shape = Shape::new(shape);
        if shape.checked_numel() != Some(data.len()) {
            return Err(DskError::StorageError(format!(
                "{} elements cannot fill shape {shape}",
                data.len()
            )));
        }
        Ok(Self::packed(Storage::from_vec(data, device), shape))
    }

    /// Host f32 tensor, for test inputs and CLI data.
    ///
    /// # Panics
    ///
    /// If `data.len()` is not the product of `shape`.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let shape = Shape::new(shape);
        assert_eq!(shape.numel(), data.len(), "{} values cannot fill shape {shape}", data.len());
        Self::packed(Storage::from_vec(data.to_vec(), Device::Cpu), shape)
    }

    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Self {
        let shape = Shape::new(shape);
        Self::packed(Storage::zeros(dtype, shape.numel(), device), shape)
    }

    /// Output buffer matching `like` in shape, dtype and placement.
    pub fn zeros_like(like: &Tensor) -> Self {
        Self::zeros(like.dims(), like.dtype(), like.device())
    }

    pub fn ones(shape: &[usize]) -> Self {
        let n = Shape::new(shape).numel();
        Self::from_f32(&vec![1.0; n], shape)
    }

    /// Host f32 tensor drawn uniformly from `[low, high)` with the caller's
    /// generator, so seeded runs reproduce their inputs.
    pub fn uniform<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], low: f32, high: f32) -> Self {
        let n = Shape::new(shape).numel();
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32(&data, shape)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Row-major with no gaps; the only layout kernels accept.
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.contiguous_strides()
    }

    /// Whether two tensors alias the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.shares_buffer(&other.storage)
    }

    fn require_packed(&self) -> Result<()> {
        if self.is_contiguous() {
            Ok(())
        } else {
            Err(DskError::Precondition(format!(
                "tensor {} with strides {:?} is not contiguous",
                self.shape, self.strides
            )))
        }
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.require_packed()?;
        self.storage.as_slice::<T>()
    }

    /// Mutable view; detaches from other holders of the buffer first.
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.require_packed()?;
        self.storage.as_slice_mut::<T>()
    }

    /// Buffer offsets of every element in logical row-major order.
    fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        let dims = self.shape.dims();
        let mut index: SmallVec<[usize; 4]> = SmallVec::from_elem(0, dims.len());
        (0..self.numel()).map(move |_| {
            let at: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                if index[axis] < dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
            at
        })
    }

    fn gather<T: Element>(&self) -> Vec<f32> {
        T::slice(self.storage.data())
            .map(|data| self.offsets().map(|o| data[o].to_f32()).collect())
            .unwrap_or_default()
    }

    /// Every element widened to f32, in logical order regardless of layout.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype() {
            DType::F32 => self.gather::<f32>(),
            DType::F16 => self.gather::<half::f16>(),
            DType::BF16 => self.gather::<half::bf16>(),
            DType::U8 => self.gather::<u8>(),
        }
    }

    /// Packed copy in `dtype`, rounding once from f32.
    pub fn cast(&self, dtype: DType) -> Tensor {
        fn narrow<T: Element>(values: Vec<f32>, device: Device) -> Storage {
            Storage::from_vec(values.into_iter().map(T::from_f32).collect::<Vec<T>>(), device)
        }
        let values = self.to_f32_vec();
        let device = self.device();
        let storage = match dtype {
            DType::F32 => Storage::from_vec(values, device),
            DType::F16 => narrow::<half::f16>(values, device),
            DType::BF16 => narrow::<half::bf16>(values, device),
            DType::U8 => narrow::<u8>(values, device),
        };
        Self::packed(storage, self.shape.clone())
    }

    /// Zero-copy view with the two innermost axes swapped.
    pub fn transpose(&self) -> Result<Tensor> {
        let shape = self.shape.transpose().ok_or_else(|| {
            DskError::Precondition(format!("cannot transpose rank-{} tensor", self.ndim()))
        })?;
        let mut strides = self.strides.clone();
        let n = strides.len();
        strides.swap(n - 2, n - 1);
        Ok(Tensor { storage: self.storage.clone(), shape, strides })
    }

    /// `self` if already packed, otherwise a packed copy.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            self.clone()
        } else {
            self.cast(self.dtype())
        }
    }

    /// Tensor placed on `device`. Shares the buffer when nothing moves.
    pub fn to(&self, device: Device) -> Tensor {
        if self.device() == device {
            return self.clone();
        }
        let packed = self.contiguous();
        Self::packed(packed.storage.to_device(device), packed.shape)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({} {} on {}", self.shape, self.dtype(), self.device())?;
        if !self.is_contiguous() {
            write!(f, ", strides {:?}", self.strides.as_slice())?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn mask_buffer_from_vec() {
        assert!(Tensor::from_vec(vec![1.0f32; 5], &[2, 3], Device::Cpu).is_err());
        assert!(Tensor::from_vec(vec![0u8; 4], &[usize::MAX, 2, 2], Device::Cpu).is_err());
        let mask = Tensor::from_vec(vec![1u8; 6], &[2, 3], Device::Xpu(0)).unwrap();
        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(mask.device(), Device::Xpu(0));
        assert_eq!(mask.to_f32_vec(), vec![1.0; 6]);
    }

    #[test]
    fn weight_transpose_is_a_view() {
        let w = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let wt = w.transpose().unwrap();
        assert_eq!(wt.dims(), &[3, 2]);
        assert_eq!(wt.strides(), &[1, 3]);
        assert!(wt.shares_storage(&w));
        assert!(wt.as_slice::<f32>().is_err());
        assert_eq!(wt.to_f32_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let packed = wt.contiguous();
        assert!(packed.is_contiguous());
        assert_eq!(packed.as_slice::<f32>().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(Tensor::ones(&[4]).transpose().is_err());
    }

    #[test]
    fn batched_transpose_walks_logical_order() {
        let t = Tensor::from_f32(&(0..12).map(|v| v as f32).collect::<Vec<_>>(), &[2, 2, 3]);
        let v = t.transpose().unwrap().to_f32_vec();
        assert_eq!(v, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0, 6.0, 9.0, 7.0, 10.0, 8.0, 11.0]);
    }

    #[test]
    fn bf16_cast_keeps_representable_values() {
        let t = Tensor::from_f32(&[0.5, -1.0, 2.0, 8.0], &[4]);
        let h = t.cast(DType::BF16);
        assert_eq!(h.dtype(), DType::BF16);
        assert_eq!(h.to_f32_vec(), vec![0.5, -1.0, 2.0, 8.0]);
    }

    #[test]
    fn upload_copies_once() {
        let host = Tensor::ones(&[2, 2]);
        let dev = host.to(Device::Xpu(0));
        assert_eq!(dev.device(), Device::Xpu(0));
        assert!(!dev.shares_storage(&host));
        assert!(dev.to(Device::Xpu(0)).shares_storage(&dev));
    }

    #[test]
    fn writes_do_not_leak_into_clones() {
        let a = Tensor::ones(&[4]);
        let mut b = a.clone();
        b.as_slice_mut::<f32>().unwrap()[0] = 3.0;
        assert_eq!(a.as_slice::<f32>().unwrap()[0], 1.0);
        assert_eq!(b.as_slice::<f32>().unwrap()[0], 3.0);
    }

    #[test]
    fn seeded_uniform_reproduces() {
        let a = Tensor::uniform(&mut StdRng::seed_from_u64(7), &[3, 5], -1.0, 1.0);
        let b = Tensor::uniform(&mut StdRng::seed_from_u64(7), &[3, 5], -1.0, 1.0);
        assert_eq!(a.to_f32_vec(), b.to_f32_vec());
        assert!(a.to_f32_vec().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn debug_names_layout() {
        let t = Tensor::zeros(&[2, 3], DType::F16, Device::Xpu(1));
        assert_eq!(format!("{t:?}"), "Tensor([2, 3] f16 on xpu:1)");
    }
}
