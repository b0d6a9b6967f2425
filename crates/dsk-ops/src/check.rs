//! Input validation shared by the operator entry points.

use dsk_core::{DType, DskError, Result, Tensor};
use dsk_kernels::{checked_elems, Context};

/// Reject a tensor that is not on the context's accelerator or not contiguous.
pub fn check_input(ctx: &Context, name: &str, t: &Tensor) -> Result<()> {
    if !t.device().is_accelerator() {
        return Err(DskError::Precondition(format!(
            "{name} is a host tensor; move it to {} first",
            ctx.device()
        )));
    }
    if t.device() != ctx.device() {
        return Err(DskError::Precondition(format!(
            "{name} must be on {} (found {})",
            ctx.device(),
            t.device()
        )));
    }
    if !t.is_contiguous() {
        return Err(DskError::Precondition(format!("{name} must be contiguous")));
    }
    Ok(())
}

pub(crate) fn check_dtype(t: &Tensor, expected: DType) -> Result<()> {
    if t.dtype() != expected {
        return Err(DskError::DTypeMismatch {
            expected,
            got: t.dtype(),
        });
    }
    Ok(())
}

pub(crate) fn check_numel(t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.numel() != checked_elems("check_numel", expected)? {
        return Err(DskError::ShapeMismatch {
            expected: expected.to_vec(),
            got: t.dims().to_vec(),
        });
    }
    Ok(())
}

pub(crate) fn check_same_shape(t: &Tensor, reference: &Tensor) -> Result<()> {
    if t.dims() != reference.dims() {
        return Err(DskError::ShapeMismatch {
            expected: reference.dims().to_vec(),
            got: t.dims().to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsk_core::Device;
    use dsk_kernels::ContextConfig;

    fn ctx() -> Context {
        Context::new(ContextConfig { num_threads: 1, ..Default::default() }).unwrap()
    }

    #[test]
    fn test_accepts_device_contiguous() {
        let t = Tensor::from_f32(&[1.0; 6], &[2, 3]).to(Device::Xpu(0));
        assert!(check_input(&ctx(), "vals", &t).is_ok());
    }

    #[test]
    fn test_rejects_host_tensor() {
        let t = Tensor::from_f32(&[1.0; 6], &[2, 3]);
        let err = check_input(&ctx(), "vals", &t).unwrap_err();
        assert_eq!(err.to_string(), "precondition failed: vals is a host tensor; move it to xpu:0 first");
    }

    #[test]
    fn test_rejects_other_accelerator() {
        let t = Tensor::from_f32(&[1.0; 6], &[2, 3]).to(Device::Xpu(1));
        assert!(matches!(check_input(&ctx(), "vals", &t), Err(DskError::Precondition(_))));
    }

    #[test]
    fn test_rejects_transposed_view() {
        let t = Tensor::from_f32(&[1.0; 6], &[2, 3]).to(Device::Xpu(0)).transpose().unwrap();
        let err = check_input(&ctx(), "input", &t).unwrap_err();
        assert!(err.to_string().contains("input must be contiguous"));
    }

    #[test]
    fn test_numel_and_dtype_checks() {
        let t = Tensor::zeros(&[4, 2], DType::F16, Device::Xpu(0));
        assert!(check_numel(&t, &[2, 4]).is_ok());
        assert!(check_numel(&t, &[3, 3]).is_err());
        assert!(check_dtype(&t, DType::F16).is_ok());
        assert!(matches!(
            check_dtype(&t, DType::F32),
            Err(DskError::DTypeMismatch { expected: DType::F32, got: DType::F16 })
        ));
    }
}
