//! Fused residual-add and column-sum entry points.
//!
//! Inputs are viewed as `[rows, hidden]` with `hidden` the last dimension.

use dsk_core::{Result, Tensor};
use dsk_kernels::elementwise::{launch_fused_add2, launch_fused_add3, launch_fused_add4};
use dsk_kernels::reduce::launch_fuse_transpose_bias_kernel;
use dsk_kernels::Context;

use crate::check::{check_dtype, check_input, check_same_shape};

fn check_operands(ctx: &Context, inputs: &[&Tensor]) -> Result<()> {
    ctx.ensure_healthy()?;
    let names = ["a", "b", "c", "d"];
    for (name, t) in names.iter().zip(inputs) {
        check_input(ctx, name, t)?;
        check_same_shape(t, inputs[0])?;
        check_dtype(t, inputs[0].dtype())?;
    }
    Ok(())
}

/// `a + b`. The element count must be a multiple of 4.
pub fn fused_add2(ctx: &Context, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_operands(ctx, &[a, b])?;
    let (rows, hidden) = (a.shape().leading_rows(), a.shape().last_dim());
    tracing::debug!(dtype = %a.dtype(), rows, hidden, "fused_add2");

    let mut out = Tensor::zeros(a.dims(), a.dtype(), ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(a.dtype(), T => {
        launch_fused_add2(&stream, out.as_slice_mut::<T>()?, a.as_slice::<T>()?, b.as_slice::<T>()?, rows, 1, hidden)
    });
    ctx.guard(result)?;
    Ok(out)
}

/// `a + b + c`. The last dimension must be a multiple of 4.
pub fn fused_add3(ctx: &Context, a: &Tensor, b: &Tensor, c: &Tensor) -> Result<Tensor> {
    check_operands(ctx, &[a, b, c])?;
    let (rows, hidden) = (a.shape().leading_rows(), a.shape().last_dim());
    tracing::debug!(dtype = %a.dtype(), rows, hidden, "fused_add3");

    let mut out = Tensor::zeros(a.dims(), a.dtype(), ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(a.dtype(), T => {
        launch_fused_add3(
            &stream,
            out.as_slice_mut::<T>()?,
            a.as_slice::<T>()?,
            b.as_slice::<T>()?,
            c.as_slice::<T>()?,
            rows,
            1,
            hidden,
        )
    });
    ctx.guard(result)?;
    Ok(out)
}

/// `a + b + c + d`. The last dimension must be a multiple of 4.
pub fn fused_add4(ctx: &Context, a: &Tensor, b: &Tensor, c: &Tensor, d: &Tensor) -> Result<Tensor> {
    check_operands(ctx, &[a, b, c, d])?;
    let (rows, hidden) = (a.shape().leading_rows(), a.shape().last_dim());
    tracing::debug!(dtype = %a.dtype(), rows, hidden, "fused_add4");

    let mut out = Tensor::zeros(a.dims(), a.dtype(), ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(a.dtype(), T => {
        launch_fused_add4(
            &stream,
            out.as_slice_mut::<T>()?,
            a.as_slice::<T>()?,
            b.as_slice::<T>()?,
            c.as_slice::<T>()?,
            d.as_slice::<T>()?,
            rows,
            1,
            hidden,
        )
    });
    ctx.guard(result)?;
    Ok(out)
}

/// Sum over all leading dimensions: `[.., cols] -> [cols]`.
pub fn column_sum(ctx: &Context, inp: &Tensor) -> Result<Tensor> {
    ctx.ensure_healthy()?;
    check_input(ctx, "inp", inp)?;
    let (rows, cols) = (inp.shape().leading_rows(), inp.shape().last_dim());
    tracing::debug!(dtype = %inp.dtype(), rows, cols, "column_sum");

    let mut out = Tensor::zeros(&[cols], inp.dtype(), ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(inp.dtype(), T => {
        launch_fuse_transpose_bias_kernel(&stream, inp.as_slice::<T>()?, out.as_slice_mut::<T>()?, rows, cols)
    });
    ctx.guard(result)?;
    Ok(out)
}
