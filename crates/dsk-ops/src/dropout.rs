//! Dropout operator and its tensor entry points.

use std::marker::PhantomData;

use dsk_core::{DType, FloatElement, Result, Tensor};
use dsk_kernels::dropout::{
    launch_dropout, launch_dropout_bias, launch_dropout_bias_residual, launch_dropout_grad,
    launch_dropout_grad_out,
};
use dsk_kernels::{checked_elems, Context, Stream};

use crate::check::{check_dtype, check_input, check_numel, check_same_shape};

/// Dropout parameters for one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutConfig {
    /// Drop probability in `[0, 1)`.
    pub ratio: f32,
    /// Feature dimension (row width).
    pub dim: usize,
    pub training: bool,
}

impl DropoutConfig {
    pub fn new(ratio: f32, dim: usize) -> Self {
        Self {
            ratio,
            dim,
            training: true,
        }
    }

    /// Effective drop probability: 0 outside training.
    pub fn ratio(&self) -> f32 {
        if self.training {
            self.ratio
        } else {
            0.0
        }
    }
}

/// Typed dropout over `[bsz, dim]` buffers.
///
/// Outside training every forward variant runs with ratio 0: the data
/// passes through unscaled, the mask is all ones and a counter range is
/// still reserved.
#[derive(Debug, Clone)]
pub struct Dropout<T: FloatElement> {
    config: DropoutConfig,
    _marker: PhantomData<T>,
}

impl<T: FloatElement> Dropout<T> {
    pub fn new(config: DropoutConfig) -> Self {
        Self {
            config,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &DropoutConfig {
        &self.config
    }

    pub fn set_training(&mut self, training: bool) {
        self.config.training = training;
    }

    pub fn set_dimension(&mut self, dim: usize) {
        self.config.dim = dim;
    }

    /// `out = dropout(vals)`.
    pub fn forward(
        &self,
        ctx: &Context,
        stream: &Stream,
        bsz: usize,
        out: &mut [T],
        vals: &[T],
        mask: &mut [u8],
    ) -> Result<()> {
        let dim = self.config.dim;
        let total = checked_elems("dropout", &[bsz, dim])?;
        launch_dropout(ctx, stream, out, vals, mask, total, dim, self.config.ratio())
    }

    /// In place `vals = dropout(vals + bias)`.
    pub fn forward_with_bias(
        &self,
        ctx: &Context,
        stream: &Stream,
        bsz: usize,
        vals: &mut [T],
        bias: &[T],
        mask: &mut [u8],
    ) -> Result<()> {
        launch_dropout_bias(ctx, stream, vals, bias, mask, bsz, self.config.dim, self.config.ratio())
    }

    /// `out = residual + dropout(vals + bias)`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_with_bias_residual(
        &self,
        ctx: &Context,
        stream: &Stream,
        bsz: usize,
        out: &mut [T],
        vals: &[T],
        residual: &[T],
        bias: &[T],
        mask: &mut [u8],
    ) -> Result<()> {
        launch_dropout_bias_residual(
            ctx,
            stream,
            out,
            vals,
            residual,
            bias,
            mask,
            bsz,
            self.config.dim,
            self.config.ratio(),
        )
    }

    /// In place `d_vals *= scale * mask`.
    pub fn backward(&self, stream: &Stream, bsz: usize, d_vals: &mut [T], mask: &[u8]) -> Result<()> {
        let total = checked_elems("dropout_grad", &[bsz, self.config.dim])?;
        launch_dropout_grad(stream, d_vals, mask, total, self.config.ratio())
    }

    /// `d_vals_out = d_vals * scale * mask`.
    pub fn backward_out(
        &self,
        stream: &Stream,
        bsz: usize,
        d_vals_out: &mut [T],
        d_vals: &[T],
        mask: &[u8],
    ) -> Result<()> {
        let total = checked_elems("dropout_grad_out", &[bsz, self.config.dim])?;
        launch_dropout_grad_out(stream, d_vals_out, d_vals, mask, total, self.config.ratio())
    }
}

/// Dropout forward over `bsz x dim` elements of `vals`.
///
/// Returns the output (shaped like `vals`) and a `U8` mask of shape `[bsz, dim]`.
pub fn dropout_forward(
    ctx: &Context,
    ratio: f32,
    dim: usize,
    bsz: usize,
    vals: &Tensor,
) -> Result<(Tensor, Tensor)> {
    ctx.ensure_healthy()?;
    check_input(ctx, "vals", vals)?;
    check_numel(vals, &[bsz, dim])?;
    tracing::debug!(dtype = %vals.dtype(), bsz, dim, ratio, "dropout_forward");

    let mut out = Tensor::zeros(vals.dims(), vals.dtype(), ctx.device());
    let mut mask = Tensor::zeros(&[bsz, dim], DType::U8, ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(vals.dtype(), T => {
        Dropout::<T>::new(DropoutConfig::new(ratio, dim)).forward(
            ctx,
            &stream,
            bsz,
            out.as_slice_mut::<T>()?,
            vals.as_slice::<T>()?,
            mask.as_slice_mut::<u8>()?,
        )
    });
    ctx.guard(result)?;
    Ok((out, mask))
}

/// `residual + dropout(vals + bias)`; `bias` has `dim` elements.
pub fn dropout_forward_with_bias(
    ctx: &Context,
    ratio: f32,
    dim: usize,
    bsz: usize,
    vals: &Tensor,
    bias: &Tensor,
    residual: &Tensor,
) -> Result<(Tensor, Tensor)> {
    ctx.ensure_healthy()?;
    check_input(ctx, "vals", vals)?;
    check_input(ctx, "bias", bias)?;
    check_input(ctx, "residual", residual)?;
    check_numel(vals, &[bsz, dim])?;
    check_numel(bias, &[dim])?;
    check_same_shape(residual, vals)?;
    check_dtype(bias, vals.dtype())?;
    check_dtype(residual, vals.dtype())?;
    tracing::debug!(dtype = %vals.dtype(), bsz, dim, ratio, "dropout_forward_with_bias");

    let mut out = Tensor::zeros(vals.dims(), vals.dtype(), ctx.device());
    let mut mask = Tensor::zeros(&[bsz, dim], DType::U8, ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(vals.dtype(), T => {
        Dropout::<T>::new(DropoutConfig::new(ratio, dim)).forward_with_bias_residual(
            ctx,
            &stream,
            bsz,
            out.as_slice_mut::<T>()?,
            vals.as_slice::<T>()?,
            residual.as_slice::<T>()?,
            bias.as_slice::<T>()?,
            mask.as_slice_mut::<u8>()?,
        )
    });
    ctx.guard(result)?;
    Ok((out, mask))
}

/// Dropout backward: `vals * scale * mask`.
///
/// With `in_place` the gradient is written into `vals`' buffer and `vals`
/// is returned; the buffer is copied first if another tensor still shares
/// it. Otherwise a fresh tensor is allocated and `vals` is left untouched.
pub fn dropout_backward(
    ctx: &Context,
    ratio: f32,
    dim: usize,
    bsz: usize,
    mut vals: Tensor,
    mask: &Tensor,
    in_place: bool,
) -> Result<Tensor> {
    ctx.ensure_healthy()?;
    check_input(ctx, "vals", &vals)?;
    check_input(ctx, "mask", mask)?;
    check_numel(&vals, &[bsz, dim])?;
    check_numel(mask, &[bsz, dim])?;
    check_dtype(mask, DType::U8)?;
    tracing::debug!(dtype = %vals.dtype(), bsz, dim, ratio, in_place, "dropout_backward");

    let stream = ctx.current_stream();
    let op = DropoutConfig::new(ratio, dim);
    if in_place {
        let result = dispatch_float!(vals.dtype(), T => {
            Dropout::<T>::new(op).backward(&stream, bsz, vals.as_slice_mut::<T>()?, mask.as_slice::<u8>()?)
        });
        ctx.guard(result)?;
        return Ok(vals);
    }

    let mut out = Tensor::zeros(vals.dims(), vals.dtype(), ctx.device());
    let result = dispatch_float!(vals.dtype(), T => {
        Dropout::<T>::new(op).backward_out(
            &stream,
            bsz,
            out.as_slice_mut::<T>()?,
            vals.as_slice::<T>()?,
            mask.as_slice::<u8>()?,
        )
    });
    ctx.guard(result)?;
    Ok(out)
}
