//! Bias + GELU operator.

use std::marker::PhantomData;

use dsk_core::{DskError, FloatElement, Result, Tensor};
use dsk_kernels::gelu::{launch_bias_gelu, launch_d_gelu};
use dsk_kernels::{Context, Stream};

use crate::check::{check_dtype, check_input, check_same_shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeluConfig {
    pub intermediate_size: usize,
}

#[derive(Debug, Clone)]
pub struct Gelu<T: FloatElement> {
    config: GeluConfig,
    _marker: PhantomData<T>,
}

impl<T: FloatElement> Gelu<T> {
    pub fn new(config: GeluConfig) -> Self {
        Self {
            config,
            _marker: PhantomData,
        }
    }

    pub fn forward(&self, stream: &Stream, bsz: usize, input: &[T], bias: &[T], output: &mut [T]) -> Result<()> {
        launch_bias_gelu(stream, input, bias, output, self.config.intermediate_size, bsz)
    }

    /// In place `d_output *= gelu'(input + bias)`.
    pub fn backward(&self, stream: &Stream, bsz: usize, d_output: &mut [T], input: &[T], bias: &[T]) -> Result<()> {
        launch_d_gelu(stream, d_output, input, bias, self.config.intermediate_size, bsz)
    }
}

/// Rows of `input` when its last dimension matches the bias width.
fn rows_for(input: &Tensor, bias: &Tensor) -> Result<(usize, usize)> {
    let width = bias.numel();
    if input.shape().last_dim() != width || width == 0 {
        return Err(DskError::ShapeMismatch {
            expected: vec![input.shape().leading_rows(), width],
            got: input.dims().to_vec(),
        });
    }
    Ok((input.shape().leading_rows(), width))
}

/// `gelu(input + bias)`, with `bias` broadcast over the last dimension.
pub fn bias_gelu_forward(ctx: &Context, input: &Tensor, bias: &Tensor) -> Result<Tensor> {
    ctx.ensure_healthy()?;
    check_input(ctx, "input", input)?;
    check_input(ctx, "bias", bias)?;
    check_dtype(bias, input.dtype())?;
    let (rows, width) = rows_for(input, bias)?;
    tracing::debug!(dtype = %input.dtype(), rows, width, "bias_gelu_forward");

    let mut out = Tensor::zeros(input.dims(), input.dtype(), ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(input.dtype(), T => {
        Gelu::<T>::new(GeluConfig { intermediate_size: width }).forward(
            &stream,
            rows,
            input.as_slice::<T>()?,
            bias.as_slice::<T>()?,
            out.as_slice_mut::<T>()?,
        )
    });
    ctx.guard(result)?;
    Ok(out)
}

/// Backward of [`bias_gelu_forward`]; scales `d_output` in place and returns it.
pub fn bias_gelu_backward(ctx: &Context, mut d_output: Tensor, input: &Tensor, bias: &Tensor) -> Result<Tensor> {
    ctx.ensure_healthy()?;
    check_input(ctx, "d_output", &d_output)?;
    check_input(ctx, "input", input)?;
    check_input(ctx, "bias", bias)?;
    check_same_shape(&d_output, input)?;
    check_dtype(&d_output, input.dtype())?;
    check_dtype(bias, input.dtype())?;
    let (rows, width) = rows_for(input, bias)?;
    tracing::debug!(dtype = %input.dtype(), rows, width, "bias_gelu_backward");

    let stream = ctx.current_stream();
    let result = dispatch_float!(input.dtype(), T => {
        Gelu::<T>::new(GeluConfig { intermediate_size: width }).backward(
            &stream,
            rows,
            d_output.as_slice_mut::<T>()?,
            input.as_slice::<T>()?,
            bias.as_slice::<T>()?,
        )
    });
    ctx.guard(result)?;
    Ok(d_output)
}
