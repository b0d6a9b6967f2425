//! Dense (bias-free) linear layer on the column-major GEMM backend.
//!
//! Activations are row-major `[batch, input]`. Weights are row-major
//! `[output, input]`, which the column-major backend reads as an
//! `[input, output]` matrix, so no transposed copies are needed:
//!
//! * forward: `Y = gemm(T, N, m=output, n=batch, k=input, W, X)`
//! * weight grad: `dW = gemm(N, T, m=input, n=output, k=batch, X, dY)`
//! * input grad: `dX = gemm(N, N, m=input, n=batch, k=output, W, dY)`
//! * bias grad: column sum of `dY`

use std::marker::PhantomData;

use dsk_core::{DskError, FloatElement, Result, Tensor};
use dsk_kernels::blas::{gemm_ex, GemmAlgo, Transpose};
use dsk_kernels::reduce::launch_fuse_transpose_bias_kernel;
use dsk_kernels::{checked_elems, Context, Stream};

use crate::check::{check_dtype, check_input, check_numel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub batch_size: usize,
    pub output_size: usize,
    pub input_size: usize,
    /// `[forward, weight grad, input grad]`.
    pub gemm_algos: [GemmAlgo; 3],
}

impl FeedForwardConfig {
    pub fn new(batch_size: usize, output_size: usize, input_size: usize) -> Self {
        Self {
            batch_size,
            output_size,
            input_size,
            gemm_algos: [GemmAlgo::Default; 3],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedForward<T: FloatElement> {
    config: FeedForwardConfig,
    _marker: PhantomData<T>,
}

impl<T: FloatElement> FeedForward<T> {
    pub fn new(config: FeedForwardConfig) -> Self {
        Self {
            config,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// `out[b, o] = sum_i input[b, i] * weights[o, i]`.
    #[track_caller]
    pub fn forward(&self, stream: &Stream, bsz: usize, input: &[T], weights: &[T], out: &mut [T]) -> Result<()> {
        let c = &self.config;
        gemm_ex(
            stream,
            Transpose::Trans,
            Transpose::NoTrans,
            c.output_size,
            bsz,
            c.input_size,
            1.0,
            0.0,
            weights,
            input,
            out,
            c.gemm_algos[0],
        )
    }

    /// Gradients of weights, bias and input from `out_grad`.
    #[allow(clippy::too_many_arguments)]
    #[track_caller]
    pub fn backward(
        &self,
        stream: &Stream,
        bsz: usize,
        out_grad: &[T],
        input: &[T],
        weights: &[T],
        weights_grad: &mut [T],
        bias_grad: &mut [T],
        inp_grad_out: &mut [T],
    ) -> Result<()> {
        let c = &self.config;
        gemm_ex(
            stream,
            Transpose::NoTrans,
            Transpose::Trans,
            c.input_size,
            c.output_size,
            bsz,
            1.0,
            0.0,
            input,
            out_grad,
            weights_grad,
            c.gemm_algos[1],
        )?;
        gemm_ex(
            stream,
            Transpose::NoTrans,
            Transpose::NoTrans,
            c.input_size,
            bsz,
            c.output_size,
            1.0,
            0.0,
            weights,
            out_grad,
            inp_grad_out,
            c.gemm_algos[2],
        )?;
        launch_fuse_transpose_bias_kernel(stream, out_grad, bias_grad, bsz, c.output_size)
    }
}

/// Output width implied by `[output, hidden]` weights.
fn output_size(weights: &Tensor, hidden: usize) -> Result<usize> {
    match weights.dims() {
        [out, h] if *h == hidden => Ok(*out),
        dims => Err(DskError::ShapeMismatch {
            expected: vec![dims.first().copied().unwrap_or(0), hidden],
            got: dims.to_vec(),
        }),
    }
}

/// Linear forward for `[bsz, seq_len, hidden]` input and `[output, hidden]`
/// weights. Returns `[bsz, seq_len, output]`.
pub fn feedforward_forward(
    ctx: &Context,
    bsz: usize,
    seq_len: usize,
    hidden: usize,
    input: &Tensor,
    weights: &Tensor,
) -> Result<Tensor> {
    ctx.ensure_healthy()?;
    check_input(ctx, "input", input)?;
    check_input(ctx, "weights", weights)?;
    check_numel(input, &[bsz, seq_len, hidden])?;
    check_dtype(weights, input.dtype())?;
    let out_size = output_size(weights, hidden)?;
    let tokens = checked_elems("feedforward", &[bsz, seq_len])?;
    tracing::debug!(dtype = %input.dtype(), tokens, hidden, out_size, "feedforward_forward");

    let mut out = Tensor::zeros(&[bsz, seq_len, out_size], input.dtype(), ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(input.dtype(), T => {
        FeedForward::<T>::new(FeedForwardConfig::new(tokens, out_size, hidden)).forward(
            &stream,
            tokens,
            input.as_slice::<T>()?,
            weights.as_slice::<T>()?,
            out.as_slice_mut::<T>()?,
        )
    });
    ctx.guard(result)?;
    Ok(out)
}

/// Linear backward. Returns `(grad_input, grad_weights, grad_bias)` shaped
/// like `input`, `weights` and `[output]`.
pub fn feedforward_backward(
    ctx: &Context,
    bsz: usize,
    seq_len: usize,
    hidden: usize,
    grad_out: &Tensor,
    input: &Tensor,
    weights: &Tensor,
) -> Result<(Tensor, Tensor, Tensor)> {
    ctx.ensure_healthy()?;
    check_input(ctx, "grad_out", grad_out)?;
    check_input(ctx, "input", input)?;
    check_input(ctx, "weights", weights)?;
    check_numel(input, &[bsz, seq_len, hidden])?;
    check_dtype(weights, input.dtype())?;
    check_dtype(grad_out, input.dtype())?;
    let out_size = output_size(weights, hidden)?;
    let tokens = checked_elems("feedforward", &[bsz, seq_len])?;
    check_numel(grad_out, &[bsz, seq_len, out_size])?;
    tracing::debug!(dtype = %input.dtype(), tokens, hidden, out_size, "feedforward_backward");

    let dtype = input.dtype();
    let mut grad_input = Tensor::zeros(input.dims(), dtype, ctx.device());
    let mut grad_weights = Tensor::zeros(weights.dims(), dtype, ctx.device());
    let mut grad_bias = Tensor::zeros(&[out_size], dtype, ctx.device());
    let stream = ctx.current_stream();
    let result = dispatch_float!(dtype, T => {
        FeedForward::<T>::new(FeedForwardConfig::new(tokens, out_size, hidden)).backward(
            &stream,
            tokens,
            grad_out.as_slice::<T>()?,
            input.as_slice::<T>()?,
            weights.as_slice::<T>()?,
            grad_weights.as_slice_mut::<T>()?,
            grad_bias.as_slice_mut::<T>()?,
            grad_input.as_slice_mut::<T>()?,
        )
    });
    ctx.guard(result)?;
    Ok((grad_input, grad_weights, grad_bias))
}
