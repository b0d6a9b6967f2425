//! Dropout kernels with counter-based random masks.
//!
//! Each work-item handles four consecutive elements. Element group `j` is
//! owned by global thread `j % threads` on grid-stride iteration
//! `j / threads`, and draws its four uniforms from
//! `Philox(seed, subsequence = thread, block = offset + iteration)`.
//! Every launch reserves its counter blocks from the [`Context`] up front,
//! so launches never share random numbers.
//!
//! `ratio` is the drop probability. An element is kept when its uniform is
//! greater than `ratio`, and kept values are scaled by `1 / (1 - ratio)`.
//! Masks hold one byte per element (0 or 1).

use dsk_core::{DskError, FloatElement, Result};
use rayon::prelude::*;

use crate::context::Context;
use crate::launch::{checked_elems, get_blocks, require_len, LaunchConfig, NUM_THREADS, VEC_WIDTH};
use crate::rng::Philox;
use crate::stream::Stream;

/// Launch shape and RNG reservation of one dropout kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropoutGeometry {
    pub cfg: LaunchConfig,
    /// Four-element groups covering the buffer.
    pub groups: usize,
    /// Philox counter blocks reserved per launch.
    pub counter_blocks: u64,
}

impl DropoutGeometry {
    pub fn new(total_count: usize, dim: usize) -> Self {
        let groups = total_count.div_ceil(VEC_WIDTH);
        let mut cfg = LaunchConfig {
            grid_dim: get_blocks(groups),
            block_dim: NUM_THREADS,
        };
        if dim > NUM_THREADS {
            cfg.block_dim /= 2;
            cfg.grid_dim *= 2;
        }
        let counter_blocks = groups.div_ceil(cfg.global_range()).max(1) as u64;
        Self {
            cfg,
            groups,
            counter_blocks,
        }
    }

    pub fn threads(&self) -> usize {
        self.cfg.global_range()
    }
}

fn check_ratio(kernel: &str, ratio: f32) -> Result<f32> {
    if !(0.0..1.0).contains(&ratio) {
        return Err(DskError::Precondition(format!(
            "{kernel}: dropout ratio {ratio} outside [0, 1)"
        )));
    }
    Ok(1.0 / (1.0 - ratio))
}

/// `out = vals * scale * mask` with a fresh mask.
#[allow(clippy::too_many_arguments)]
pub fn launch_dropout<T: FloatElement>(
    ctx: &Context,
    stream: &Stream,
    out: &mut [T],
    vals: &[T],
    mask: &mut [u8],
    total_count: usize,
    dim: usize,
    ratio: f32,
) -> Result<()> {
    require_len("dropout", "vals", vals.len(), total_count)?;
    launch_masked(ctx, stream, "dropout", out, mask, total_count, dim, ratio, |i, _, factor| {
        vals[i].to_f32() * factor
    })
}

/// In place `out = dropout(out + bias)` over `rows x dim`.
#[allow(clippy::too_many_arguments)]
pub fn launch_dropout_bias<T: FloatElement>(
    ctx: &Context,
    stream: &Stream,
    out: &mut [T],
    bias: &[T],
    mask: &mut [u8],
    rows: usize,
    dim: usize,
    ratio: f32,
) -> Result<()> {
    require_len("dropout_bias", "bias", bias.len(), dim)?;
    let total = checked_elems("dropout_bias", &[rows, dim])?;
    launch_masked(ctx, stream, "dropout_bias", out, mask, total, dim, ratio, |i, cur, factor| {
        (cur.to_f32() + bias[i % dim].to_f32()) * factor
    })
}

/// `out = residual + dropout(vals + bias)` over `rows x dim`.
#[allow(clippy::too_many_arguments)]
pub fn launch_dropout_bias_residual<T: FloatElement>(
    ctx: &Context,
    stream: &Stream,
    out: &mut [T],
    vals: &[T],
    residual: &[T],
    bias: &[T],
    mask: &mut [u8],
    rows: usize,
    dim: usize,
    ratio: f32,
) -> Result<()> {
    let total = checked_elems("dropout_bias_residual", &[rows, dim])?;
    require_len("dropout_bias_residual", "vals", vals.len(), total)?;
    require_len("dropout_bias_residual", "residual", residual.len(), total)?;
    require_len("dropout_bias_residual", "bias", bias.len(), dim)?;
    launch_masked(ctx, stream, "dropout_bias_residual", out, mask, total, dim, ratio, |i, _, factor| {
        (vals[i].to_f32() + bias[i % dim].to_f32()) * factor + residual[i].to_f32()
    })
}

#[allow(clippy::too_many_arguments)]
fn launch_masked<T, F>(
    ctx: &Context,
    stream: &Stream,
    kernel: &'static str,
    out: &mut [T],
    mask: &mut [u8],
    total: usize,
    dim: usize,
    ratio: f32,
    apply: F,
) -> Result<()>
where
    T: FloatElement,
    F: Fn(usize, T, f32) -> f32 + Sync,
{
    let scale = check_ratio(kernel, ratio)?;
    require_len(kernel, "out", out.len(), total)?;
    require_len(kernel, "mask", mask.len(), total)?;

    let geom = DropoutGeometry::new(total, dim);
    let (seed, offset) = ctx.increment_offset(geom.counter_blocks);
    if total == 0 {
        return Ok(());
    }
    let threads = geom.threads();

    stream.submit(kernel, geom.cfg, || {
        out[..total]
            .par_chunks_mut(VEC_WIDTH)
            .zip(mask[..total].par_chunks_mut(VEC_WIDTH))
            .enumerate()
            .for_each(|(j, (o, m))| {
                let iteration = (j / threads) as u64;
                let rand = Philox::new(seed, (j % threads) as u64, offset + iteration).uniform4();
                for (l, (o, m)) in o.iter_mut().zip(m.iter_mut()).enumerate() {
                    let keep = rand[l] > ratio;
                    *m = keep as u8;
                    let factor = if keep { scale } else { 0.0 };
                    *o = T::from_f32(apply(j * VEC_WIDTH + l, *o, factor));
                }
            });
    });
    Ok(())
}

/// In place `vals = vals * scale * mask`.
pub fn launch_dropout_grad<T: FloatElement>(
    stream: &Stream,
    vals: &mut [T],
    mask: &[u8],
    total_count: usize,
    ratio: f32,
) -> Result<()> {
    let scale = check_ratio("dropout_grad", ratio)?;
    require_len("dropout_grad", "vals", vals.len(), total_count)?;
    require_len("dropout_grad", "mask", mask.len(), total_count)?;
    if total_count == 0 {
        return Ok(());
    }

    let cfg = DropoutGeometry::new(total_count, 0).cfg;
    stream.submit("dropout_grad", cfg, || {
        vals[..total_count]
            .par_chunks_mut(VEC_WIDTH)
            .zip(mask[..total_count].par_chunks(VEC_WIDTH))
            .for_each(|(v, m)| {
                for (v, &m) in v.iter_mut().zip(m) {
                    *v = T::from_f32(v.to_f32() * scale * m as f32);
                }
            });
    });
    Ok(())
}

/// `out = vals * scale * mask`, leaving `vals` untouched.
pub fn launch_dropout_grad_out<T: FloatElement>(
    stream: &Stream,
    out: &mut [T],
    vals: &[T],
    mask: &[u8],
    total_count: usize,
    ratio: f32,
) -> Result<()> {
    let scale = check_ratio("dropout_grad_out", ratio)?;
    require_len("dropout_grad_out", "out", out.len(), total_count)?;
    require_len("dropout_grad_out", "vals", vals.len(), total_count)?;
    require_len("dropout_grad_out", "mask", mask.len(), total_count)?;
    if total_count == 0 {
        return Ok(());
    }

    let cfg = DropoutGeometry::new(total_count, 0).cfg;
    stream.submit("dropout_grad_out", cfg, || {
        out[..total_count]
            .par_iter_mut()
            .zip(vals[..total_count].par_iter())
            .zip(mask[..total_count].par_iter())
            .for_each(|((o, v), &m)| {
                *o = T::from_f32(v.to_f32() * scale * m as f32);
            });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use crate::launch::MAX_BLOCKS;
    use half::f16;

    fn ctx(seed: u64) -> Context {
        Context::new(ContextConfig {
            num_threads: 2,
            seed,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_geometry() {
        let g = DropoutGeometry::new(4096, 512);
        assert_eq!(g.groups, 1024);
        assert_eq!(g.cfg.grid_dim, 2);
        assert_eq!(g.cfg.block_dim, 512);
        assert_eq!(g.counter_blocks, 1);

        let wide = DropoutGeometry::new(4096, 1024);
        assert_eq!(wide.cfg.grid_dim, 4);
        assert_eq!(wide.cfg.block_dim, 256);
        assert_eq!(wide.threads(), g.threads());

        // Grid saturates: the grid-stride loop needs several counter blocks.
        let huge = DropoutGeometry::new(VEC_WIDTH * MAX_BLOCKS * NUM_THREADS * 2 + 1, 64);
        assert_eq!(huge.cfg.grid_dim, MAX_BLOCKS);
        assert_eq!(huge.counter_blocks, 3);

        assert_eq!(DropoutGeometry::new(0, 8).counter_blocks, 1);
    }

    #[test]
    fn test_zero_ratio_is_identity_but_reserves() {
        let c = ctx(1);
        let s = c.current_stream();
        let vals: Vec<f32> = (0..37).map(|i| i as f32 - 18.0).collect();
        let mut out = vec![0.0f32; 37];
        let mut mask = vec![9u8; 37];
        launch_dropout(&c, &s, &mut out, &vals, &mut mask, 37, 37, 0.0).unwrap();
        assert_eq!(out, vals);
        assert!(mask.iter().all(|&m| m == 1));
        assert_eq!(c.offset(), 1);
    }

    #[test]
    fn test_drop_rate_and_scaling() {
        let c = ctx(7);
        let s = c.current_stream();
        let n = 100_000;
        let vals = vec![1.0f32; n];
        let mut out = vec![0.0f32; n];
        let mut mask = vec![0u8; n];
        launch_dropout(&c, &s, &mut out, &vals, &mut mask, n, 1000, 0.3).unwrap();

        let kept = mask.iter().filter(|&&m| m == 1).count() as f64 / n as f64;
        assert!((kept - 0.7).abs() < 0.01, "kept fraction {kept}");
        for (o, &m) in out.iter().zip(&mask) {
            if m == 1 {
                assert!((o - 1.0 / 0.7).abs() < 1e-6);
            } else {
                assert_eq!(*o, 0.0);
            }
        }
    }

    #[test]
    fn test_masks_reproducible_per_seed_and_offset() {
        let run = |c: &Context| {
            let vals = vec![1.0f32; 256];
            let mut out = vec![0.0f32; 256];
            let mut mask = vec![0u8; 256];
            launch_dropout(c, &c.current_stream(), &mut out, &vals, &mut mask, 256, 64, 0.5).unwrap();
            mask
        };
        let a = ctx(123);
        let b = ctx(123);
        let first = run(&a);
        assert_eq!(first, run(&b));
        // The next launch uses the next counter block.
        assert_ne!(first, run(&a));
        assert_ne!(first, run(&ctx(124)));
    }

    #[test]
    fn test_bias_extent_overflow_is_rejected() {
        let c = ctx(9);
        let mut out = vec![0.0f32; 8];
        let mut mask = vec![0u8; 8];
        let bias = vec![0.0f32; 4];
        let err = launch_dropout_bias(&c, &c.current_stream(), &mut out, &bias, &mut mask, usize::MAX, 4, 0.1)
            .unwrap_err();
        assert!(matches!(err, DskError::Precondition(_)));
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_bias_residual() {
        let c = ctx(3);
        let s = c.current_stream();
        let (rows, dim) = (6, 8);
        let n = rows * dim;
        let vals: Vec<f16> = (0..n).map(|i| f16::from_f32(i as f32 * 0.125)).collect();
        let residual: Vec<f16> = (0..n).map(|i| f16::from_f32(-(i as f32))).collect();
        let bias: Vec<f16> = (0..dim).map(|i| f16::from_f32(i as f32 * 0.5)).collect();
        let mut out = vec![f16::ZERO; n];
        let mut mask = vec![0u8; n];
        launch_dropout_bias_residual(&c, &s, &mut out, &vals, &residual, &bias, &mut mask, rows, dim, 0.5).unwrap();

        for i in 0..n {
            let dropped = (vals[i].to_f32() + bias[i % dim].to_f32()) * 2.0 * mask[i] as f32;
            let expected = f16::from_f32(dropped + residual[i].to_f32()).to_f32();
            assert_eq!(out[i].to_f32(), expected, "element {i}");
        }
    }

    #[test]
    fn test_bias_in_place() {
        let c = ctx(5);
        let s = c.current_stream();
        let mut out = vec![1.0f32; 16];
        let bias = vec![0.5f32, -1.0, 0.0, 2.0];
        let mut mask = vec![0u8; 16];
        launch_dropout_bias(&c, &s, &mut out, &bias, &mut mask, 4, 4, 0.25).unwrap();
        for i in 0..16 {
            let expected = (1.0 + bias[i % 4]) / 0.75 * mask[i] as f32;
            assert!((out[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_grad_matches_forward_mask() {
        let c = ctx(11);
        let s = c.current_stream();
        let n = 64;
        let vals: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let mut fwd = vec![0.0f32; n];
        let mut mask = vec![0u8; n];
        launch_dropout(&c, &s, &mut fwd, &vals, &mut mask, n, 16, 0.4).unwrap();

        let mut grad = vals.clone();
        launch_dropout_grad(&s, &mut grad, &mask, n, 0.4).unwrap();
        assert_eq!(grad, fwd);

        let mut grad_out = vec![0.0f32; n];
        launch_dropout_grad_out(&s, &mut grad_out, &vals, &mask, n, 0.4).unwrap();
        assert_eq!(grad_out, fwd);
        assert_eq!(vals[5], 5.0);
    }

    #[test]
    fn test_invalid_ratio() {
        let c = ctx(0);
        let s = c.current_stream();
        let vals = vec![0.0f32; 4];
        let mut out = vec![0.0f32; 4];
        let mut mask = vec![0u8; 4];
        for ratio in [1.0, -0.1, f32::NAN] {
            let err = launch_dropout(&c, &s, &mut out, &vals, &mut mask, 4, 4, ratio).unwrap_err();
            assert!(matches!(err, DskError::Precondition(_)));
        }
        // Rejected launches reserve nothing.
        assert_eq!(c.offset(), 0);
    }
}
