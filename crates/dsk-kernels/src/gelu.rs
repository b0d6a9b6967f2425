//! Bias + GELU (tanh approximation) and its derivative.

use dsk_core::{DskError, FloatElement, Result};
use rayon::prelude::*;

use crate::launch::{checked_elems, grid_rows, require_len, NUM_THREADS, VEC_WIDTH};
use crate::stream::Stream;

const SQRT_2_OVER_PI: f32 = 0.797_884_56;
const MUL_PARAM: f32 = 0.044_715;

/// `0.5 x (1 + tanh(sqrt(2/pi) (x + 0.044715 x^3)))`.
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + MUL_PARAM * x * x * x)).tanh())
}

/// Derivative of [`gelu`].
#[inline]
pub fn d_gelu(x: f32) -> f32 {
    let x2mul = x * x * MUL_PARAM;
    let tan_h = (SQRT_2_OVER_PI * (x + x * x2mul)).tanh();
    let dg1 = 0.5 * (1.0 + tan_h);
    let dg2 = x * 0.5 * SQRT_2_OVER_PI * (1.0 - tan_h * tan_h);
    let dg3 = dg2 * 3.0 * x2mul;
    dg1 + dg2 + dg3
}

fn row_launch(intermediate_size: usize, rows: usize) -> crate::launch::LaunchConfig {
    grid_rows(rows, (intermediate_size / VEC_WIDTH).clamp(1, NUM_THREADS))
}

fn check_geometry(kernel: &str, intermediate_size: usize) -> Result<()> {
    if intermediate_size == 0 {
        return Err(DskError::Precondition(format!("{kernel}: intermediate_size must be positive")));
    }
    Ok(())
}

/// `out[r, j] = gelu(input[r, j] + bias[j])` for `rows x intermediate_size`.
pub fn launch_bias_gelu<T: FloatElement>(
    stream: &Stream,
    input: &[T],
    bias: &[T],
    out: &mut [T],
    intermediate_size: usize,
    rows: usize,
) -> Result<()> {
    check_geometry("bias_gelu", intermediate_size)?;
    let n = checked_elems("bias_gelu", &[rows, intermediate_size])?;
    require_len("bias_gelu", "input", input.len(), n)?;
    require_len("bias_gelu", "bias", bias.len(), intermediate_size)?;
    require_len("bias_gelu", "out", out.len(), n)?;
    if n == 0 {
        return Ok(());
    }

    stream.submit("bias_gelu", row_launch(intermediate_size, rows), || {
        out[..n]
            .par_chunks_mut(intermediate_size)
            .zip(input[..n].par_chunks(intermediate_size))
            .for_each(|(o, x)| {
                for ((o, x), b) in o.iter_mut().zip(x).zip(bias) {
                    *o = T::from_f32(gelu(x.to_f32() + b.to_f32()));
                }
            });
    });
    Ok(())
}

/// In place `d_output[r, j] *= d_gelu(input[r, j] + bias[j])`.
pub fn launch_d_gelu<T: FloatElement>(
    stream: &Stream,
    d_output: &mut [T],
    input: &[T],
    bias: &[T],
    intermediate_size: usize,
    rows: usize,
) -> Result<()> {
    check_geometry("d_gelu", intermediate_size)?;
    let n = checked_elems("d_gelu", &[rows, intermediate_size])?;
    require_len("d_gelu", "d_output", d_output.len(), n)?;
    require_len("d_gelu", "input", input.len(), n)?;
    require_len("d_gelu", "bias", bias.len(), intermediate_size)?;
    if n == 0 {
        return Ok(());
    }

    stream.submit("d_gelu", row_launch(intermediate_size, rows), || {
        d_output[..n]
            .par_chunks_mut(intermediate_size)
            .zip(input[..n].par_chunks(intermediate_size))
            .for_each(|(g, x)| {
                for ((g, x), b) in g.iter_mut().zip(x).zip(bias) {
                    *g = T::from_f32(g.to_f32() * d_gelu(x.to_f32() + b.to_f32()));
                }
            });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::build_device_pool;
    use half::f16;

    fn stream() -> Stream {
        Stream::new(0, 0, build_device_pool(0, 2).unwrap())
    }

    #[test]
    fn test_gelu_known_values() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(1.0) - 0.841_192).abs() < 1e-5);
        assert!((gelu(-1.0) + 0.158_808).abs() < 1e-5);
        assert!((gelu(6.0) - 6.0).abs() < 1e-4);
        assert!(gelu(-6.0).abs() < 1e-4);
    }

    #[test]
    fn test_d_gelu_matches_finite_difference() {
        for &x in &[-3.0f32, -1.2, -0.3, 0.0, 0.4, 1.0, 2.5] {
            let h = 1e-3f32;
            let numeric = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert!((d_gelu(x) - numeric).abs() < 1e-3, "x={x}: {} vs {numeric}", d_gelu(x));
        }
        assert!((d_gelu(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bias_gelu_adds_bias_per_column() {
        let input = vec![0.0f32, 1.0, -1.0, 0.5, 0.0, 0.0, 0.0, 0.0];
        let bias = vec![1.0f32, 0.0, 0.0, -0.5];
        let mut out = vec![0.0f32; 8];
        launch_bias_gelu(&stream(), &input, &bias, &mut out, 4, 2).unwrap();
        let expected = [gelu(1.0), gelu(1.0), gelu(-1.0), 0.0, gelu(1.0), 0.0, 0.0, gelu(-0.5)];
        for (o, e) in out.iter().zip(expected) {
            assert!((o - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_d_gelu_scales_gradient_in_place() {
        let input: Vec<f16> = [0.5f32, -0.5, 2.0, -2.0].iter().map(|&v| f16::from_f32(v)).collect();
        let bias = vec![f16::ZERO; 2];
        let mut grad = vec![f16::from_f32(2.0); 4];
        launch_d_gelu(&stream(), &mut grad, &input, &bias, 2, 2).unwrap();
        for (g, x) in grad.iter().zip(&input) {
            let expected = 2.0 * d_gelu(x.to_f32());
            assert!((g.to_f32() - expected).abs() < 2e-3, "{} vs {expected}", g.to_f32());
        }
    }

    #[test]
    fn test_short_bias_rejected() {
        let input = vec![0.0f32; 8];
        let mut out = vec![0.0f32; 8];
        let err = launch_bias_gelu(&stream(), &input, &[0.0f32; 3], &mut out, 4, 2).unwrap_err();
        assert!(matches!(err, DskError::Precondition(_)));
    }
}
