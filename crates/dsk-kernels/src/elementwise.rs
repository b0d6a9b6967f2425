//! Fused residual adds.
//!
//! `add2` runs a grid-stride loop over 4-wide vector groups of the whole
//! buffer. `add3` and `add4` launch one workgroup per `[batch * seq]` row
//! with `hidden / 4` work-items. All sums are formed in f32 and narrowed
//! once on store.

use dsk_core::{DskError, FloatElement, Result};
use rayon::prelude::*;

use crate::launch::{checked_elems, grid_1d, grid_rows, require_len, VEC_WIDTH};
use crate::stream::Stream;

fn check_vectorizable(kernel: &str, what: &str, n: usize) -> Result<()> {
    if n % VEC_WIDTH != 0 {
        return Err(DskError::Precondition(format!(
            "{kernel}: {what} = {n} is not a multiple of {VEC_WIDTH}"
        )));
    }
    Ok(())
}

/// `out = a + b` over `batch * seq * hidden` elements.
pub fn launch_fused_add2<T: FloatElement>(
    stream: &Stream,
    out: &mut [T],
    a: &[T],
    b: &[T],
    batch: usize,
    seq: usize,
    hidden: usize,
) -> Result<()> {
    let n = checked_elems("fused_add2", &[batch, seq, hidden])?;
    check_vectorizable("fused_add2", "element count", n)?;
    require_len("fused_add2", "out", out.len(), n)?;
    require_len("fused_add2", "a", a.len(), n)?;
    require_len("fused_add2", "b", b.len(), n)?;
    if n == 0 {
        return Ok(());
    }

    stream.submit("fused_add2", grid_1d(n / VEC_WIDTH), || {
        out[..n]
            .par_chunks_mut(VEC_WIDTH)
            .zip(a[..n].par_chunks(VEC_WIDTH))
            .zip(b[..n].par_chunks(VEC_WIDTH))
            .for_each(|((o, a), b)| {
                for i in 0..VEC_WIDTH {
                    o[i] = T::from_f32(a[i].to_f32() + b[i].to_f32());
                }
            });
    });
    Ok(())
}

/// `out = a + b + c`, summed left to right, one workgroup per row.
#[allow(clippy::too_many_arguments)]
pub fn launch_fused_add3<T: FloatElement>(
    stream: &Stream,
    out: &mut [T],
    a: &[T],
    b: &[T],
    c: &[T],
    batch: usize,
    seq: usize,
    hidden: usize,
) -> Result<()> {
    launch_rows("fused_add3", stream, out, &[a, b, c], batch, seq, hidden)
}

/// `out = a + b + c + d`, summed left to right, one workgroup per row.
#[allow(clippy::too_many_arguments)]
pub fn launch_fused_add4<T: FloatElement>(
    stream: &Stream,
    out: &mut [T],
    a: &[T],
    b: &[T],
    c: &[T],
    d: &[T],
    batch: usize,
    seq: usize,
    hidden: usize,
) -> Result<()> {
    launch_rows("fused_add4", stream, out, &[a, b, c, d], batch, seq, hidden)
}

fn launch_rows<T: FloatElement>(
    kernel: &'static str,
    stream: &Stream,
    out: &mut [T],
    inputs: &[&[T]],
    batch: usize,
    seq: usize,
    hidden: usize,
) -> Result<()> {
    check_vectorizable(kernel, "hidden", hidden)?;
    let rows = checked_elems(kernel, &[batch, seq])?;
    let n = checked_elems(kernel, &[rows, hidden])?;
    require_len(kernel, "out", out.len(), n)?;
    for x in inputs {
        require_len(kernel, "input", x.len(), n)?;
    }
    if n == 0 {
        return Ok(());
    }

    let (head, tail) = inputs.split_first().ok_or_else(|| {
        DskError::Precondition(format!("{kernel}: no inputs"))
    })?;
    stream.submit(kernel, grid_rows(rows, hidden / VEC_WIDTH), || {
        out[..n]
            .par_chunks_mut(hidden)
            .enumerate()
            .for_each(|(row, o)| {
                let base = row * hidden;
                for (i, slot) in o.iter_mut().enumerate() {
                    let at = base + i;
                    let sum = tail.iter().fold(head[at].to_f32(), |acc, x| acc + x[at].to_f32());
                    *slot = T::from_f32(sum);
                }
            });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::build_device_pool;
    use half::{bf16, f16};

    fn stream() -> Stream {
        Stream::new(0, 0, build_device_pool(0, 2).unwrap())
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
        }
    }

    #[test]
    fn test_add2_doubles() {
        let b: Vec<f32> = (0..2 * 3 * 8).map(|i| i as f32 * 0.25 - 3.0).collect();
        let mut out = vec![0.0f32; b.len()];
        launch_fused_add2(&stream(), &mut out, &b, &b, 2, 3, 8).unwrap();
        let expected: Vec<f32> = b.iter().map(|x| 2.0 * x).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_add2_f16_is_exact_doubling() {
        let b: Vec<f16> = (0..64).map(|i| f16::from_f32(i as f32 / 7.0)).collect();
        let mut out = vec![f16::ZERO; 64];
        launch_fused_add2(&stream(), &mut out, &b, &b, 1, 4, 16).unwrap();
        for (o, x) in out.iter().zip(b.iter()) {
            assert_eq!(o.to_f32(), 2.0 * x.to_f32());
        }
    }

    #[test]
    fn test_add2_rejects_ragged_length() {
        let b = vec![1.0f32; 6];
        let mut out = vec![0.0f32; 6];
        let err = launch_fused_add2(&stream(), &mut out, &b, &b, 1, 2, 3).unwrap_err();
        assert!(matches!(err, DskError::Precondition(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_add3_matches_chained_add2() {
        let s = stream();
        let n = 2 * 2 * 12;
        let a: Vec<bf16> = (0..n).map(|i| bf16::from_f32(i as f32 * 0.3)).collect();
        let b: Vec<bf16> = (0..n).map(|i| bf16::from_f32(1.0 - i as f32 * 0.1)).collect();
        let c: Vec<bf16> = (0..n).map(|i| bf16::from_f32((i % 5) as f32)).collect();

        let mut fused = vec![bf16::ZERO; n];
        launch_fused_add3(&s, &mut fused, &a, &b, &c, 2, 2, 12).unwrap();

        let mut ab = vec![bf16::ZERO; n];
        launch_fused_add2(&s, &mut ab, &a, &b, 2, 2, 12).unwrap();
        let mut chained = vec![bf16::ZERO; n];
        launch_fused_add2(&s, &mut chained, &ab, &c, 2, 2, 12).unwrap();

        let fused: Vec<f32> = fused.iter().map(|x| x.to_f32()).collect();
        let chained: Vec<f32> = chained.iter().map(|x| x.to_f32()).collect();
        // The chained form rounds a + b to bf16 first; allow a couple of ulps at |x| < 32.
        assert_close(&fused, &chained, 0.5);
    }

    #[test]
    fn test_add4_sums_all_inputs() {
        let n = 3 * 8;
        let a = vec![1.0f32; n];
        let b = vec![2.0f32; n];
        let c = vec![3.0f32; n];
        let d: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; n];
        launch_fused_add4(&stream(), &mut out, &a, &b, &c, &d, 3, 1, 8).unwrap();
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, 6.0 + i as f32);
        }
    }

    #[test]
    fn test_add3_add4_sum_left_to_right() {
        // (1e8 - 1e8) + 1 == 1, while 1e8 + (-1e8 + 1) rounds to 0 in f32.
        let a = vec![1.0e8f32; 4];
        let b = vec![-1.0e8f32; 4];
        let c = vec![1.0f32; 4];
        let d = vec![0.5f32; 4];
        let mut out = vec![0.0f32; 4];
        launch_fused_add3(&stream(), &mut out, &a, &b, &c, 1, 1, 4).unwrap();
        assert_eq!(out, vec![1.0; 4]);
        launch_fused_add4(&stream(), &mut out, &a, &b, &c, &d, 1, 1, 4).unwrap();
        assert_eq!(out, vec![1.5; 4]);
    }

    #[test]
    fn test_extent_overflow_is_rejected() {
        let x = vec![0.0f32; 4];
        let mut out = vec![0.0f32; 4];
        let err = launch_fused_add2(&stream(), &mut out, &x, &x, usize::MAX, 2, 4).unwrap_err();
        assert!(matches!(err, DskError::Precondition(_)));
        let err = launch_fused_add3(&stream(), &mut out, &x, &x, &x, usize::MAX / 2, 4, 4).unwrap_err();
        assert!(matches!(err, DskError::Precondition(_)));
    }

    #[test]
    fn test_add3_rejects_hidden_not_multiple_of_four() {
        let x = vec![0.0f32; 6];
        let mut out = vec![0.0f32; 6];
        assert!(launch_fused_add3(&stream(), &mut out, &x, &x, &x, 1, 1, 6).is_err());
    }
}
