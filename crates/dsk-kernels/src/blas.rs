//! Column-major GEMM backend with vendor BLAS calling conventions.
//!
//! Operands follow the BLAS layout: `op(A)` is `m x k`, `op(B)` is `k x n`,
//! `C` is `m x n`, all column-major. Leading dimensions are derived from the
//! transpose flags (`lda = transa == N ? m : k`, `ldb = transb == N ? k : n`,
//! `ldc = m`). Narrow element types accumulate in f32.
//!
//! A backend fault is not recoverable: it is logged with the shape of the
//! failing call and returned as [`DskError::Fatal`].

use dsk_core::{DskError, FloatElement, Result};
use rayon::prelude::*;

use crate::launch::{LaunchConfig, NUM_THREADS};
use crate::stream::Stream;

/// Per-operand transpose flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transpose {
    NoTrans,
    Trans,
}

impl Transpose {
    pub fn flip(self) -> Self {
        match self {
            Transpose::NoTrans => Transpose::Trans,
            Transpose::Trans => Transpose::NoTrans,
        }
    }
}

/// GEMM algorithm selection tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GemmAlgo {
    /// Backend's choice (currently [`GemmAlgo::Blocked`]).
    #[default]
    Default,
    /// One dot product per output element.
    Reference,
    /// Cache-tiled accumulation over row and reduction blocks.
    Blocked,
}

impl GemmAlgo {
    /// Candidates timed by the GEMM tuner.
    pub const CANDIDATES: [GemmAlgo; 2] = [GemmAlgo::Reference, GemmAlgo::Blocked];

    /// Integer tag as reported by the tuner (99 is the default algorithm).
    pub fn tag(self) -> i32 {
        match self {
            GemmAlgo::Default => 99,
            GemmAlgo::Reference => 0,
            GemmAlgo::Blocked => 1,
        }
    }
}

const TILE_M: usize = 64;
const TILE_K: usize = 64;

/// `C = alpha * op(A) op(B) + beta * C`.
///
/// When `beta == 0` the previous contents of `C` are not read.
#[allow(clippy::too_many_arguments)]
#[track_caller]
pub fn gemm_ex<T: FloatElement>(
    stream: &Stream,
    transa: Transpose,
    transb: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
    a: &[T],
    b: &[T],
    c: &mut [T],
    algo: GemmAlgo,
) -> Result<()> {
    let lda = lead_a(transa, m, k);
    let ldb = lead_b(transb, k, n);
    let ldc = m.max(1);

    let need_a = operand_len(transa, m, k, lda);
    let need_b = operand_len(transb, k, n, ldb);
    let need_c = stored_len(m, n, ldc);
    if a.len() < need_a || b.len() < need_b || c.len() < need_c {
        return Err(fault(
            "gemm",
            format!(
                "(m, n, k) {m} {n} {k}: buffers a={} b={} c={} need a={need_a} b={need_b} c={need_c}",
                a.len(),
                b.len(),
                c.len()
            ),
        ));
    }
    if m == 0 || n == 0 {
        return Ok(());
    }

    let cfg = LaunchConfig {
        grid_dim: n,
        block_dim: m.min(NUM_THREADS),
    };
    stream.submit("gemm", cfg, || {
        gemm_columns(transa, transb, m, n, k, alpha, beta, a, lda, b, ldb, c, ldc, algo);
    });
    Ok(())
}

/// Strided batched GEMM: for each `i < batch`,
/// `C_i = alpha * op(A_i) op(B_i) + beta * C_i` with `X_i = X[i * stride_x..]`.
#[allow(clippy::too_many_arguments)]
#[track_caller]
pub fn strided_batched_gemm<T: FloatElement>(
    stream: &Stream,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
    a: &[T],
    b: &[T],
    c: &mut [T],
    transa: Transpose,
    transb: Transpose,
    stride_a: usize,
    stride_b: usize,
    stride_c: usize,
    batch: usize,
    algo: GemmAlgo,
) -> Result<()> {
    let lda = lead_a(transa, m, k);
    let ldb = lead_b(transb, k, n);
    let ldc = m.max(1);

    let need_a = batched_len(operand_len(transa, m, k, lda), stride_a, batch);
    let need_b = batched_len(operand_len(transb, k, n, ldb), stride_b, batch);
    let per_c = stored_len(m, n, ldc);
    let need_c = batched_len(per_c, stride_c, batch);
    if a.len() < need_a || b.len() < need_b || c.len() < need_c {
        return Err(fault(
            "strided_batched_gemm",
            format!(
                "(batch, m, n, k) {batch} {m} {n} {k}: buffers a={} b={} c={} need a={need_a} b={need_b} c={need_c}",
                a.len(),
                b.len(),
                c.len()
            ),
        ));
    }
    if batch > 1 && per_c > 0 && stride_c < per_c {
        return Err(fault(
            "strided_batched_gemm",
            format!(
                "(batch, m, n, k) {batch} {m} {n} {k}: stride_c={stride_c} overlaps a {per_c}-element output"
            ),
        ));
    }
    if batch == 0 || m == 0 || n == 0 {
        return Ok(());
    }

    let cfg = LaunchConfig {
        grid_dim: batch * n,
        block_dim: m.min(NUM_THREADS),
    };
    stream.submit("strided_batched_gemm", cfg, || {
        if batch == 1 {
            gemm_columns(transa, transb, m, n, k, alpha, beta, a, lda, b, ldb, c, ldc, algo);
            return;
        }
        c.par_chunks_mut(stride_c)
            .take(batch)
            .enumerate()
            .for_each(|(i, c_i)| {
                // With k == 0 the operands may be empty and C_i is only scaled by beta.
                let a_i = a.get(i * stride_a..).unwrap_or(&[]);
                let b_i = b.get(i * stride_b..).unwrap_or(&[]);
                gemm_columns(transa, transb, m, n, k, alpha, beta, a_i, lda, b_i, ldb, c_i, ldc, algo);
            });
    });
    Ok(())
}

fn lead_a(transa: Transpose, m: usize, k: usize) -> usize {
    match transa {
        Transpose::NoTrans => m.max(1),
        Transpose::Trans => k.max(1),
    }
}

fn lead_b(transb: Transpose, k: usize, n: usize) -> usize {
    match transb {
        Transpose::NoTrans => k.max(1),
        Transpose::Trans => n.max(1),
    }
}

/// Elements spanned by a column-major `rows x cols` matrix with leading dimension `ld`.
fn stored_len(rows: usize, cols: usize, ld: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        ld * (cols - 1) + rows
    }
}

/// Elements spanned by an operand whose `op()` is `rows x cols`.
fn operand_len(trans: Transpose, rows: usize, cols: usize, ld: usize) -> usize {
    match trans {
        Transpose::NoTrans => stored_len(rows, cols, ld),
        Transpose::Trans => stored_len(cols, rows, ld),
    }
}

fn batched_len(per: usize, stride: usize, batch: usize) -> usize {
    if batch == 0 || per == 0 {
        0
    } else {
        stride * (batch - 1) + per
    }
}

#[track_caller]
fn fault(op: &'static str, detail: String) -> DskError {
    let err = DskError::fatal(op, detail);
    if let DskError::Fatal(f) = &err {
        tracing::error!(
            op = f.op,
            detail = %f.detail,
            file = f.location.file(),
            line = f.location.line(),
            "GEMM backend fault"
        );
    }
    err
}

/// Element `(row, col)` of `op(X)`.
#[inline(always)]
fn op_at<T: FloatElement>(x: &[T], trans: Transpose, ld: usize, row: usize, col: usize) -> f32 {
    match trans {
        Transpose::NoTrans => x[row + col * ld].to_f32(),
        Transpose::Trans => x[col + row * ld].to_f32(),
    }
}

#[inline(always)]
fn store<T: FloatElement>(dst: &mut T, acc: f32, alpha: f32, beta: f32) {
    let prev = if beta == 0.0 { 0.0 } else { beta * dst.to_f32() };
    *dst = T::from_f32(alpha * acc + prev);
}

/// Compute every column of one `C`, columns in parallel.
#[allow(clippy::too_many_arguments)]
fn gemm_columns<T: FloatElement>(
    transa: Transpose,
    transb: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    c: &mut [T],
    ldc: usize,
    algo: GemmAlgo,
) {
    c.par_chunks_mut(ldc).take(n).enumerate().for_each(|(j, col)| {
        let col = &mut col[..m];
        match algo {
            GemmAlgo::Reference => {
                for (i, dst) in col.iter_mut().enumerate() {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        acc += op_at(a, transa, lda, i, p) * op_at(b, transb, ldb, p, j);
                    }
                    store(dst, acc, alpha, beta);
                }
            }
            GemmAlgo::Default | GemmAlgo::Blocked => {
                let mut acc = [0.0f32; TILE_M];
                for i0 in (0..m).step_by(TILE_M) {
                    let i_end = (i0 + TILE_M).min(m);
                    let acc = &mut acc[..i_end - i0];
                    acc.fill(0.0);
                    for p0 in (0..k).step_by(TILE_K) {
                        let p_end = (p0 + TILE_K).min(k);
                        for p in p0..p_end {
                            let b_val = op_at(b, transb, ldb, p, j);
                            for (ii, slot) in acc.iter_mut().enumerate() {
                                *slot += op_at(a, transa, lda, i0 + ii, p) * b_val;
                            }
                        }
                    }
                    for (dst, &v) in col[i0..i_end].iter_mut().zip(acc.iter()) {
                        store(dst, v, alpha, beta);
                    }
                }
            }
        }
    });
}
