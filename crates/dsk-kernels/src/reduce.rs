//! Column-sum reduction (bias gradient) over a row-major `[rows, cols]` matrix.
//!
//! One workgroup owns 32 adjacent columns and runs a 32 x 32 tile of
//! work-items. Work-item `(x, y)` sums rows `y, y + 32, ...` of column
//! `x` into a padded 32 x 33 local tile. The tile is then read transposed so
//! each 32-lane sub-group holds the 32 partials of one column, and a
//! shuffle-down tree over offsets 1, 2, 4, 8, 16 folds them into lane 0.

use dsk_core::{FloatElement, Result};
use rayon::prelude::*;

use crate::launch::{checked_elems, require_len, LaunchConfig, WARP_SIZE};
use crate::stream::Stream;

const TILE_DIM: usize = WARP_SIZE;

/// `out[c] = sum_r inp[r, c]`, accumulated in f32.
pub fn launch_fuse_transpose_bias_kernel<T: FloatElement>(
    stream: &Stream,
    inp: &[T],
    out: &mut [T],
    rows: usize,
    cols: usize,
) -> Result<()> {
    let n = checked_elems("fuse_transpose_bias", &[rows, cols])?;
    require_len("fuse_transpose_bias", "inp", inp.len(), n)?;
    require_len("fuse_transpose_bias", "out", out.len(), cols)?;
    if cols == 0 {
        return Ok(());
    }

    let cfg = LaunchConfig {
        grid_dim: cols.div_ceil(TILE_DIM),
        block_dim: TILE_DIM * TILE_DIM,
    };
    stream.submit("fuse_transpose_bias", cfg, || {
        out[..cols]
            .par_chunks_mut(TILE_DIM)
            .enumerate()
            .for_each(|(group, out)| column_group(inp, out, group * TILE_DIM, rows, cols));
    });
    Ok(())
}

/// One workgroup: reduce columns `col0..col0 + out.len()`.
fn column_group<T: FloatElement>(inp: &[T], out: &mut [T], col0: usize, rows: usize, cols: usize) {
    let mut tile = [[0.0f32; TILE_DIM + 1]; TILE_DIM];

    for (x, tile_row) in tile.iter_mut().enumerate() {
        let col = col0 + x;
        if col >= cols {
            continue;
        }
        for (y, slot) in tile_row.iter_mut().take(TILE_DIM).enumerate() {
            let mut local = 0.0f32;
            for r in (y..rows).step_by(TILE_DIM) {
                local += inp[r * cols + col].to_f32();
            }
            *slot = local;
        }
    }

    for (y, dst) in out.iter_mut().enumerate() {
        let mut lanes = [0.0f32; TILE_DIM];
        for (x, lane) in lanes.iter_mut().enumerate() {
            *lane = tile[y][x];
        }
        *dst = T::from_f32(shuffle_down_sum(lanes));
    }
}

/// Tree reduction across one sub-group; lanes shifted past the end add nothing.
fn shuffle_down_sum(mut lanes: [f32; TILE_DIM]) -> f32 {
    let mut offset = 1;
    while offset < TILE_DIM {
        // Ascending order reads each source lane before it is overwritten.
        for x in 0..TILE_DIM - offset {
            lanes[x] += lanes[x + offset];
        }
        offset <<= 1;
    }
    lanes[0]
}
