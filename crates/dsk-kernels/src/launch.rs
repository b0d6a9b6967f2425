//! Launch geometry for workgroup-partitioned kernels.
//!
//! A launch is a 1-D grid of workgroups, each with `block_dim` work-items.
//! Elementwise kernels use a grid-stride loop: work-item `t` of the global
//! range handles items `t, t + global_range, t + 2 * global_range, ...`.

/// Work-items per workgroup for elementwise launches.
pub const NUM_THREADS: usize = 512;

/// Upper bound on workgroups in a 1-D launch.
pub const MAX_BLOCKS: usize = 262_144;

/// Sub-group width used by the reduction kernels.
pub const WARP_SIZE: usize = 32;

/// Scalar elements handled by one work-item in vectorized kernels.
pub const VEC_WIDTH: usize = 4;

/// Grid and workgroup dimensions of a 1-D launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: usize,
    pub block_dim: usize,
}

impl LaunchConfig {
    /// Total number of work-items in the launch.
    pub fn global_range(&self) -> usize {
        self.grid_dim * self.block_dim
    }

    /// Number of grid-stride iterations needed to cover `n` items.
    pub fn iterations(&self, n: usize) -> usize {
        n.div_ceil(self.global_range())
    }
}

/// Workgroups needed for `n` items: `ceil(n / NUM_THREADS)` clamped to
/// `[1, MAX_BLOCKS]`. An empty launch still gets one workgroup.
pub fn get_blocks(n: usize) -> usize {
    n.div_ceil(NUM_THREADS).clamp(1, MAX_BLOCKS)
}

/// Grid-stride configuration covering `n` items.
pub fn grid_1d(n: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: get_blocks(n),
        block_dim: NUM_THREADS,
    }
}

/// One workgroup per row with `block_dim` work-items each.
pub fn grid_rows(rows: usize, block_dim: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: rows.max(1),
        block_dim: block_dim.max(1),
    }
}

/// Product of `extents`, rejecting sizes that do not fit in `usize`.
pub fn checked_elems(kernel: &str, extents: &[usize]) -> dsk_core::Result<usize> {
    extents
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            dsk_core::DskError::Precondition(format!("{kernel}: extents {extents:?} overflow the element count"))
        })
}

/// Reject a launch whose buffer is shorter than the geometry needs.
pub(crate) fn require_len(kernel: &str, buffer: &str, got: usize, need: usize) -> dsk_core::Result<()> {
    if got < need {
        return Err(dsk_core::DskError::Precondition(format!(
            "{kernel}: {buffer} holds {got} elements, launch needs {need}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_blocks_bounds() {
        assert_eq!(get_blocks(0), 1);
        assert_eq!(get_blocks(1), 1);
        assert_eq!(get_blocks(512), 1);
        assert_eq!(get_blocks(513), 2);
        assert_eq!(get_blocks(usize::MAX / 2), MAX_BLOCKS);
    }

    #[test]
    fn test_grid_stride_iterations() {
        let cfg = grid_1d(1024);
        assert_eq!(cfg.grid_dim, 2);
        assert_eq!(cfg.global_range(), 1024);
        assert_eq!(cfg.iterations(1024), 1);

        let capped = grid_1d(MAX_BLOCKS * NUM_THREADS * 3);
        assert_eq!(capped.grid_dim, MAX_BLOCKS);
        assert_eq!(capped.iterations(MAX_BLOCKS * NUM_THREADS * 3), 3);
    }

    #[test]
    fn test_checked_elems() {
        assert_eq!(checked_elems("fused_add2", &[2, 3, 8]).unwrap(), 48);
        assert_eq!(checked_elems("fused_add2", &[]).unwrap(), 1);
        let err = checked_elems("fused_add2", &[usize::MAX, 2, 1]).unwrap_err();
        assert!(matches!(err, dsk_core::DskError::Precondition(_)));
        assert!(err.to_string().contains("overflow"), "{err}");
    }

    #[test]
    fn test_grid_rows() {
        let cfg = grid_rows(6, 16);
        assert_eq!(cfg.grid_dim, 6);
        assert_eq!(cfg.block_dim, 16);
        assert_eq!(cfg.global_range(), 96);
    }
}
