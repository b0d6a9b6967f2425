//! # dsk-kernels
//!
//! Transformer training kernels on a stream-ordered accelerator.
//!
//! A device is a dedicated worker pool and each [`Stream`] is an in-order
//! queue onto it. Kernels are written as workgroup-partitioned loops over
//! host-visible buffers.
//!
//! Provides:
//! - [`Context`]: streams, Philox seed/offset reservation, workspace, GEMM tags
//! - Launch geometry (`NUM_THREADS`, `MAX_BLOCKS`, `get_blocks`)
//! - Fused residual adds, bias + GELU and its backward
//! - Dropout forward/backward with counter-based masks
//! - Column-sum reduction for bias gradients
//! - Column-major GEMM and strided batched GEMM with algorithm tuning
//! - Stream and host timers

pub mod launch;
pub mod stream;
pub mod rng;
pub mod context;
pub mod elementwise;
pub mod gelu;
pub mod dropout;
pub mod reduce;
pub mod blas;
pub mod timer;

pub use blas::{gemm_ex, strided_batched_gemm, GemmAlgo, Transpose};
pub use context::{Context, ContextConfig};
pub use gemm_test::{GemmTest, StridedGemmTest};
pub use launch::{checked_elems, get_blocks, LaunchConfig, MAX_BLOCKS, NUM_THREADS, VEC_WIDTH, WARP_SIZE};
pub use stream::Stream;
pub use timer::{CpuTimer, GpuTimer};
