//! # dsk-ops
//!
//! Operator entry points over [`dsk_core::Tensor`].
//!
//! Every entry point checks its inputs (on the context's accelerator,
//! contiguous, consistent dtype and shape) before any work is submitted,
//! dispatches on dtype to the typed kernels in `dsk-kernels`, and records
//! fatal backend errors on the [`Context`](dsk_kernels::Context) so later
//! calls fail fast.

/// Bind `$T` to the element type of a float `DType` and evaluate `$body`.
macro_rules! dispatch_float {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            dsk_core::DType::F32 => {
                type $T = f32;
                $body
            }
            dsk_core::DType::F16 => {
                type $T = half::f16;
                $body
            }
            dsk_core::DType::BF16 => {
                type $T = half::bf16;
                $body
            }
            other => Err(dsk_core::DskError::UnsupportedDType(other)),
        }
    };
}

pub mod check;
pub mod dropout;
pub mod feed_forward;
pub mod gelu;
pub mod fused;

pub use check::check_input;
pub use dropout::{dropout_backward, dropout_forward, dropout_forward_with_bias, Dropout, DropoutConfig};
pub use feed_forward::{feedforward_backward, feedforward_forward, FeedForward, FeedForwardConfig};
pub use fused::{column_sum, fused_add2, fused_add3, fused_add4};
pub use gelu::{bias_gelu_backward, bias_gelu_forward, Gelu, GeluConfig};
