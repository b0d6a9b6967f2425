//! # dsk-core
//!
//! Shared building blocks for the dsk operator crates.
//!
//! Provides:
//! - `DType` and the `Element` / `FloatElement` numeric abstraction (f32, f16, bf16, u8 masks)
//! - `Device` placement (host or accelerator queue)
//! - Reference-counted `Storage` and the `Tensor` buffer handed to operators
//! - `DskError`, including the unrecoverable `FatalError` class

pub mod dtype;
pub mod element;
pub mod device;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod error;

pub use dtype::DType;
pub use element::{Element, FloatElement};
pub use device::Device;
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;
pub use error::{DskError, FatalError};

pub type Result<T> = std::result::Result<T, DskError>;
