use std::fmt;

/// Buffer element types. Kernels are instantiated for the three float
/// formats; `U8` only appears as the one-byte-per-element dropout mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    U8,
}

impl DType {
    /// Float formats with kernel instantiations, widest first.
    pub const FLOATS: [DType; 3] = [DType::F32, DType::F16, DType::BF16];

    pub fn element_size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
        }
    }

    pub fn storage_bytes(self, n: usize) -> usize {
        n * self.element_size()
    }

    pub fn is_float(self) -> bool {
        self != DType::U8
    }

    /// 16-bit formats; products are accumulated in f32 and rounded once.
    pub fn is_narrow_float(self) -> bool {
        self.is_float() && self.element_size() == 2
    }

    /// Tag appended to per-precision entry points, e.g. `forward_fp16`.
    pub fn op_suffix(self) -> &'static str {
        match self {
            DType::F32 => "fp32",
            DType::F16 => "fp16",
            DType::BF16 => "bf16",
            DType::U8 => "u8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}
