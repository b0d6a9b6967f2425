//! Counter-based Philox4x32-10 generator.
//!
//! Every work-item derives its random numbers from `(seed, subsequence,
//! block)` alone, so a kernel's output depends only on the offset it was
//! handed by the context and not on how the work was scheduled.

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const ROUNDS: usize = 10;

/// 2^-32: maps a u32 draw into the unit interval.
const TWO_POW_32_INV: f32 = 2.328_306_4e-10;

#[inline(always)]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = (a as u64) * (b as u64);
    ((product >> 32) as u32, product as u32)
}

#[inline(always)]
fn round(ctr: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let (hi0, lo0) = mulhilo(PHILOX_M0, ctr[0]);
    let (hi1, lo1) = mulhilo(PHILOX_M1, ctr[2]);
    [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0]
}

/// Apply the ten Philox rounds to one 128-bit counter.
pub fn philox4x32_10(ctr: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = ctr;
    let mut key = key;
    for r in 0..ROUNDS {
        if r > 0 {
            key[0] = key[0].wrapping_add(PHILOX_W0);
            key[1] = key[1].wrapping_add(PHILOX_W1);
        }
        ctr = round(ctr, key);
    }
    ctr
}

/// Per-work-item Philox state.
///
/// The 128-bit counter is `(block lo, block hi, subsequence lo, subsequence hi)`;
/// each call to [`Philox::uniform4`] consumes one block.
#[derive(Debug, Clone)]
pub struct Philox {
    key: [u32; 2],
    subsequence: u64,
    block: u64,
}

impl Philox {
    pub fn new(seed: u64, subsequence: u64, block: u64) -> Self {
        Self {
            key: [seed as u32, (seed >> 32) as u32],
            subsequence,
            block,
        }
    }

    /// Next four raw 32-bit draws.
    pub fn next_u32x4(&mut self) -> [u32; 4] {
        let ctr = [
            self.block as u32,
            (self.block >> 32) as u32,
            self.subsequence as u32,
            (self.subsequence >> 32) as u32,
        ];
        self.block = self.block.wrapping_add(1);
        philox4x32_10(ctr, self.key)
    }

    /// Next four floats in (0, 1].
    pub fn uniform4(&mut self) -> [f32; 4] {
        self.next_u32x4().map(to_unit)
    }
}

#[inline(always)]
fn to_unit(x: u32) -> f32 {
    x as f32 * TWO_POW_32_INV + TWO_POW_32_INV / 2.0
}
