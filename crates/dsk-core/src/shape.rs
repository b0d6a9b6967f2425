use smallvec::SmallVec;
use std::fmt;

/// Inline capacity covers the `[batch, seq, hidden]` and `[batch, heads, seq, head_dim]`
/// layouts used by the transformer operators.
type Dims = SmallVec<[usize; 4]>;

/// Extents of a tensor, outermost first.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Shape { dims: dims.iter().copied().collect() }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Element count; a rank-0 shape holds a single value. Saturates at
    /// `usize::MAX`, which no buffer can match.
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// Element count, `None` when it does not fit in `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn dims(&self) -> &[usize] {
        self.dims.as_slice()
    }

    /// Feature width seen by row-wise kernels.
    pub fn last_dim(&self) -> usize {
        match self.dims.as_slice() {
            [] => 1,
            [.., last] => *last,
        }
    }

    /// Row count when the tensor is flattened to `[rows, last_dim]`.
    pub fn leading_rows(&self) -> usize {
        match self.dims.split_last() {
            None => 1,
            Some((0, _)) => 0,
            Some((_, outer)) => outer.iter().fold(1usize, |acc, &d| acc.saturating_mul(d)),
        }
    }

    /// Row-major strides, innermost stride 1.
    pub fn contiguous_strides(&self) -> Dims {
        let mut out: Dims = self
            .dims
            .iter()
            .rev()
            .scan(1usize, |span, &d| {
                let stride = *span;
                *span = span.saturating_mul(d);
                Some(stride)
            })
            .collect();
        out.reverse();
        out
    }

    /// Shape with the two innermost extents exchanged, `None` below rank 2.
    pub fn transpose(&self) -> Option<Shape> {
        let n = self.dims.len();
        (n >= 2).then(|| {
            let mut dims = self.dims.clone();
            dims.swap(n - 2, n - 1);
            Shape { dims }
        })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.dims.iter()).finish()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
