use std::fmt;

// Shape: logical extents of an operand
//
// Every operand that flows through a kernel graph is 4-D. Feature maps are
// logically (N, C, H, W) and filter weights are logically (O, I, KH, KW),
// whatever order the bytes end up in physically. The physical order is the
// business of the engine's layout type; a Shape only carries the extents.

/// Logical shape of an operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of logical elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// The four extents of a rank-4 shape.
    pub fn dims4(&self) -> crate::Result<[usize; 4]> {
        match self.0.as_slice() {
            &[d0, d1, d2, d3] => Ok([d0, d1, d2, d3]),
            _ => Err(crate::Error::RankMismatch {
                expected: 4,
                got: self.rank(),
            }),
        }
    }

    /// Contiguous row-major strides, e.g. [2, 3, 4] -> [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Whether any extent is zero.
    pub fn is_empty(&self) -> bool {
        self.0.iter().any(|&d| d == 0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<[usize; 4]> for Shape {
    fn from(d: [usize; 4]) -> Self {
        Shape(d.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}
