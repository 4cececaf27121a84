use std::fmt;

use primnet_core::{bail, Error, Result, Shape};

// CpuLayout: physical arrangement of a 4-D operand
//
// Logical indices are always (d0, d1, d2, d3) = (N, C, H, W) for feature maps
// and (O, I, KH, KW) for weights. A layout maps a logical index to a position
// in linear memory:
//
//   offset = i0*s0 + (i1 / b)*s1 + i2*s2 + i3*s3 + (i1 % b)
//
// where b is the channel block (1 for plain formats). Blocked formats pad d1
// up to a multiple of b, so their physical size can exceed the logical element
// count; the padding lanes are never read.
//
// Two layouts are equal when they place every logical element at the same
// offset, regardless of the name they were created under. NCHW and OIHW over
// the same extents are therefore the same layout.

/// Named memory formats the CPU engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Nchw,
    Nhwc,
    /// Batch innermost.
    Chwn,
    /// Channels blocked by the engine's channel block, block innermost.
    NChwXc,
    Oihw,
    /// Output channels innermost.
    Ihwo,
    Hwio,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Nchw => "nchw",
            Format::Nhwc => "nhwc",
            Format::Chwn => "chwn",
            Format::NChwXc => "nChwXc",
            Format::Oihw => "oihw",
            Format::Ihwo => "ihwo",
            Format::Hwio => "hwio",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct CpuLayout {
    format: Format,
    dims: [usize; 4],
    strides: [usize; 4],
    block: usize,
}

impl CpuLayout {
    /// Plain (unblocked) layout in `format`.
    pub fn new(shape: &Shape, format: Format) -> Result<Self> {
        let dims = shape.dims4()?;
        let [d0, d1, d2, d3] = dims;
        let strides = match format {
            Format::Nchw | Format::Oihw => [d1 * d2 * d3, d2 * d3, d3, 1],
            Format::Nhwc => [d2 * d3 * d1, 1, d3 * d1, d1],
            Format::Chwn | Format::Ihwo => [1, d2 * d3 * d0, d3 * d0, d0],
            Format::Hwio => [1, d0, d3 * d1 * d0, d1 * d0],
            Format::NChwXc => {
                return Err(Error::msg(
                    "blocked layouts need a block size, use CpuLayout::blocked",
                ))
            }
        };
        Ok(CpuLayout {
            format,
            dims,
            strides,
            block: 1,
        })
    }

    /// Channel-blocked feature-map layout.
    pub fn blocked(shape: &Shape, block: usize) -> Result<Self> {
        if block < 2 {
            bail!("invalid channel block {block}");
        }
        let dims = shape.dims4()?;
        let [_, d1, d2, d3] = dims;
        let groups = (d1 + block - 1) / block;
        let strides = [groups * d2 * d3 * block, d2 * d3 * block, d3 * block, block];
        Ok(CpuLayout {
            format: Format::NChwXc,
            dims,
            strides,
            block,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    pub fn strides(&self) -> [usize; 4] {
        self.strides
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn shape(&self) -> Shape {
        Shape::from(self.dims)
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of elements a buffer holding this layout must provide.
    pub fn physical_size(&self) -> usize {
        let [d0, d1, d2, d3] = self.dims;
        let b = self.block;
        d0 * ((d1 + b - 1) / b) * b * d2 * d3
    }

    /// Memory offset of logical index `[i0, i1, i2, i3]`.
    #[inline]
    pub fn offset(&self, idx: [usize; 4]) -> usize {
        let b = self.block;
        idx[0] * self.strides[0]
            + (idx[1] / b) * self.strides[1]
            + idx[2] * self.strides[2]
            + idx[3] * self.strides[3]
            + idx[1] % b
    }

    /// Memory offsets of every logical element, in logical row-major order.
    pub fn offsets(&self) -> Offsets<'_> {
        Offsets {
            layout: self,
            current: [0; 4],
            remaining: self.elem_count(),
            started: false,
        }
    }

    /// Offsets of the logical elements of outer index `i0` (one sample of a
    /// feature map), in (d1, d2, d3) row-major order.
    pub fn sample_offsets(&self, i0: usize) -> impl Iterator<Item = usize> + '_ {
        let [_, d1, d2, d3] = self.dims;
        (0..d1).flat_map(move |i1| {
            (0..d2).flat_map(move |i2| (0..d3).map(move |i3| self.offset([i0, i1, i2, i3])))
        })
    }
}

// Strides of extent-1 dimensions never contribute to an offset, so they are
// not compared: CHWN over a single image is the same arrangement as NCHW.
impl PartialEq for CpuLayout {
    fn eq(&self, other: &Self) -> bool {
        self.dims == other.dims
            && self.block == other.block
            && (0..4).all(|i| self.dims[i] <= 1 || self.strides[i] == other.strides[i])
    }
}

impl Eq for CpuLayout {}

impl fmt::Display for CpuLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [d0, d1, d2, d3] = self.dims;
        match self.format {
            Format::NChwXc => write!(f, "nChw{}c", self.block)?,
            other => write!(f, "{other}")?,
        }
        write!(f, "[{d0}, {d1}, {d2}, {d3}]")
    }
}

/// Iterator over the memory offsets of a [`CpuLayout`] in logical order.
pub struct Offsets<'a> {
    layout: &'a CpuLayout,
    current: [usize; 4],
    remaining: usize,
    started: bool,
}

impl Offsets<'_> {
    fn advance(&mut self) {
        for i in (0..4).rev() {
            self.current[i] += 1;
            if self.current[i] < self.layout.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for Offsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.layout.offset(self.current))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Offsets<'_> {}
