// Dense helpers shared by the convolution kernels
//
// im2col lays every sliding-window patch of one sample out as a column, which
// turns convolution into one GEMM:
//
//   columns = im2col(src)        [C * KH * KW, OH * OW]
//   dst     = weights × columns  [O, OH * OW]
//
// col2im scatters columns back into an image, accumulating overlaps. All
// buffers here are contiguous row-major; callers gather from and scatter to
// the operand layouts.

/// Spatial geometry of one convolution sample.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub kh: usize,
    pub kw: usize,
    pub sh: usize,
    pub sw: usize,
    pub ph: usize,
    pub pw: usize,
    pub oh: usize,
    pub ow: usize,
}

impl Geometry {
    pub fn col_rows(&self) -> usize {
        self.c * self.kh * self.kw
    }

    pub fn col_cols(&self) -> usize {
        self.oh * self.ow
    }

    /// Input coordinate covered by kernel tap (ki, kj) of output (y, x).
    #[inline]
    pub fn input_pos(&self, y: usize, x: usize, ki: usize, kj: usize) -> Option<(usize, usize)> {
        let ih = (y * self.sh + ki) as isize - self.ph as isize;
        let iw = (x * self.sw + kj) as isize - self.pw as isize;
        if ih >= 0 && ih < self.h as isize && iw >= 0 && iw < self.w as isize {
            Some((ih as usize, iw as usize))
        } else {
            None
        }
    }
}

/// Unroll one `[C, H, W]` sample into `[C * KH * KW, OH * OW]` columns.
pub(crate) fn im2col(input: &[f32], g: &Geometry, columns: &mut [f32]) {
    let col_cols = g.col_cols();
    for ci in 0..g.c {
        for ki in 0..g.kh {
            for kj in 0..g.kw {
                let row_offset = ((ci * g.kh + ki) * g.kw + kj) * col_cols;
                for y in 0..g.oh {
                    for x in 0..g.ow {
                        columns[row_offset + y * g.ow + x] = match g.input_pos(y, x, ki, kj) {
                            Some((ih, iw)) => input[(ci * g.h + ih) * g.w + iw],
                            None => 0.0,
                        };
                    }
                }
            }
        }
    }
}

/// Scatter-add columns back into a zeroed `[C, H, W]` sample.
pub(crate) fn col2im(columns: &[f32], g: &Geometry, output: &mut [f32]) {
    let col_cols = g.col_cols();
    for ci in 0..g.c {
        for ki in 0..g.kh {
            for kj in 0..g.kw {
                let row_offset = ((ci * g.kh + ki) * g.kw + kj) * col_cols;
                for y in 0..g.oh {
                    for x in 0..g.ow {
                        if let Some((ih, iw)) = g.input_pos(y, x, ki, kj) {
                            output[(ci * g.h + ih) * g.w + iw] += columns[row_offset + y * g.ow + x];
                        }
                    }
                }
            }
        }
    }
}

/// C += A × B with A: [m, k], B: [k, n], C: [m, n].
pub(crate) fn gemm(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[a_row + p];
            if a_val == 0.0 {
                continue;
            }
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] += a_val * b[b_row + j];
            }
        }
    }
}

/// C += Aᵀ × B with A: [k, m], B: [k, n], C: [m, n].
pub(crate) fn gemm_at_b(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[p * m + i];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] += a_val * b[b_row + j];
            }
        }
    }
}

/// C += A × Bᵀ with A: [m, k], B: [n, k], C: [m, n].
pub(crate) fn gemm_a_bt(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for j in 0..n {
            let b_row = j * k;
            let mut val = 0.0f32;
            for p in 0..k {
                val += a[a_row + p] * b[b_row + p];
            }
            c[c_row + j] += val;
        }
    }
}
