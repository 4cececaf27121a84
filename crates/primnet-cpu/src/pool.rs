use primnet_core::PoolDesc;

use crate::format::CpuLayout;
use crate::reorder::{gather_sample, per_sample, scatter_sample};

// Pooling kernels
//
// Max pooling records, for every dst element in logical (N, C, OH, OW) order,
// the position of the winning element inside its window as `ki * KW + kj`.
// The backward pass routes each gradient to that position. Average pooling
// divides by the number of in-bounds elements of the window, both ways.
//
// Windows never lie entirely in the padding: descriptors reject empty spatial
// extents and engine validation keeps the padding smaller than the window.
// A NaN anywhere in a max window wins; the first one in window order is the
// recorded argmax.

/// Per-sample geometry shared by all four kernels.
#[derive(Debug, Clone, Copy)]
struct Window {
    c: usize,
    h: usize,
    w: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    oh: usize,
    ow: usize,
}

impl Window {
    fn new(desc: &PoolDesc) -> Self {
        let s = desc.src.dims();
        let d = desc.dst.dims();
        Window {
            c: s[1],
            h: s[2],
            w: s[3],
            kh: desc.kernel.0,
            kw: desc.kernel.1,
            sh: desc.stride.0,
            sw: desc.stride.1,
            ph: desc.padding.0,
            pw: desc.padding.1,
            oh: d[2],
            ow: d[3],
        }
    }

    fn dst_len(&self) -> usize {
        self.c * self.oh * self.ow
    }

    fn src_len(&self) -> usize {
        self.c * self.h * self.w
    }

    /// In-bounds taps of window (y, x) of channel `ci`: (tap index, src index).
    fn taps(&self, ci: usize, y: usize, x: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.kh).flat_map(move |ki| {
            (0..self.kw).filter_map(move |kj| {
                let ih = (y * self.sh + ki) as isize - self.ph as isize;
                let iw = (x * self.sw + kj) as isize - self.pw as isize;
                if ih >= 0 && ih < self.h as isize && iw >= 0 && iw < self.w as isize {
                    Some((ki * self.kw + kj, (ci * self.h + ih as usize) * self.w + iw as usize))
                } else {
                    None
                }
            })
        })
    }

    /// Source index of tap `tap` of window (y, x), channel `ci`.
    fn tap_src(&self, ci: usize, y: usize, x: usize, tap: usize) -> Option<usize> {
        let (ki, kj) = (tap / self.kw, tap % self.kw);
        if ki >= self.kh {
            return None;
        }
        let ih = (y * self.sh + ki) as isize - self.ph as isize;
        let iw = (x * self.sw + kj) as isize - self.pw as isize;
        if ih >= 0 && ih < self.h as isize && iw >= 0 && iw < self.w as isize {
            Some((ci * self.h + ih as usize) * self.w + iw as usize)
        } else {
            None
        }
    }
}

pub(crate) fn forward_max(
    desc: &PoolDesc,
    src_l: &CpuLayout,
    dst_l: &CpuLayout,
    src: &[f32],
    dst: &mut [f32],
    workspace: &mut [u32],
    parallel: bool,
) {
    let win = Window::new(desc);
    let n = desc.src.dims()[0];
    let tiles = per_sample(n, parallel, |ni| {
        let input = gather_sample(src_l, src, ni);
        let mut out = vec![f32::NEG_INFINITY; win.dst_len()];
        let mut arg = vec![0u32; win.dst_len()];
        for ci in 0..win.c {
            for y in 0..win.oh {
                for x in 0..win.ow {
                    let o = (ci * win.oh + y) * win.ow + x;
                    let mut seen = false;
                    for (tap, si) in win.taps(ci, y, x) {
                        let v = input[si];
                        if !seen || v > out[o] || (v.is_nan() && !out[o].is_nan()) {
                            out[o] = v;
                            arg[o] = tap as u32;
                            seen = true;
                        }
                    }
                }
            }
        }
        (out, arg)
    });
    let per = win.dst_len();
    for (ni, (out, arg)) in tiles.iter().enumerate() {
        scatter_sample(dst_l, dst, ni, out);
        workspace[ni * per..(ni + 1) * per].copy_from_slice(arg);
    }
}

pub(crate) fn forward_avg(
    desc: &PoolDesc,
    src_l: &CpuLayout,
    dst_l: &CpuLayout,
    src: &[f32],
    dst: &mut [f32],
    parallel: bool,
) {
    let win = Window::new(desc);
    let n = desc.src.dims()[0];
    let tiles = per_sample(n, parallel, |ni| {
        let input = gather_sample(src_l, src, ni);
        let mut out = vec![0.0f32; win.dst_len()];
        for ci in 0..win.c {
            for y in 0..win.oh {
                for x in 0..win.ow {
                    let (sum, count) = win
                        .taps(ci, y, x)
                        .fold((0.0f32, 0usize), |(s, c), (_, si)| (s + input[si], c + 1));
                    out[(ci * win.oh + y) * win.ow + x] =
                        if count > 0 { sum / count as f32 } else { 0.0 };
                }
            }
        }
        out
    });
    for (ni, out) in tiles.iter().enumerate() {
        scatter_sample(dst_l, dst, ni, out);
    }
}

pub(crate) fn backward_max(
    desc: &PoolDesc,
    diff_dst_l: &CpuLayout,
    diff_src_l: &CpuLayout,
    diff_dst: &[f32],
    workspace: &[u32],
    diff_src: &mut [f32],
    parallel: bool,
) {
    let win = Window::new(desc);
    let n = desc.src.dims()[0];
    let per = win.dst_len();
    let tiles = per_sample(n, parallel, |ni| {
        let grad = gather_sample(diff_dst_l, diff_dst, ni);
        let arg = &workspace[ni * per..(ni + 1) * per];
        let mut out = vec![0.0f32; win.src_len()];
        for ci in 0..win.c {
            for y in 0..win.oh {
                for x in 0..win.ow {
                    let o = (ci * win.oh + y) * win.ow + x;
                    if let Some(si) = win.tap_src(ci, y, x, arg[o] as usize) {
                        out[si] += grad[o];
                    }
                }
            }
        }
        out
    });
    for (ni, out) in tiles.iter().enumerate() {
        scatter_sample(diff_src_l, diff_src, ni, out);
    }
}

pub(crate) fn backward_avg(
    desc: &PoolDesc,
    diff_dst_l: &CpuLayout,
    diff_src_l: &CpuLayout,
    diff_dst: &[f32],
    diff_src: &mut [f32],
    parallel: bool,
) {
    let win = Window::new(desc);
    let n = desc.src.dims()[0];
    let tiles = per_sample(n, parallel, |ni| {
        let grad = gather_sample(diff_dst_l, diff_dst, ni);
        let mut out = vec![0.0f32; win.src_len()];
        for ci in 0..win.c {
            for y in 0..win.oh {
                for x in 0..win.ow {
                    let g = grad[(ci * win.oh + y) * win.ow + x];
                    let count = win.taps(ci, y, x).count();
                    if count == 0 {
                        continue;
                    }
                    let share = g / count as f32;
                    for (_, si) in win.taps(ci, y, x) {
                        out[si] += share;
                    }
                }
            }
        }
        out
    });
    for (ni, out) in tiles.iter().enumerate() {
        scatter_sample(diff_src_l, diff_src, ni, out);
    }
}
