use rayon::prelude::*;

use crate::format::CpuLayout;

// Moving data between layouts
//
// A reorder visits every logical element once and copies it from its offset
// under the source layout to its offset under the destination layout. The
// gather/scatter helpers do the same for a single sample so kernels can work
// on contiguous row-major tiles whatever the operand layouts are.

/// Copy `src` (arranged as `from`) into `dst` (arranged as `to`).
pub(crate) fn reorder(from: &CpuLayout, to: &CpuLayout, src: &[f32], dst: &mut [f32]) {
    for (s, d) in from.offsets().zip(to.offsets()) {
        dst[d] = src[s];
    }
}

/// Sample `i0` of `data` as a contiguous `[d1, d2, d3]` tile.
pub(crate) fn gather_sample(layout: &CpuLayout, data: &[f32], i0: usize) -> Vec<f32> {
    layout.sample_offsets(i0).map(|o| data[o]).collect()
}

/// The whole operand as a contiguous row-major buffer.
pub(crate) fn gather(layout: &CpuLayout, data: &[f32]) -> Vec<f32> {
    layout.offsets().map(|o| data[o]).collect()
}

pub(crate) fn scatter_sample(layout: &CpuLayout, data: &mut [f32], i0: usize, tile: &[f32]) {
    for (o, &v) in layout.sample_offsets(i0).zip(tile) {
        data[o] = v;
    }
}

pub(crate) fn scatter(layout: &CpuLayout, data: &mut [f32], values: &[f32]) {
    for (o, &v) in layout.offsets().zip(values) {
        data[o] = v;
    }
}

/// Run `f` once per sample, on the rayon pool when `parallel` is set.
pub(crate) fn per_sample<T, F>(n: usize, parallel: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if parallel && n > 1 {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}
