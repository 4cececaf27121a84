use primnet_core::ConvDesc;

use crate::format::CpuLayout;
use crate::gemm::{col2im, gemm, gemm_a_bt, gemm_at_b, im2col, Geometry};
use crate::reorder::{gather, gather_sample, per_sample, scatter, scatter_sample};

// Convolution kernels
//
//   forward:          dst[n]   = W × im2col(src[n])
//   backward data:    diff_src[n] = col2im(Wᵀ × diff_dst[n])
//   backward weights: diff_W   = Σ_n diff_dst[n] × im2col(src[n])ᵀ
//
// W is the weights operand viewed as [O, C * KH * KW]. Each sample is gathered
// into a contiguous tile, computed independently, and scattered back through
// the output layout.

/// Layouts of the three operands of a convolution, whichever direction.
pub(crate) struct ConvLayouts<'a> {
    /// src (forward, backward weights) or diff_src (backward data).
    pub src: &'a CpuLayout,
    /// weights or diff_weights.
    pub weights: &'a CpuLayout,
    /// dst (forward) or diff_dst (backward passes).
    pub dst: &'a CpuLayout,
}

fn geometry(desc: &ConvDesc) -> Geometry {
    let s = desc.src.dims();
    let w = desc.weights.dims();
    let d = desc.dst.dims();
    Geometry {
        c: s[1],
        h: s[2],
        w: s[3],
        kh: w[2],
        kw: w[3],
        sh: desc.stride.0,
        sw: desc.stride.1,
        ph: desc.padding.0,
        pw: desc.padding.1,
        oh: d[2],
        ow: d[3],
    }
}

pub(crate) fn forward(
    desc: &ConvDesc,
    l: &ConvLayouts<'_>,
    src: &[f32],
    weights: &[f32],
    dst: &mut [f32],
    parallel: bool,
) {
    let g = geometry(desc);
    let n = desc.src.dims()[0];
    let o = desc.weights.dims()[0];
    let w = gather(l.weights, weights);

    let tiles = per_sample(n, parallel, |ni| {
        let input = gather_sample(l.src, src, ni);
        let mut columns = vec![0.0f32; g.col_rows() * g.col_cols()];
        im2col(&input, &g, &mut columns);
        let mut out = vec![0.0f32; o * g.col_cols()];
        gemm(&w, &columns, &mut out, o, g.col_cols(), g.col_rows());
        out
    });
    for (ni, tile) in tiles.iter().enumerate() {
        scatter_sample(l.dst, dst, ni, tile);
    }
}

pub(crate) fn backward_data(
    desc: &ConvDesc,
    l: &ConvLayouts<'_>,
    diff_dst: &[f32],
    weights: &[f32],
    diff_src: &mut [f32],
    parallel: bool,
) {
    let g = geometry(desc);
    let n = desc.src.dims()[0];
    let o = desc.weights.dims()[0];
    let w = gather(l.weights, weights);

    let tiles = per_sample(n, parallel, |ni| {
        let grad = gather_sample(l.dst, diff_dst, ni);
        let mut columns = vec![0.0f32; g.col_rows() * g.col_cols()];
        gemm_at_b(&w, &grad, &mut columns, g.col_rows(), g.col_cols(), o);
        let mut out = vec![0.0f32; g.c * g.h * g.w];
        col2im(&columns, &g, &mut out);
        out
    });
    for (ni, tile) in tiles.iter().enumerate() {
        scatter_sample(l.src, diff_src, ni, tile);
    }
}

pub(crate) fn backward_weights(
    desc: &ConvDesc,
    l: &ConvLayouts<'_>,
    diff_dst: &[f32],
    src: &[f32],
    diff_weights: &mut [f32],
    parallel: bool,
) {
    let g = geometry(desc);
    let n = desc.src.dims()[0];
    let o = desc.weights.dims()[0];
    let wsize = o * g.col_rows();

    let partials = per_sample(n, parallel, |ni| {
        let input = gather_sample(l.src, src, ni);
        let grad = gather_sample(l.dst, diff_dst, ni);
        let mut columns = vec![0.0f32; g.col_rows() * g.col_cols()];
        im2col(&input, &g, &mut columns);
        let mut dw = vec![0.0f32; wsize];
        gemm_a_bt(&grad, &columns, &mut dw, o, g.col_rows(), g.col_cols());
        dw
    });

    let mut total = vec![0.0f32; wsize];
    for dw in &partials {
        for (t, v) in total.iter_mut().zip(dw) {
            *t += v;
        }
    }
    scatter(l.weights, diff_weights, &total);
}
