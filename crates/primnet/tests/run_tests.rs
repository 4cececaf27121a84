// Kernel runner tests: every operator variant replayed on caller buffers in
// non-default layouts and checked against naive NCHW loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use primnet::prelude::*;
use primnet::{Convention, ExecArgs, OpDesc};
use primnet_cpu::{CpuPrimitive, CpuPrimitiveDesc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Helpers

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn assert_close(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (x, y)) in got.iter().zip(expected.iter()).enumerate() {
        assert!((x - y).abs() < tol, "elem {}: {} vs {} (tol={})", i, x, y, tol);
    }
}

fn random(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn nchw(shape: &Shape) -> CpuLayout {
    CpuLayout::new(shape, Format::Nchw).unwrap()
}

/// Arrange logical NCHW data as `to`.
fn to_layout(engine: &CpuEngine, data: &[f32], to: &CpuLayout) -> Vec<f32> {
    let from = nchw(&to.shape());
    let prim = engine.create_reorder(&from, to).unwrap();
    let mut out = vec![0.0; to.physical_size()];
    engine
        .execute(
            &prim,
            ExecArgs::new(OperandRole::Src, &mut out).with_input(OperandRole::Src, data),
        )
        .unwrap();
    out
}

/// Read a buffer arranged as `from` back into logical NCHW order.
fn from_layout(engine: &CpuEngine, data: &[f32], from: &CpuLayout) -> Vec<f32> {
    let to = nchw(&from.shape());
    let prim = engine.create_reorder(from, &to).unwrap();
    let mut out = vec![0.0; to.physical_size()];
    engine
        .execute(
            &prim,
            ExecArgs::new(OperandRole::Dst, &mut out).with_input(OperandRole::Dst, data),
        )
        .unwrap();
    out
}

fn idx(dims: [usize; 4], i: [usize; 4]) -> usize {
    ((i[0] * dims[1] + i[1]) * dims[2] + i[2]) * dims[3] + i[3]
}

/// Calls `f(n, c, y, x, ki, kj, ih, iw)` for every in-bounds input position under
/// every output position of a sliding window.
fn for_each_window(
    src: [usize; 4],
    dst: [usize; 4],
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    mut f: impl FnMut(usize, usize, usize, usize, usize, usize, usize, usize),
) {
    for ni in 0..dst[0] {
        for ci in 0..dst[1] {
            for y in 0..dst[2] {
                for x in 0..dst[3] {
                    for ki in 0..kernel.0 {
                        for kj in 0..kernel.1 {
                            let ih = (y * stride.0 + ki) as isize - padding.0 as isize;
                            let iw = (x * stride.1 + kj) as isize - padding.1 as isize;
                            if ih < 0 || iw < 0 || ih >= src[2] as isize || iw >= src[3] as isize {
                                continue;
                            }
                            f(ni, ci, y, x, ki, kj, ih as usize, iw as usize);
                        }
                    }
                }
            }
        }
    }
}

fn naive_conv(desc: &ConvDesc, src: &[f32], w: &[f32]) -> Vec<f32> {
    let s = desc.src.dims4().unwrap();
    let wd = desc.weights.dims4().unwrap();
    let d = desc.dst.dims4().unwrap();
    let mut out = vec![0.0f32; desc.dst.elem_count()];
    for_each_window(s, d, desc.kernel(), desc.stride, desc.padding, |n, o, y, x, ki, kj, ih, iw| {
        for c in 0..s[1] {
            out[idx(d, [n, o, y, x])] += src[idx(s, [n, c, ih, iw])] * w[idx(wd, [o, c, ki, kj])];
        }
    });
    out
}

fn naive_conv_backward_data(desc: &ConvDesc, diff_dst: &[f32], w: &[f32]) -> Vec<f32> {
    let s = desc.src.dims4().unwrap();
    let wd = desc.weights.dims4().unwrap();
    let d = desc.dst.dims4().unwrap();
    let mut out = vec![0.0f32; desc.src.elem_count()];
    for_each_window(s, d, desc.kernel(), desc.stride, desc.padding, |n, o, y, x, ki, kj, ih, iw| {
        for c in 0..s[1] {
            out[idx(s, [n, c, ih, iw])] += w[idx(wd, [o, c, ki, kj])] * diff_dst[idx(d, [n, o, y, x])];
        }
    });
    out
}

fn naive_conv_backward_weights(desc: &ConvDesc, diff_dst: &[f32], src: &[f32]) -> Vec<f32> {
    let s = desc.src.dims4().unwrap();
    let wd = desc.weights.dims4().unwrap();
    let d = desc.dst.dims4().unwrap();
    let mut out = vec![0.0f32; desc.weights.elem_count()];
    for_each_window(s, d, desc.kernel(), desc.stride, desc.padding, |n, o, y, x, ki, kj, ih, iw| {
        for c in 0..s[1] {
            out[idx(wd, [o, c, ki, kj])] += src[idx(s, [n, c, ih, iw])] * diff_dst[idx(d, [n, o, y, x])];
        }
    });
    out
}

/// Max pooling forward plus the flat NCHW src index of every winner.
fn naive_max_pool(desc: &PoolDesc, src: &[f32]) -> (Vec<f32>, Vec<usize>) {
    let s = desc.src.dims4().unwrap();
    let d = desc.dst.dims4().unwrap();
    let mut out = vec![f32::NEG_INFINITY; desc.dst.elem_count()];
    let mut arg = vec![0usize; desc.dst.elem_count()];
    for_each_window(s, d, desc.kernel, desc.stride, desc.padding, |n, c, y, x, _, _, ih, iw| {
        let o = idx(d, [n, c, y, x]);
        let i = idx(s, [n, c, ih, iw]);
        if src[i] > out[o] {
            out[o] = src[i];
            arg[o] = i;
        }
    });
    (out, arg)
}

fn naive_avg_pool(desc: &PoolDesc, src: &[f32]) -> Vec<f32> {
    let s = desc.src.dims4().unwrap();
    let d = desc.dst.dims4().unwrap();
    let mut sum = vec![0.0f32; desc.dst.elem_count()];
    let mut count = vec![0usize; desc.dst.elem_count()];
    for_each_window(s, d, desc.kernel, desc.stride, desc.padding, |n, c, y, x, _, _, ih, iw| {
        let o = idx(d, [n, c, y, x]);
        sum[o] += src[idx(s, [n, c, ih, iw])];
        count[o] += 1;
    });
    sum.iter().zip(&count).map(|(s, &n)| s / n as f32).collect()
}

fn naive_avg_pool_backward(desc: &PoolDesc, diff_dst: &[f32]) -> Vec<f32> {
    let s = desc.src.dims4().unwrap();
    let d = desc.dst.dims4().unwrap();
    let mut count = vec![0usize; desc.dst.elem_count()];
    for_each_window(s, d, desc.kernel, desc.stride, desc.padding, |n, c, y, x, _, _, _, _| {
        count[idx(d, [n, c, y, x])] += 1;
    });
    let mut out = vec![0.0f32; desc.src.elem_count()];
    for_each_window(s, d, desc.kernel, desc.stride, desc.padding, |n, c, y, x, _, _, ih, iw| {
        let o = idx(d, [n, c, y, x]);
        out[idx(s, [n, c, ih, iw])] += diff_dst[o] / count[o] as f32;
    });
    out
}

fn conv_desc() -> ConvDesc {
    ConvDesc::new((2, 8, 5, 5), (16, 8, 3, 3), (1, 1), (1, 1)).unwrap()
}

// Convolution

#[test]
fn test_conv_forward_default_layouts() {
    init_logging();
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = conv_desc();
    let mut g = asm.conv_forward(&desc, None, None).unwrap();
    assert_eq!(g.reorder_count(), 2);

    let src = random(desc.src.elem_count(), 1);
    let w = random(desc.weights.elem_count(), 2);
    let src_buf = to_layout(&engine, &src, g.caller_layout(OperandRole::Src).unwrap());
    let w_buf = to_layout(&engine, &w, g.caller_layout(OperandRole::Weights).unwrap());
    let mut dst_buf = vec![0.0; g.output_size()];
    g.run_conv_fprop(&src_buf, &w_buf, &mut dst_buf).unwrap();

    let got = from_layout(&engine, &dst_buf, g.output_layout());
    assert_close(&got, &naive_conv(&desc, &src, &w), 1e-4);
}

#[test]
fn test_conv_forward_strided_nhwc() {
    let engine = CpuEngine::new(CpuEngineConfig::default().with_parallel(false));
    let asm = Assembler::new(engine.clone());
    let desc = ConvDesc::new((3, 4, 7, 6), (5, 4, 3, 2), (2, 2), (1, 0)).unwrap();
    let src_layout = CpuLayout::new(&desc.src, Format::Nhwc).unwrap();
    let w_layout = CpuLayout::new(&desc.weights, Format::Hwio).unwrap();
    let mut g = asm
        .conv_forward(&desc, Some(&src_layout), Some(&w_layout))
        .unwrap();

    let src = random(desc.src.elem_count(), 3);
    let w = random(desc.weights.elem_count(), 4);
    let src_buf = to_layout(&engine, &src, &src_layout);
    let w_buf = to_layout(&engine, &w, &w_layout);
    let mut dst_buf = vec![0.0; g.output_size()];
    g.run(&[&src_buf, &w_buf], &mut dst_buf).unwrap();

    let got = from_layout(&engine, &dst_buf, g.output_layout());
    assert_close(&got, &naive_conv(&desc, &src, &w), 1e-4);
}

#[test]
fn test_conv_backward_data_default_layouts() {
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = conv_desc();
    let mut g = asm.conv_backward_data(&desc, None, None).unwrap();

    let dd = random(desc.dst.elem_count(), 5);
    let w = random(desc.weights.elem_count(), 6);
    let dd_buf = to_layout(&engine, &dd, g.caller_layout(OperandRole::DiffDst).unwrap());
    let w_buf = to_layout(&engine, &w, g.caller_layout(OperandRole::Weights).unwrap());
    let mut ds_buf = vec![0.0; g.output_size()];
    g.run_conv_bprop_data(&dd_buf, &w_buf, &mut ds_buf).unwrap();

    let got = from_layout(&engine, &ds_buf, g.output_layout());
    assert_close(&got, &naive_conv_backward_data(&desc, &dd, &w), 1e-4);
}

#[test]
fn test_conv_backward_weights_output_reorder() {
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = conv_desc();
    let mut g = asm.conv_backward_weights(&desc, None, None, None).unwrap();
    assert!(g.steps().last().unwrap().is_reorder());
    assert_eq!(g.output_layout().format(), Format::Ihwo);

    let dd = random(desc.dst.elem_count(), 7);
    let src = random(desc.src.elem_count(), 8);
    let dd_buf = to_layout(&engine, &dd, g.caller_layout(OperandRole::DiffDst).unwrap());
    let src_buf = to_layout(&engine, &src, g.caller_layout(OperandRole::Src).unwrap());
    let mut dw_buf = vec![0.0; g.output_size()];
    g.run_conv_bprop_weights(&dd_buf, &mut dw_buf, &src_buf).unwrap();

    let got = from_layout(&engine, &dw_buf, g.output_layout());
    assert_close(&got, &naive_conv_backward_weights(&desc, &dd, &src), 1e-3);
}

// Pooling

#[test]
fn test_max_pool_round_trip_through_workspace() {
    init_logging();
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = PoolDesc::new(PoolAlgorithm::Max, (2, 8, 4, 4), (2, 2), (2, 2), (0, 0)).unwrap();
    let mut fwd = asm.pool_forward(&desc, None).unwrap();
    let mut bwd = asm
        .pool_backward(fwd.pooling_context().unwrap(), None)
        .unwrap();

    let src = random(desc.src.elem_count(), 9);
    let src_buf = to_layout(&engine, &src, fwd.caller_layout(OperandRole::Src).unwrap());
    let mut dst_buf = vec![0.0; fwd.output_size()];
    fwd.run_pool_fprop(&src_buf, &mut dst_buf).unwrap();

    let (expected, argmax) = naive_max_pool(&desc, &src);
    let got = from_layout(&engine, &dst_buf, fwd.output_layout());
    assert_close(&got, &expected, 1e-6);

    let dd = random(desc.dst.elem_count(), 10);
    let dd_buf = to_layout(&engine, &dd, bwd.caller_layout(OperandRole::DiffDst).unwrap());
    let mut ds_buf = vec![0.0; bwd.output_size()];
    bwd.run_pool_bprop(&dd_buf, &mut ds_buf).unwrap();

    let mut expected = vec![0.0f32; desc.src.elem_count()];
    for (o, &i) in argmax.iter().enumerate() {
        expected[i] += dd[o];
    }
    let got = from_layout(&engine, &ds_buf, bwd.output_layout());
    assert_close(&got, &expected, 1e-6);
}

#[test]
fn test_avg_pool_excludes_padding() {
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc =
        PoolDesc::new(PoolAlgorithm::Average, (1, 3, 5, 5), (3, 3), (2, 2), (1, 1)).unwrap();
    let mut fwd = asm.pool_forward(&desc, None).unwrap();
    let mut bwd = asm
        .pool_backward(fwd.pooling_context().unwrap(), None)
        .unwrap();

    let src = random(desc.src.elem_count(), 11);
    let src_buf = to_layout(&engine, &src, fwd.caller_layout(OperandRole::Src).unwrap());
    let mut dst_buf = vec![0.0; fwd.output_size()];
    fwd.run_pool_fprop(&src_buf, &mut dst_buf).unwrap();
    let got = from_layout(&engine, &dst_buf, fwd.output_layout());
    assert_close(&got, &naive_avg_pool(&desc, &src), 1e-5);

    let dd = random(desc.dst.elem_count(), 12);
    let dd_buf = to_layout(&engine, &dd, bwd.caller_layout(OperandRole::DiffDst).unwrap());
    let mut ds_buf = vec![0.0; bwd.output_size()];
    bwd.run_pool_bprop(&dd_buf, &mut ds_buf).unwrap();
    let got = from_layout(&engine, &ds_buf, bwd.output_layout());
    assert_close(&got, &naive_avg_pool_backward(&desc, &dd), 1e-5);
}

// Rebinding

#[test]
fn test_rerun_rebinds_buffers_without_reassembly() {
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = conv_desc();
    let mut g = asm.conv_forward(&desc, None, None).unwrap();
    let labels: Vec<String> = g.steps().iter().map(|s| s.label()).collect();
    let layouts: Vec<CpuLayout> = g.input_layouts().into_iter().cloned().collect();
    let w = random(desc.weights.elem_count(), 13);
    let w_buf = to_layout(&engine, &w, &layouts[1]);

    for seed in [14, 15] {
        let src = random(desc.src.elem_count(), seed);
        let src_buf = to_layout(&engine, &src, &layouts[0]);
        let mut dst_buf = vec![0.0; g.output_size()];
        g.run_conv_fprop(&src_buf, &w_buf, &mut dst_buf).unwrap();

        assert_eq!(
            g.operand(OperandRole::Src).unwrap().handle(),
            Some(src_buf.as_ptr() as usize)
        );
        assert_eq!(
            g.operand(OperandRole::Dst).unwrap().handle(),
            Some(dst_buf.as_ptr() as usize)
        );
        let got = from_layout(&engine, &dst_buf, g.output_layout());
        assert_close(&got, &naive_conv(&desc, &src, &w), 1e-4);
    }

    let after: Vec<String> = g.steps().iter().map(|s| s.label()).collect();
    assert_eq!(labels, after);
    let after: Vec<CpuLayout> = g.input_layouts().into_iter().cloned().collect();
    assert_eq!(layouts, after);
    assert!(g.internal_operand(OperandRole::Src).unwrap().handle().is_none());
}

#[test]
fn test_independent_graphs_run_on_separate_threads() {
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = conv_desc();
    let handles: Vec<_> = (0..2u64)
        .map(|seed| {
            let mut g = asm.conv_forward(&desc, None, None).unwrap();
            let engine = engine.clone();
            let desc = desc.clone();
            std::thread::spawn(move || {
                let src = random(desc.src.elem_count(), seed);
                let w = random(desc.weights.elem_count(), seed + 100);
                let src_buf = to_layout(&engine, &src, g.caller_layout(OperandRole::Src).unwrap());
                let w_buf = to_layout(&engine, &w, g.caller_layout(OperandRole::Weights).unwrap());
                let mut dst_buf = vec![0.0; g.output_size()];
                g.run_conv_fprop(&src_buf, &w_buf, &mut dst_buf).unwrap();
                let got = from_layout(&engine, &dst_buf, g.output_layout());
                assert_close(&got, &naive_conv(&desc, &src, &w), 1e-4);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

// Failures

#[test]
fn test_short_buffer_rejected_before_any_step() {
    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());
    let desc = conv_desc();
    let mut g = asm.conv_forward(&desc, None, None).unwrap();
    let before = engine.stats().executions;

    let src = vec![0.0; g.input_size(0).unwrap() - 1];
    let w = vec![0.0; g.input_size(1).unwrap()];
    let mut dst = vec![0.0; g.output_size()];
    let err = g.run_conv_fprop(&src, &w, &mut dst).unwrap_err();
    match err {
        Error::BufferTooSmall { role, needed, got } => {
            assert_eq!(role, OperandRole::Src);
            assert_eq!(needed, got + 1);
        }
        other => panic!("expected BufferTooSmall, got {other}"),
    }
    assert_eq!(engine.stats().executions, before);
}

#[test]
fn test_wrong_entry_point_and_input_count() {
    let asm = Assembler::new(CpuEngine::default());
    let desc = PoolDesc::new(PoolAlgorithm::Max, (1, 2, 4, 4), (2, 2), (2, 2), (0, 0)).unwrap();
    let mut g = asm.pool_forward(&desc, None).unwrap();
    let src = vec![0.0; g.input_size(0).unwrap()];
    let mut dst = vec![0.0; g.output_size()];

    assert!(g.run_pool_bprop(&src, &mut dst).is_err());
    assert!(g.run_conv_bprop_data(&src, &src, &mut dst).is_err());
    assert!(g.run(&[&src, &src], &mut dst).is_err());
    g.run_pool_fprop(&src, &mut dst).unwrap();
}

#[test]
fn test_run_profiled_times_every_step() {
    let asm = Assembler::new(CpuEngine::default());
    let desc = conv_desc();
    let mut g = asm.conv_forward(&desc, None, None).unwrap();
    let src = random(g.input_size(0).unwrap(), 16);
    let w = random(g.input_size(1).unwrap(), 17);
    let mut dst = vec![0.0; g.output_size()];

    let profile = g.run_profiled(&[&src, &w], &mut dst).unwrap();
    assert_eq!(profile.steps.len(), g.steps().len());
    for (timing, step) in profile.steps.iter().zip(g.steps()) {
        assert_eq!(timing.label, step.label());
    }
    assert!(profile.total >= profile.compute_time());
}

/// Delegates to the CPU engine but fails compute execution on demand.
#[derive(Debug, Clone)]
struct FlakyEngine {
    inner: CpuEngine,
    fail_compute: Arc<AtomicBool>,
}

impl Engine for FlakyEngine {
    type Layout = CpuLayout;
    type PrimitiveDesc = CpuPrimitiveDesc;
    type Primitive = CpuPrimitive;

    fn name(&self) -> String {
        "flaky".to_string()
    }

    fn default_layout(&self, shape: &Shape, convention: Convention) -> Result<CpuLayout> {
        self.inner.default_layout(shape, convention)
    }

    fn create_primitive_desc(
        &self,
        op: &OpDesc,
        hint: Option<&CpuPrimitiveDesc>,
    ) -> Result<CpuPrimitiveDesc> {
        self.inner.create_primitive_desc(op, hint)
    }

    fn op_desc<'a>(&self, pd: &'a CpuPrimitiveDesc) -> &'a OpDesc {
        self.inner.op_desc(pd)
    }

    fn query_layout(&self, pd: &CpuPrimitiveDesc, role: OperandRole) -> Result<CpuLayout> {
        self.inner.query_layout(pd, role)
    }

    fn workspace_len(&self, pd: &CpuPrimitiveDesc) -> Option<usize> {
        self.inner.workspace_len(pd)
    }

    fn layouts_equal(&self, a: &CpuLayout, b: &CpuLayout) -> bool {
        self.inner.layouts_equal(a, b)
    }

    fn layout_shape(&self, layout: &CpuLayout) -> Shape {
        self.inner.layout_shape(layout)
    }

    fn layout_size(&self, layout: &CpuLayout) -> usize {
        self.inner.layout_size(layout)
    }

    fn create_reorder(&self, from: &CpuLayout, to: &CpuLayout) -> Result<CpuPrimitive> {
        self.inner.create_reorder(from, to)
    }

    fn create_compute(
        &self,
        pd: &CpuPrimitiveDesc,
        inputs: &[OperandRole],
        output: OperandRole,
    ) -> Result<CpuPrimitive> {
        self.inner.create_compute(pd, inputs, output)
    }

    fn execute(&self, primitive: &CpuPrimitive, args: ExecArgs<'_>) -> Result<()> {
        if !primitive.is_reorder() && self.fail_compute.load(Ordering::SeqCst) {
            return Err(Error::msg("injected compute failure"));
        }
        self.inner.execute(primitive, args)
    }
}

#[test]
fn test_failing_step_reports_index_and_label() {
    init_logging();
    let cpu = CpuEngine::default();
    let flaky = FlakyEngine {
        inner: cpu.clone(),
        fail_compute: Arc::new(AtomicBool::new(false)),
    };
    let asm = Assembler::new(flaky.clone());
    let desc = conv_desc();
    let mut g = asm.conv_forward(&desc, None, None).unwrap();
    assert!(g.to_string().contains(" on flaky:"));

    let src = random(g.input_size(0).unwrap(), 18);
    let w = random(g.input_size(1).unwrap(), 19);
    let mut dst = vec![0.0; g.output_size()];
    g.run_conv_fprop(&src, &w, &mut dst).unwrap();

    flaky.fail_compute.store(true, Ordering::SeqCst);
    let err = g.run_conv_fprop(&src, &w, &mut dst).unwrap_err();
    assert!(err.is_execution(), "{err}");
    match &err {
        Error::Execution {
            step,
            label,
            source,
        } => {
            assert_eq!(*step, 2);
            assert_eq!(label, "compute conv.forward");
            assert!(source.to_string().contains("injected"));
        }
        other => panic!("unexpected error {other}"),
    }

    // The graph stays usable once the engine recovers.
    flaky.fail_compute.store(false, Ordering::SeqCst);
    g.run_conv_fprop(&src, &w, &mut dst).unwrap();
    assert_eq!(g.scratch_elements(), 2 * 8 * 5 * 5 + 16 * 8 * 3 * 3);

    drop(g);
    assert_eq!(cpu.stats().primitives_live, 0);
}
