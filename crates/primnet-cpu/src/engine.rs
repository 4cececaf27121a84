use std::sync::Arc;

use log::{debug, trace};
use primnet_core::{
    Convention, ConvDirection, Engine, Error, ExecArgs, OpDesc, OperandRole, PoolAlgorithm,
    Propagation, Result, Shape, WorkspaceArg,
};

use crate::config::CpuEngineConfig;
use crate::conv::{self, ConvLayouts};
use crate::format::{CpuLayout, Format};
use crate::pool;
use crate::reorder::reorder;
use crate::stats::{EngineStats, GuardKind, LiveGuard, StatsSnapshot};

// CpuEngine: reference execution engine
//
// Layout preference policy:
//   feature maps  -> channel-blocked when the engine has a channel block and
//                    the channel count is a multiple of it, otherwise NCHW
//   weights       -> OIHW
//   pooling dst   -> same family as pooling src
//   pooling bwd   -> exactly the forward descriptor's layouts
//
// Caller operands without a hint default to CHWN (feature maps) and IHWO
// (weights), so a caller that never states a layout pays for one reorder per
// operand.

#[derive(Debug)]
struct EngineInner {
    config: CpuEngineConfig,
    stats: Arc<EngineStats>,
}

/// CPU implementation of [`Engine`]. Cheap to clone; clones share statistics.
#[derive(Debug, Clone)]
pub struct CpuEngine {
    inner: Arc<EngineInner>,
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new(CpuEngineConfig::default())
    }
}

impl CpuEngine {
    pub fn new(config: CpuEngineConfig) -> Self {
        CpuEngine {
            inner: Arc::new(EngineInner {
                config,
                stats: Arc::new(EngineStats::default()),
            }),
        }
    }

    pub fn config(&self) -> &CpuEngineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Layout the engine prefers for a feature map of `shape`.
    fn preferred_feature_map(&self, shape: &Shape) -> Result<CpuLayout> {
        let c = shape.dims4()?[1];
        match self.inner.config.channel_block {
            Some(b) if b > 1 && c % b == 0 => CpuLayout::blocked(shape, b),
            _ => CpuLayout::new(shape, Format::Nchw),
        }
    }

    fn validate(&self, op: &OpDesc, hint: Option<&CpuPrimitiveDesc>) -> Result<()> {
        let kind = op.kind();
        match op {
            OpDesc::Convolution { desc, .. } => {
                let (kh, kw) = desc.kernel();
                if desc.padding.0 >= kh || desc.padding.1 >= kw {
                    return Err(Error::config(
                        kind,
                        format!("padding {:?} must be smaller than kernel {kh}x{kw}", desc.padding),
                    ));
                }
            }
            OpDesc::Pooling { propagation, desc } => {
                if desc.padding.0 >= desc.kernel.0 || desc.padding.1 >= desc.kernel.1 {
                    return Err(Error::config(
                        kind,
                        format!(
                            "padding {:?} must be smaller than window {:?}",
                            desc.padding, desc.kernel
                        ),
                    ));
                }
                if *propagation == Propagation::Backward {
                    let fwd = hint.ok_or_else(|| {
                        Error::config(kind, "backward pooling needs the forward descriptor as hint")
                    })?;
                    let expected = OpDesc::pool(Propagation::Forward, desc.clone());
                    if fwd.op != expected {
                        return Err(Error::config(
                            kind,
                            format!("forward hint describes {} instead of {}", fwd.op, expected),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn layouts_for(
        &self,
        op: &OpDesc,
        hint: Option<&CpuPrimitiveDesc>,
    ) -> Result<Vec<(OperandRole, CpuLayout)>> {
        use OperandRole::*;
        let mut out = Vec::with_capacity(3);
        match op {
            OpDesc::Convolution { direction, desc } => {
                let src = self.preferred_feature_map(&desc.src)?;
                let weights = CpuLayout::new(&desc.weights, Format::Oihw)?;
                let dst = self.preferred_feature_map(&desc.dst)?;
                match direction {
                    ConvDirection::Forward => {
                        out.extend([(Src, src), (Weights, weights), (Dst, dst)]);
                    }
                    ConvDirection::BackwardData => {
                        out.extend([(DiffDst, dst), (Weights, weights), (DiffSrc, src)]);
                    }
                    ConvDirection::BackwardWeights => {
                        out.extend([(DiffDst, dst), (Src, src), (DiffWeights, weights)]);
                    }
                }
            }
            OpDesc::Pooling {
                propagation: Propagation::Forward,
                desc,
            } => {
                let src = self.preferred_feature_map(&desc.src)?;
                let dst = if src.format() == Format::NChwXc {
                    CpuLayout::blocked(&desc.dst, src.block())?
                } else {
                    CpuLayout::new(&desc.dst, Format::Nchw)?
                };
                out.extend([(Src, src), (Dst, dst)]);
            }
            OpDesc::Pooling {
                propagation: Propagation::Backward,
                ..
            } => {
                let fwd = hint.ok_or_else(|| {
                    Error::config(op.kind(), "backward pooling needs the forward descriptor")
                })?;
                out.extend([
                    (DiffDst, fwd.layout(Dst)?.clone()),
                    (DiffSrc, fwd.layout(Src)?.clone()),
                ]);
            }
        }
        Ok(out)
    }

    fn check_len(role: OperandRole, layout: &CpuLayout, got: usize) -> Result<()> {
        let needed = layout.physical_size();
        if got < needed {
            return Err(Error::BufferTooSmall { role, needed, got });
        }
        Ok(())
    }

    fn run_compute(&self, pd: &CpuPrimitiveDesc, args: ExecArgs<'_>) -> Result<()> {
        use OperandRole::*;
        let parallel = self.inner.config.parallel;
        let (out_role, out) = args.output;
        let out_layout = pd.layout(out_role)?;
        Self::check_len(out_role, out_layout, out.len())?;
        let inputs = args.inputs;
        let input = |role: OperandRole| bound_input(pd, &inputs, role);

        match &pd.op {
            OpDesc::Convolution { direction, desc } => match direction {
                ConvDirection::Forward => {
                    let (sl, src) = input(Src)?;
                    let (wl, w) = input(Weights)?;
                    let l = ConvLayouts {
                        src: sl,
                        weights: wl,
                        dst: out_layout,
                    };
                    conv::forward(desc, &l, src, w, out, parallel);
                }
                ConvDirection::BackwardData => {
                    let (gl, grad) = input(DiffDst)?;
                    let (wl, w) = input(Weights)?;
                    let l = ConvLayouts {
                        src: out_layout,
                        weights: wl,
                        dst: gl,
                    };
                    conv::backward_data(desc, &l, grad, w, out, parallel);
                }
                ConvDirection::BackwardWeights => {
                    let (gl, grad) = input(DiffDst)?;
                    let (sl, src) = input(Src)?;
                    let l = ConvLayouts {
                        src: sl,
                        weights: out_layout,
                        dst: gl,
                    };
                    conv::backward_weights(desc, &l, grad, src, out, parallel);
                }
            },
            OpDesc::Pooling { propagation, desc } => {
                let ws_len = desc.dst.elem_count();
                match (desc.algorithm, propagation, args.workspace) {
                    (PoolAlgorithm::Max, Propagation::Forward, Some(WorkspaceArg::Write(ws))) => {
                        if ws.len() < ws_len {
                            return Err(Error::BufferTooSmall {
                                role: Workspace,
                                needed: ws_len,
                                got: ws.len(),
                            });
                        }
                        let (sl, src) = input(Src)?;
                        pool::forward_max(desc, sl, out_layout, src, out, ws, parallel);
                    }
                    (PoolAlgorithm::Max, Propagation::Backward, Some(WorkspaceArg::Read(ws))) => {
                        if ws.len() < ws_len {
                            return Err(Error::BufferTooSmall {
                                role: Workspace,
                                needed: ws_len,
                                got: ws.len(),
                            });
                        }
                        let (gl, grad) = input(DiffDst)?;
                        pool::backward_max(desc, gl, out_layout, grad, ws, out, parallel);
                    }
                    (PoolAlgorithm::Max, _, _) => {
                        return Err(Error::resource(
                            Workspace,
                            format!("{} needs its workspace bound", pd.op.kind()),
                        ));
                    }
                    (PoolAlgorithm::Average, Propagation::Forward, _) => {
                        let (sl, src) = input(Src)?;
                        pool::forward_avg(desc, sl, out_layout, src, out, parallel);
                    }
                    (PoolAlgorithm::Average, Propagation::Backward, _) => {
                        let (gl, grad) = input(DiffDst)?;
                        pool::backward_avg(desc, gl, out_layout, grad, out, parallel);
                    }
                }
            }
        }
        Ok(())
    }
}

fn bound_input<'a>(
    pd: &'a CpuPrimitiveDesc,
    inputs: &[(OperandRole, &'a [f32])],
    role: OperandRole,
) -> Result<(&'a CpuLayout, &'a [f32])> {
    let layout = pd.layout(role)?;
    let data = inputs
        .iter()
        .find(|(r, _)| *r == role)
        .map(|(_, d)| *d)
        .ok_or_else(|| Error::resource(role, "input not bound"))?;
    CpuEngine::check_len(role, layout, data.len())?;
    Ok((layout, data))
}

/// An operator bound to the CPU engine, with the layout chosen per role.
#[derive(Debug, Clone)]
pub struct CpuPrimitiveDesc {
    op: OpDesc,
    layouts: Vec<(OperandRole, CpuLayout)>,
    workspace_len: Option<usize>,
    _guard: LiveGuard,
}

impl CpuPrimitiveDesc {
    pub fn op(&self) -> &OpDesc {
        &self.op
    }

    pub fn layout(&self, role: OperandRole) -> Result<&CpuLayout> {
        self.layouts
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, l)| l)
            .ok_or_else(|| Error::config(self.op.kind(), format!("operator has no {role} operand")))
    }
}

#[derive(Debug)]
enum PrimitiveKind {
    Reorder { from: CpuLayout, to: CpuLayout },
    Compute(CpuPrimitiveDesc),
}

/// Executable unit created by the CPU engine.
#[derive(Debug)]
pub struct CpuPrimitive {
    kind: PrimitiveKind,
    _guard: LiveGuard,
}

impl CpuPrimitive {
    pub fn is_reorder(&self) -> bool {
        matches!(self.kind, PrimitiveKind::Reorder { .. })
    }
}

impl Engine for CpuEngine {
    type Layout = CpuLayout;
    type PrimitiveDesc = CpuPrimitiveDesc;
    type Primitive = CpuPrimitive;

    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn default_layout(&self, shape: &Shape, convention: Convention) -> Result<CpuLayout> {
        match convention {
            Convention::FeatureMap => CpuLayout::new(shape, Format::Chwn),
            Convention::Weights => CpuLayout::new(shape, Format::Ihwo),
        }
    }

    fn create_primitive_desc(
        &self,
        op: &OpDesc,
        hint: Option<&CpuPrimitiveDesc>,
    ) -> Result<CpuPrimitiveDesc> {
        self.validate(op, hint)?;
        let layouts = self.layouts_for(op, hint)?;
        let workspace_len = op.shape_of(OperandRole::Workspace).map(Shape::elem_count);
        debug!(
            "cpu: {} -> {}",
            op,
            layouts
                .iter()
                .map(|(r, l)| format!("{r}={l}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        Ok(CpuPrimitiveDesc {
            op: op.clone(),
            layouts,
            workspace_len,
            _guard: LiveGuard::new(&self.inner.stats, GuardKind::Desc),
        })
    }

    fn op_desc<'a>(&self, pd: &'a CpuPrimitiveDesc) -> &'a OpDesc {
        &pd.op
    }

    fn query_layout(&self, pd: &CpuPrimitiveDesc, role: OperandRole) -> Result<CpuLayout> {
        pd.layout(role).cloned()
    }

    fn workspace_len(&self, pd: &CpuPrimitiveDesc) -> Option<usize> {
        pd.workspace_len
    }

    fn layouts_equal(&self, a: &CpuLayout, b: &CpuLayout) -> bool {
        a == b
    }

    fn layout_shape(&self, layout: &CpuLayout) -> Shape {
        layout.shape()
    }

    fn layout_size(&self, layout: &CpuLayout) -> usize {
        layout.physical_size()
    }

    fn create_reorder(&self, from: &CpuLayout, to: &CpuLayout) -> Result<CpuPrimitive> {
        if from.dims() != to.dims() {
            return Err(Error::ShapeMismatch {
                expected: from.shape(),
                got: to.shape(),
            });
        }
        Ok(CpuPrimitive {
            kind: PrimitiveKind::Reorder {
                from: from.clone(),
                to: to.clone(),
            },
            _guard: LiveGuard::new(&self.inner.stats, GuardKind::Primitive),
        })
    }

    fn create_compute(
        &self,
        pd: &CpuPrimitiveDesc,
        inputs: &[OperandRole],
        output: OperandRole,
    ) -> Result<CpuPrimitive> {
        let kind = pd.op.kind();
        if inputs != pd.op.input_roles() || output != pd.op.output_role() {
            return Err(Error::config(
                kind,
                format!(
                    "expected inputs {:?} -> {}, got {:?} -> {}",
                    pd.op.input_roles(),
                    pd.op.output_role(),
                    inputs,
                    output
                ),
            ));
        }
        Ok(CpuPrimitive {
            kind: PrimitiveKind::Compute(pd.clone()),
            _guard: LiveGuard::new(&self.inner.stats, GuardKind::Primitive),
        })
    }

    fn execute(&self, primitive: &CpuPrimitive, args: ExecArgs<'_>) -> Result<()> {
        match &primitive.kind {
            PrimitiveKind::Reorder { from, to } => {
                let (role, src) = args.first_input()?;
                let (out_role, dst) = args.output;
                Self::check_len(role, from, src.len())?;
                Self::check_len(out_role, to, dst.len())?;
                trace!("cpu: reorder {role} {from} -> {to}");
                reorder(from, to, src, dst);
            }
            PrimitiveKind::Compute(pd) => {
                trace!("cpu: execute {}", pd.op.kind());
                self.run_compute(pd, args)?;
            }
        }
        self.inner.stats.record_execution();
        Ok(())
    }
}
