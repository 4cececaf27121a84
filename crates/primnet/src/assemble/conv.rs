use primnet_core::{ConvDesc, ConvDirection, Engine, OpDesc, OperandRole, Result};

use super::Assembler;
use crate::graph::KernelGraph;
use crate::resolve::resolve;

impl<E: Engine> Assembler<E> {
    /// Forward convolution: inputs `[src, weights]`, output `dst`.
    ///
    /// `dst` is always bound in the engine's preferred layout, so the graph is
    /// one compute step plus a reorder for each input whose hint (or default
    /// convention) differs from what the engine wants.
    pub fn conv_forward(
        &self,
        desc: &ConvDesc,
        src_hint: Option<&E::Layout>,
        weights_hint: Option<&E::Layout>,
    ) -> Result<KernelGraph<E>> {
        let op = OpDesc::conv(ConvDirection::Forward, desc.clone());
        let mut b = self.builder(op.kind());
        let resolved = resolve(&self.engine, &op, None)?;

        let src = b.caller_input(OperandRole::Src, &desc.src, src_hint)?;
        let weights = b.caller_input(OperandRole::Weights, &desc.weights, weights_hint)?;
        let dst_layout = resolved.layout(OperandRole::Dst)?.clone();
        let dst = b.engine_output(OperandRole::Dst, &desc.dst, dst_layout);

        let src = b.reorder_input(src, resolved.layout(OperandRole::Src)?)?;
        let weights = b.reorder_input(weights, resolved.layout(OperandRole::Weights)?)?;
        b.compute(resolved, &[src, weights], dst)?;
        b.finish(None)
    }

    /// Backward-data convolution: inputs `[diff_dst, weights]`, output
    /// `diff_src` bound in the engine's layout (never reordered).
    pub fn conv_backward_data(
        &self,
        desc: &ConvDesc,
        diff_dst_hint: Option<&E::Layout>,
        weights_hint: Option<&E::Layout>,
    ) -> Result<KernelGraph<E>> {
        let op = OpDesc::conv(ConvDirection::BackwardData, desc.clone());
        let mut b = self.builder(op.kind());
        let resolved = resolve(&self.engine, &op, None)?;

        let diff_dst = b.caller_input(OperandRole::DiffDst, &desc.dst, diff_dst_hint)?;
        let weights = b.caller_input(OperandRole::Weights, &desc.weights, weights_hint)?;
        let diff_src_layout = resolved.layout(OperandRole::DiffSrc)?.clone();
        let diff_src = b.engine_output(OperandRole::DiffSrc, &desc.src, diff_src_layout);

        let diff_dst = b.reorder_input(diff_dst, resolved.layout(OperandRole::DiffDst)?)?;
        let weights = b.reorder_input(weights, resolved.layout(OperandRole::Weights)?)?;
        b.compute(resolved, &[diff_dst, weights], diff_src)?;
        b.finish(None)
    }

    /// Backward-weights convolution: inputs `[diff_dst, src]`, output
    /// `diff_weights`. The output is bound under `diff_weights_hint` (or the
    /// weights convention) and converted after compute when the engine
    /// computes in another layout.
    pub fn conv_backward_weights(
        &self,
        desc: &ConvDesc,
        diff_dst_hint: Option<&E::Layout>,
        src_hint: Option<&E::Layout>,
        diff_weights_hint: Option<&E::Layout>,
    ) -> Result<KernelGraph<E>> {
        let op = OpDesc::conv(ConvDirection::BackwardWeights, desc.clone());
        let mut b = self.builder(op.kind());
        let resolved = resolve(&self.engine, &op, None)?;

        let diff_dst = b.caller_input(OperandRole::DiffDst, &desc.dst, diff_dst_hint)?;
        let src = b.caller_input(OperandRole::Src, &desc.src, src_hint)?;
        let diff_weights =
            b.caller_output(OperandRole::DiffWeights, &desc.weights, diff_weights_hint)?;

        let diff_dst = b.reorder_input(diff_dst, resolved.layout(OperandRole::DiffDst)?)?;
        let src = b.reorder_input(src, resolved.layout(OperandRole::Src)?)?;
        let diff_weights =
            b.reorder_output(diff_weights, resolved.layout(OperandRole::DiffWeights)?)?;
        b.compute(resolved, &[diff_dst, src], diff_weights)?;
        b.finish(None)
    }
}
