use primnet_core::{Engine, Error, OpDesc, OperandRole, PoolDesc, Propagation, Result};

use super::Assembler;
use crate::context::PoolingContext;
use crate::graph::KernelGraph;
use crate::resolve::resolve;

impl<E: Engine> Assembler<E> {
    /// Forward pooling: input `[src]`, output `dst`, plus a freshly allocated
    /// argmax workspace for max pooling.
    ///
    /// The caller `dst` follows the feature-map convention and is converted
    /// after compute when the engine prefers another layout. The returned
    /// graph carries the [`PoolingContext`] backward assembly needs.
    pub fn pool_forward(
        &self,
        desc: &PoolDesc,
        src_hint: Option<&E::Layout>,
    ) -> Result<KernelGraph<E>> {
        let op = OpDesc::pool(Propagation::Forward, desc.clone());
        let mut b = self.builder(op.kind());
        let resolved = resolve(&self.engine, &op, None)?;
        let src_layout = resolved.layout(OperandRole::Src)?.clone();
        let dst_layout = resolved.layout(OperandRole::Dst)?.clone();

        let src = b.caller_input(OperandRole::Src, &desc.src, src_hint)?;
        let dst = b.caller_output(OperandRole::Dst, &desc.dst, None)?;
        let src = b.reorder_input(src, &src_layout)?;
        let dst = b.reorder_output(dst, &dst_layout)?;

        let workspace = match resolved.workspace_len {
            Some(len) => Some(b.alloc_workspace(len)?),
            None => None,
        };
        let desc_id = b.compute(resolved, &[src], dst)?;

        let context = PoolingContext {
            desc: desc.clone(),
            pd: b.registry.desc(desc_id)?.clone(),
            src_layout,
            dst_layout,
            workspace,
        };
        b.finish(Some(context))
    }

    /// Backward pooling against a forward pass: input `[diff_dst]`, output
    /// `diff_src` bound in the forward src layout (never reordered). Max
    /// pooling reads the forward graph's workspace; nothing is reallocated.
    pub fn pool_backward(
        &self,
        ctx: &PoolingContext<E>,
        diff_dst_hint: Option<&E::Layout>,
    ) -> Result<KernelGraph<E>> {
        let op = OpDesc::pool(Propagation::Backward, ctx.desc.clone());
        let kind = op.kind();
        let forward = OpDesc::pool(Propagation::Forward, ctx.desc.clone());
        let described = self.engine.op_desc(&ctx.pd);
        if *described != forward {
            return Err(Error::config(
                kind,
                format!("context descriptor computes {described}, expected {forward}"),
            ));
        }
        let mut b = self.builder(kind);
        let resolved = resolve(&self.engine, &op, Some(&ctx.pd))?;
        let diff_dst_layout = resolved.layout(OperandRole::DiffDst)?.clone();
        let diff_src_layout = resolved.layout(OperandRole::DiffSrc)?.clone();
        if !self.engine.layouts_equal(&diff_dst_layout, &ctx.dst_layout)
            || !self.engine.layouts_equal(&diff_src_layout, &ctx.src_layout)
        {
            return Err(Error::config(
                kind,
                format!(
                    "engine chose {diff_dst_layout} / {diff_src_layout}, forward pass used {} / {}",
                    ctx.dst_layout, ctx.src_layout
                ),
            ));
        }

        let diff_dst = b.caller_input(OperandRole::DiffDst, &ctx.desc.dst, diff_dst_hint)?;
        let diff_src = b.engine_output(OperandRole::DiffSrc, &ctx.desc.src, diff_src_layout);

        if let Some(len) = resolved.workspace_len {
            let ws = ctx.workspace.as_ref().ok_or_else(|| {
                Error::resource(OperandRole::Workspace, "forward pass kept no workspace")
            })?;
            b.adopt_workspace(ws, len)?;
        }

        let diff_dst = b.reorder_input(diff_dst, &diff_dst_layout)?;
        b.compute(resolved, &[diff_dst], diff_src)?;
        b.finish(None)
    }
}
