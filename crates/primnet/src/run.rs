use std::time::Instant;

use log::{error, trace};
use primnet_core::{
    bail, ConvDirection, Engine, Error, ExecArgs, OpKind, OperandRole, Propagation, Result,
    WorkspaceArg,
};

use crate::binding::{Operand, OperandId, Port, Storage};
use crate::graph::{KernelGraph, Step, WorkspaceAccess};
use crate::profile::{RunProfile, StepTiming};
use crate::registry::Registry;
use crate::workspace::Workspace;

// Kernel runner
//
// A run records the caller's buffer addresses on the caller-facing operands
// and replays the step list in order. Steps communicate only through the
// buffers wired at assembly time: an input reorder fills a scratch buffer the
// compute step reads, the compute step fills a scratch buffer an output
// reorder drains. The first failing step aborts the run.

/// Everything a step needs besides the graph's fixed tables.
struct Buffers<'r, 'a> {
    inputs: &'r [&'a [f32]],
    output: &'r mut [f32],
}

impl<E: Engine> KernelGraph<E> {
    /// Replay the graph on fresh caller buffers.
    ///
    /// `inputs` follow the graph's input order; each buffer must hold at least
    /// the physical size of the layout it was bound under.
    pub fn run(&mut self, inputs: &[&[f32]], output: &mut [f32]) -> Result<()> {
        self.replay(inputs, output, |_| {})
    }

    /// Like [`KernelGraph::run`], timing every step.
    pub fn run_profiled(&mut self, inputs: &[&[f32]], output: &mut [f32]) -> Result<RunProfile> {
        let start = Instant::now();
        let mut steps = Vec::with_capacity(self.steps.len());
        self.replay(inputs, output, |t| steps.push(t))?;
        Ok(RunProfile {
            steps,
            total: start.elapsed(),
        })
    }

    /// Forward convolution on `src` and `weights`, writing `dst`.
    pub fn run_conv_fprop(&mut self, src: &[f32], weights: &[f32], dst: &mut [f32]) -> Result<()> {
        self.expect_kind(OpKind::Convolution(ConvDirection::Forward))?;
        self.run(&[src, weights], dst)
    }

    pub fn run_conv_bprop_data(
        &mut self,
        diff_dst: &[f32],
        weights: &[f32],
        diff_src: &mut [f32],
    ) -> Result<()> {
        self.expect_kind(OpKind::Convolution(ConvDirection::BackwardData))?;
        self.run(&[diff_dst, weights], diff_src)
    }

    pub fn run_conv_bprop_weights(
        &mut self,
        diff_dst: &[f32],
        diff_weights: &mut [f32],
        src: &[f32],
    ) -> Result<()> {
        self.expect_kind(OpKind::Convolution(ConvDirection::BackwardWeights))?;
        self.run(&[diff_dst, src], diff_weights)
    }

    pub fn run_pool_fprop(&mut self, src: &[f32], dst: &mut [f32]) -> Result<()> {
        match self.kind {
            OpKind::Pooling(_, Propagation::Forward) => self.run(&[src], dst),
            other => Err(self.kind_error(other, "pooling forward")),
        }
    }

    pub fn run_pool_bprop(&mut self, diff_dst: &[f32], diff_src: &mut [f32]) -> Result<()> {
        match self.kind {
            OpKind::Pooling(_, Propagation::Backward) => self.run(&[diff_dst], diff_src),
            other => Err(self.kind_error(other, "pooling backward")),
        }
    }

    fn expect_kind(&self, kind: OpKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(self.kind_error(self.kind, &kind.to_string()))
        }
    }

    fn kind_error(&self, got: OpKind, wanted: &str) -> Error {
        Error::msg(format!("graph computes {got}, not {wanted}"))
    }

    fn check_buffers(&self, inputs: &[&[f32]], output: &[f32]) -> Result<()> {
        if inputs.len() != self.inputs.len() {
            bail!(
                "{} takes {} input buffers, got {}",
                self.kind,
                self.inputs.len(),
                inputs.len()
            );
        }
        for (id, data) in self.inputs.iter().zip(inputs) {
            let op = &self.operands[id.0];
            check_len(&self.engine, op, data.len())?;
        }
        check_len(&self.engine, &self.operands[self.output.0], output.len())
    }

    fn rebind(&mut self, inputs: &[&[f32]], output: &[f32]) {
        for op in self.operands.iter_mut() {
            match op.storage() {
                Storage::Caller(Port::Input(i)) => op.rebind(inputs[i].as_ptr() as usize),
                Storage::Caller(Port::Output) => op.rebind(output.as_ptr() as usize),
                Storage::Scratch(_) => {}
            }
        }
    }

    fn replay(
        &mut self,
        inputs: &[&[f32]],
        output: &mut [f32],
        mut observe: impl FnMut(StepTiming),
    ) -> Result<()> {
        self.check_buffers(inputs, output)?;
        self.rebind(inputs, output);

        let mut bufs = Buffers { inputs, output };
        let workspace = self.workspace.as_ref().map(|(ws, _)| ws);
        for (index, step) in self.steps.iter().enumerate() {
            let label = step.label();
            trace!("{}: step {index} {label}", self.kind);
            let start = Instant::now();
            let result = execute_step(
                &self.engine,
                &mut self.registry,
                &self.operands,
                workspace,
                step,
                &mut bufs,
            );
            if let Err(e) = result {
                error!("{}: step {index} ({label}) failed: {e}", self.kind);
                return Err(e.in_step(index, label));
            }
            observe(StepTiming {
                index,
                label,
                duration: start.elapsed(),
            });
        }
        Ok(())
    }
}

fn check_len<E: Engine>(engine: &E, op: &Operand<E>, got: usize) -> Result<()> {
    let needed = engine.layout_size(op.layout());
    if got < needed {
        return Err(Error::BufferTooSmall {
            role: op.role(),
            needed,
            got,
        });
    }
    Ok(())
}

fn input_slice<'x, E: Engine>(
    registry: &'x Registry<E>,
    operands: &[Operand<E>],
    inputs: &[&'x [f32]],
    id: OperandId,
) -> Result<&'x [f32]> {
    let op = &operands[id.0];
    match op.storage() {
        Storage::Caller(Port::Input(i)) => inputs
            .get(i)
            .copied()
            .ok_or_else(|| Error::resource(op.role(), format!("input {i} not supplied"))),
        Storage::Scratch(s) => Ok(registry.scratch(s)?.as_slice()),
        Storage::Caller(Port::Output) => Err(Error::resource(
            op.role(),
            "the caller output cannot be read by a step",
        )),
    }
}

/// Execute one step. A scratch output is moved out of the registry for the
/// duration of the call and always put back.
fn execute_step<E: Engine>(
    engine: &E,
    registry: &mut Registry<E>,
    operands: &[Operand<E>],
    workspace: Option<&Workspace>,
    step: &Step,
    bufs: &mut Buffers<'_, '_>,
) -> Result<()> {
    let output_id = match step {
        Step::Reorder(r) => r.to,
        Step::Compute(c) => c.output,
    };
    let out_op = &operands[output_id.0];
    let mut scratch_out = match out_op.storage() {
        Storage::Scratch(id) => Some((id, registry.take_scratch(id)?)),
        Storage::Caller(Port::Output) => None,
        Storage::Caller(Port::Input(_)) => {
            return Err(Error::resource(out_op.role(), "a caller input cannot be written"))
        }
    };

    let result = {
        let out: &mut [f32] = match scratch_out.as_mut() {
            Some((_, data)) => data.as_mut_slice(),
            None => &mut *bufs.output,
        };
        dispatch(engine, registry, operands, workspace, step, bufs.inputs, out_op.role(), out)
    };

    if let Some((id, data)) = scratch_out {
        registry.restore_scratch(id, data);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn dispatch<E: Engine>(
    engine: &E,
    registry: &Registry<E>,
    operands: &[Operand<E>],
    workspace: Option<&Workspace>,
    step: &Step,
    inputs: &[&[f32]],
    out_role: OperandRole,
    out: &mut [f32],
) -> Result<()> {
    match step {
        Step::Reorder(r) => {
            let src = input_slice(registry, operands, inputs, r.from)?;
            let args = ExecArgs::new(out_role, out).with_input(r.role, src);
            engine.execute(registry.primitive(r.primitive)?, args)
        }
        Step::Compute(c) => {
            let mut args = ExecArgs::new(out_role, out);
            for &id in &c.inputs {
                let data = input_slice(registry, operands, inputs, id)?;
                args = args.with_input(operands[id.0].role(), data);
            }
            let primitive = registry.primitive(c.primitive)?;
            match (c.workspace, workspace) {
                (None, _) => engine.execute(primitive, args),
                (Some(WorkspaceAccess::Write), Some(ws)) => {
                    let mut guard = ws.write()?;
                    engine.execute(primitive, args.with_workspace(WorkspaceArg::Write(&mut guard)))
                }
                (Some(WorkspaceAccess::Read), Some(ws)) => {
                    let guard = ws.read()?;
                    engine.execute(primitive, args.with_workspace(WorkspaceArg::Read(&guard)))
                }
                (Some(_), None) => Err(Error::resource(
                    OperandRole::Workspace,
                    "compute step expects a workspace but none is bound",
                )),
            }
        }
    }
}
