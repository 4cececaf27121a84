use std::fmt;

use primnet_core::{bail, Engine, OpKind, OperandRole, Result};

use crate::binding::{Operand, OperandId, Port, Storage};
use crate::context::PoolingContext;
use crate::registry::{PrimitiveId, Registry};
use crate::reorder::{Direction, ReorderStep};
use crate::workspace::Workspace;

// KernelGraph: the assembled, replayable step list of one operator
//
// Layout of a graph:
//
//   operands   caller-facing operands first, internal (scratch) twins after
//   steps      [input reorders] -> compute -> [output reorder]
//   registry   every engine object and buffer the steps use
//
// Nothing here changes after assembly except the buffer addresses recorded on
// caller-facing operands when the graph is run.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceAccess {
    Write,
    Read,
}

#[derive(Debug, Clone)]
pub struct ComputeStep {
    pub kind: OpKind,
    pub primitive: PrimitiveId,
    pub inputs: Vec<OperandId>,
    pub output: OperandId,
    pub workspace: Option<WorkspaceAccess>,
}

#[derive(Debug, Clone)]
pub enum Step {
    Reorder(ReorderStep),
    Compute(ComputeStep),
}

impl Step {
    pub fn is_compute(&self) -> bool {
        matches!(self, Step::Compute(_))
    }

    pub fn is_reorder(&self) -> bool {
        matches!(self, Step::Reorder(_))
    }

    pub fn label(&self) -> String {
        match self {
            Step::Reorder(r) => format!("reorder {} {}", r.direction, r.role),
            Step::Compute(c) => format!("compute {}", c.kind),
        }
    }
}

pub struct KernelGraph<E: Engine> {
    pub(crate) engine: E,
    pub(crate) kind: OpKind,
    pub(crate) name: Option<String>,
    pub(crate) operands: Vec<Operand<E>>,
    pub(crate) inputs: Vec<OperandId>,
    pub(crate) output: OperandId,
    pub(crate) steps: Vec<Step>,
    pub(crate) workspace: Option<(Workspace, WorkspaceAccess)>,
    pub(crate) context: Option<PoolingContext<E>>,
    pub(crate) registry: Registry<E>,
}

impl<E: Engine> KernelGraph<E> {
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Data operands the graph reads: caller inputs plus a workspace that is
    /// only read.
    pub fn num_inputs(&self) -> usize {
        let ws = matches!(self.workspace, Some((_, WorkspaceAccess::Read)));
        self.inputs.len() + usize::from(ws)
    }

    /// Data operands the graph writes: the caller output plus a workspace it
    /// fills.
    pub fn num_outputs(&self) -> usize {
        let ws = matches!(self.workspace, Some((_, WorkspaceAccess::Write)));
        1 + usize::from(ws)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn reorder_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_reorder()).count()
    }

    pub fn operands(&self) -> &[Operand<E>] {
        &self.operands
    }

    /// The caller-facing operand playing `role`.
    pub fn operand(&self, role: OperandRole) -> Option<&Operand<E>> {
        self.operands
            .iter()
            .find(|o| o.role() == role && o.is_caller_facing())
    }

    /// The scratch-backed twin of `role`, present only if a reorder was needed.
    pub fn internal_operand(&self, role: OperandRole) -> Option<&Operand<E>> {
        self.operands
            .iter()
            .find(|o| o.role() == role && !o.is_caller_facing())
    }

    pub fn caller_layout(&self, role: OperandRole) -> Option<&E::Layout> {
        self.operand(role).map(Operand::layout)
    }

    /// Layout the compute step sees for `role`.
    pub fn engine_layout(&self, role: OperandRole) -> Option<&E::Layout> {
        self.internal_operand(role)
            .or_else(|| self.operand(role))
            .map(Operand::layout)
    }

    /// Caller-facing layouts of the inputs, in `run` order.
    pub fn input_layouts(&self) -> Vec<&E::Layout> {
        self.inputs
            .iter()
            .map(|id| self.operands[id.0].layout())
            .collect()
    }

    pub fn output_layout(&self) -> &E::Layout {
        self.operands[self.output.0].layout()
    }

    /// Caller-facing operand bound to the output buffer.
    pub fn output_operand(&self) -> &Operand<E> {
        &self.operands[self.output.0]
    }

    /// Elements a caller buffer for input `index` must provide.
    pub fn input_size(&self, index: usize) -> Option<usize> {
        self.inputs
            .get(index)
            .map(|id| self.engine.layout_size(self.operands[id.0].layout()))
    }

    pub fn output_size(&self) -> usize {
        self.engine.layout_size(self.output_layout())
    }

    pub fn scratch_elements(&self) -> usize {
        self.registry.scratch_elements()
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref().map(|(ws, _)| ws)
    }

    /// Context for assembling the matching backward pass; forward pooling
    /// graphs only.
    pub fn pooling_context(&self) -> Option<&PoolingContext<E>> {
        self.context.as_ref()
    }

    pub fn registry(&self) -> &Registry<E> {
        &self.registry
    }

    /// Verify the step-list invariants: exactly one compute step, every input
    /// reorder before it, at most one output reorder and only as the last step.
    pub fn check_order(&self) -> Result<()> {
        let computes: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_compute())
            .map(|(i, _)| i)
            .collect();
        let compute_at = match computes.as_slice() {
            [i] => *i,
            _ => bail!("expected one compute step, found {}", computes.len()),
        };
        if self.steps.len() != self.reorder_count() + 1 {
            bail!("step count does not match reorders + 1");
        }
        let mut outputs = 0;
        for (i, step) in self.steps.iter().enumerate() {
            if let Step::Reorder(r) = step {
                match r.direction {
                    Direction::Input if i > compute_at => {
                        bail!("input reorder at step {i} after compute at {compute_at}")
                    }
                    Direction::Output if i < compute_at || i != self.steps.len() - 1 => {
                        bail!("output reorder at step {i} is not last")
                    }
                    Direction::Output => outputs += 1,
                    Direction::Input => {}
                }
            }
        }
        if outputs > 1 {
            bail!("more than one output reorder");
        }
        Ok(())
    }

    pub(crate) fn storage_label(&self, id: OperandId) -> String {
        match self.operands[id.0].storage() {
            Storage::Caller(Port::Input(i)) => format!("input {i}"),
            Storage::Caller(Port::Output) => "output".to_string(),
            Storage::Scratch(_) => "scratch".to_string(),
        }
    }
}

impl<E: Engine> fmt::Debug for KernelGraph<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelGraph")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("registry", &self.registry)
            .finish()
    }
}

impl<E: Engine> fmt::Display for KernelGraph<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(name) = &self.name {
            write!(f, " `{name}`")?;
        }
        writeln!(
            f,
            " on {}: {} in, {} out, {} scratch elements",
            self.engine.name(),
            self.num_inputs(),
            self.num_outputs(),
            self.scratch_elements()
        )?;
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                Step::Reorder(r) => writeln!(
                    f,
                    "  [{i}] {}: {} {} -> {} {}",
                    step.label(),
                    self.storage_label(r.from),
                    self.operands[r.from.0].layout(),
                    self.storage_label(r.to),
                    self.operands[r.to.0].layout()
                )?,
                Step::Compute(c) => {
                    write!(f, "  [{i}] {}:", step.label())?;
                    for id in &c.inputs {
                        let op = &self.operands[id.0];
                        write!(f, " {}={}", op.role(), op.layout())?;
                    }
                    let out = &self.operands[c.output.0];
                    write!(f, " -> {}={}", out.role(), out.layout())?;
                    if let Some(access) = c.workspace {
                        write!(f, " (workspace {access:?})")?;
                    }
                    writeln!(f)?;
                }
            }
        }
        Ok(())
    }
}
