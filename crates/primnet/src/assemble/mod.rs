// Kernel graph assembly
//
// Every operator variant follows the same recipe:
//
//   1. resolve the operator against the engine (preferred layout per role)
//   2. bind caller-facing operands, from hints or default conventions
//   3. plan a reorder for each operand whose caller layout differs
//   4. create the compute primitive over the internal operands
//   5. order the steps: input reorders, compute, output reorder
//
// The per-operator entry points live in `conv` and `pool`. GraphBuilder holds
// the partially built graph; dropping it on an error path releases every
// resource acquired so far.

mod conv;
mod pool;

use log::debug;
use primnet_core::{Engine, Error, OpKind, OperandRole, Result, Shape};

use crate::binding::{Operand, OperandId, Port, Storage};
use crate::config::AssemblyConfig;
use crate::context::PoolingContext;
use crate::graph::{ComputeStep, KernelGraph, Step, WorkspaceAccess};
use crate::registry::{DescId, Registry};
use crate::reorder::{self, Direction, ReorderStep};
use crate::resolve::Resolved;
use crate::workspace::Workspace;

/// Builds [`KernelGraph`]s for one engine.
#[derive(Debug, Clone)]
pub struct Assembler<E: Engine> {
    engine: E,
    config: AssemblyConfig,
}

impl<E: Engine> Assembler<E> {
    pub fn new(engine: E) -> Self {
        Assembler {
            engine,
            config: AssemblyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AssemblyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    fn builder(&self, kind: OpKind) -> GraphBuilder<'_, E> {
        GraphBuilder {
            engine: &self.engine,
            config: &self.config,
            kind,
            operands: Vec::new(),
            inputs: Vec::new(),
            registry: Registry::new(),
            pre: Vec::new(),
            compute: None,
            post: None,
            workspace: None,
        }
    }
}

struct GraphBuilder<'a, E: Engine> {
    engine: &'a E,
    config: &'a AssemblyConfig,
    kind: OpKind,
    operands: Vec<Operand<E>>,
    inputs: Vec<OperandId>,
    registry: Registry<E>,
    pre: Vec<ReorderStep>,
    compute: Option<ComputeStep>,
    post: Option<ReorderStep>,
    workspace: Option<(Workspace, WorkspaceAccess)>,
}

impl<'a, E: Engine> GraphBuilder<'a, E> {
    fn push(&mut self, operand: Operand<E>) -> OperandId {
        self.operands.push(operand);
        OperandId(self.operands.len() - 1)
    }

    /// Bind the next caller input.
    fn caller_input(
        &mut self,
        role: OperandRole,
        shape: &Shape,
        hint: Option<&E::Layout>,
    ) -> Result<OperandId> {
        let port = Port::Input(self.inputs.len());
        let operand = Operand::bind(self.engine, role, shape, hint, Storage::Caller(port))?;
        let id = self.push(operand);
        self.inputs.push(id);
        Ok(id)
    }

    /// Bind the caller output under a hint or the default convention.
    fn caller_output(
        &mut self,
        role: OperandRole,
        shape: &Shape,
        hint: Option<&E::Layout>,
    ) -> Result<OperandId> {
        let operand =
            Operand::bind(self.engine, role, shape, hint, Storage::Caller(Port::Output))?;
        Ok(self.push(operand))
    }

    /// Bind the caller output directly under the engine's layout; such an
    /// output never gets a reorder.
    fn engine_output(&mut self, role: OperandRole, shape: &Shape, layout: E::Layout) -> OperandId {
        debug!("{role}: bound in engine layout {layout}");
        self.push(Operand::with_layout(
            role,
            shape.clone(),
            layout,
            Storage::Caller(Port::Output),
        ))
    }

    /// Convert input `caller` to `preferred` if needed; returns the operand
    /// the compute step should read.
    fn reorder_input(&mut self, caller: OperandId, preferred: &E::Layout) -> Result<OperandId> {
        match self.plan(caller, preferred, Direction::Input)? {
            Some(step) => {
                let internal = step.internal();
                self.pre.push(step);
                Ok(internal)
            }
            None => Ok(caller),
        }
    }

    /// Convert output `caller` from `preferred` if needed; returns the operand
    /// the compute step should write.
    fn reorder_output(&mut self, caller: OperandId, preferred: &E::Layout) -> Result<OperandId> {
        if self.post.is_some() {
            return Err(Error::msg("a graph has at most one output reorder"));
        }
        match self.plan(caller, preferred, Direction::Output)? {
            Some(step) => {
                let internal = step.internal();
                self.post = Some(step);
                Ok(internal)
            }
            None => Ok(caller),
        }
    }

    fn plan(
        &mut self,
        caller: OperandId,
        preferred: &E::Layout,
        direction: Direction,
    ) -> Result<Option<ReorderStep>> {
        reorder::plan(
            self.engine,
            &mut self.registry,
            &mut self.operands,
            caller,
            preferred,
            direction,
            self.config.scratch_limit,
        )
    }

    fn alloc_workspace(&mut self, len: usize) -> Result<Workspace> {
        let ws = self.registry.alloc_workspace(len)?;
        debug!("workspace: allocated {len} entries at {:p}", ws.as_ptr());
        self.workspace = Some((ws.clone(), WorkspaceAccess::Write));
        Ok(ws)
    }

    fn adopt_workspace(&mut self, ws: &Workspace, needed: usize) -> Result<()> {
        if ws.len() < needed {
            return Err(Error::resource(
                OperandRole::Workspace,
                format!("forward workspace has {} entries, need {needed}", ws.len()),
            ));
        }
        debug!("workspace: reusing {} entries at {:p}", ws.len(), ws.as_ptr());
        self.registry.adopt_workspace(ws.clone());
        self.workspace = Some((ws.clone(), WorkspaceAccess::Read));
        Ok(())
    }

    /// Create the compute primitive over `inputs` -> `output`. Takes ownership
    /// of the resolved descriptor.
    fn compute(
        &mut self,
        resolved: Resolved<E>,
        inputs: &[OperandId],
        output: OperandId,
    ) -> Result<DescId> {
        let roles: Vec<OperandRole> = inputs.iter().map(|id| self.operands[id.0].role()).collect();
        let out_role = self.operands[output.0].role();
        let primitive = self.engine.create_compute(&resolved.pd, &roles, out_role)?;
        let desc = self.registry.add_desc(resolved.pd);
        let primitive = self.registry.add_primitive(primitive);
        self.compute = Some(ComputeStep {
            kind: self.kind,
            primitive,
            inputs: inputs.to_vec(),
            output,
            workspace: self.workspace.as_ref().map(|(_, access)| *access),
        });
        Ok(desc)
    }

    fn finish(self, context: Option<PoolingContext<E>>) -> Result<KernelGraph<E>> {
        let GraphBuilder {
            engine,
            config,
            kind,
            operands,
            inputs,
            registry,
            pre,
            compute,
            post,
            workspace,
        } = self;
        let compute = compute.ok_or_else(|| Error::config(kind, "no compute primitive"))?;
        let output = operands
            .iter()
            .position(|o| o.storage() == Storage::Caller(Port::Output))
            .map(OperandId)
            .ok_or_else(|| Error::config(kind, "no output operand bound"))?;

        let mut steps: Vec<Step> = pre.into_iter().map(Step::Reorder).collect();
        steps.push(Step::Compute(compute));
        steps.extend(post.map(Step::Reorder));

        let graph = KernelGraph {
            engine: engine.clone(),
            kind,
            name: config.name.clone(),
            operands,
            inputs,
            output,
            steps,
            workspace,
            context,
            registry,
        };
        graph.check_order()?;
        debug!(
            "{}{}: assembled {} steps ({} reorders), {} scratch elements",
            kind,
            graph.name().map(|n| format!(" `{n}`")).unwrap_or_default(),
            graph.steps().len(),
            graph.reorder_count(),
            graph.scratch_elements()
        );
        Ok(graph)
    }
}
