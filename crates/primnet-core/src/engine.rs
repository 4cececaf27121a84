use std::fmt;

use crate::error::{Error, Result};
use crate::op::{OpDesc, OperandRole};
use crate::shape::Shape;

// Engine: the execution-engine capability graph assembly is written against
//
// An engine owns three kinds of opaque objects:
//
//   Layout         how one operand's elements sit in linear memory
//   PrimitiveDesc  a logical operator bound to the engine, which knows the
//                  layout it prefers for every operand role
//   Primitive      an executable unit: a compute kernel or a reorder
//
// Assembly code never looks inside these. It asks for preferences, compares
// layouts with `layouts_equal`, sizes buffers with `layout_size` and hands
// role-tagged slices to `execute`. Everything an engine allocates is released
// when the returned handle is dropped.

/// Default arrangement applied to a caller operand that has no layout hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convention {
    /// Activations and their gradients: (N, C, H, W).
    FeatureMap,
    /// Filters and their gradients: (O, I, KH, KW).
    Weights,
}

impl Convention {
    pub fn for_role(role: OperandRole) -> Self {
        match role {
            OperandRole::Weights | OperandRole::DiffWeights => Convention::Weights,
            _ => Convention::FeatureMap,
        }
    }
}

/// How a primitive touches the max-pooling workspace.
pub enum WorkspaceArg<'a> {
    Write(&'a mut [u32]),
    Read(&'a [u32]),
}

/// Buffers for one `Engine::execute` call.
///
/// A reorder receives exactly one input and one output tagged with the role of
/// the operand being converted.
pub struct ExecArgs<'a> {
    pub inputs: Vec<(OperandRole, &'a [f32])>,
    pub output: (OperandRole, &'a mut [f32]),
    pub workspace: Option<WorkspaceArg<'a>>,
}

impl<'a> ExecArgs<'a> {
    pub fn new(output_role: OperandRole, output: &'a mut [f32]) -> Self {
        ExecArgs {
            inputs: Vec::new(),
            output: (output_role, output),
            workspace: None,
        }
    }

    pub fn with_input(mut self, role: OperandRole, data: &'a [f32]) -> Self {
        self.inputs.push((role, data));
        self
    }

    pub fn with_workspace(mut self, ws: WorkspaceArg<'a>) -> Self {
        self.workspace = Some(ws);
        self
    }

    /// The first input, whatever its role.
    pub fn first_input(&self) -> Result<(OperandRole, &'a [f32])> {
        self.inputs
            .first()
            .copied()
            .ok_or_else(|| Error::msg("no input bound"))
    }
}

/// An execution engine: layout negotiation plus primitive creation and
/// execution.
pub trait Engine: Clone + Send + Sync + fmt::Debug + 'static {
    type Layout: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type PrimitiveDesc: Clone + fmt::Debug + Send + Sync + 'static;
    type Primitive: fmt::Debug + Send + Sync + 'static;

    fn name(&self) -> String;

    /// The layout a caller operand gets when it is bound without a hint.
    fn default_layout(&self, shape: &Shape, convention: Convention) -> Result<Self::Layout>;

    /// Validate `op` and bind it to the engine. Backward pooling must pass the
    /// forward descriptor as `hint`.
    fn create_primitive_desc(
        &self,
        op: &OpDesc,
        hint: Option<&Self::PrimitiveDesc>,
    ) -> Result<Self::PrimitiveDesc>;

    /// The logical operator a descriptor was created from.
    fn op_desc<'a>(&self, pd: &'a Self::PrimitiveDesc) -> &'a OpDesc;

    /// Preferred layout for the operand playing `role`.
    fn query_layout(&self, pd: &Self::PrimitiveDesc, role: OperandRole) -> Result<Self::Layout>;

    /// Element count of the argmax workspace, for operators that need one.
    fn workspace_len(&self, pd: &Self::PrimitiveDesc) -> Option<usize>;

    fn layouts_equal(&self, a: &Self::Layout, b: &Self::Layout) -> bool;

    fn layout_shape(&self, layout: &Self::Layout) -> Shape;

    /// Physical element count of a buffer holding `layout`.
    fn layout_size(&self, layout: &Self::Layout) -> usize;

    fn create_reorder(&self, from: &Self::Layout, to: &Self::Layout) -> Result<Self::Primitive>;

    fn create_compute(
        &self,
        pd: &Self::PrimitiveDesc,
        inputs: &[OperandRole],
        output: OperandRole,
    ) -> Result<Self::Primitive>;

    fn execute(&self, primitive: &Self::Primitive, args: ExecArgs<'_>) -> Result<()>;
}
