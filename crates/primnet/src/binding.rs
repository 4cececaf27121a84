use primnet_core::{Convention, Engine, Error, OperandRole, Result, Shape};

use crate::registry::ScratchId;

// Tensor binding
//
// An operand couples a logical shape with a concrete layout and a storage
// slot. Binding never touches data: caller-facing operands only learn their
// buffer address when the graph is run, scratch operands point at a buffer the
// graph's registry owns.

/// Index of an operand in its graph's operand table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperandId(pub(crate) usize);

impl OperandId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Caller buffer slot of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Position in the `inputs` slice passed to `run`.
    Input(usize),
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Supplied by the caller on every run.
    Caller(Port),
    /// Owned by the graph.
    Scratch(ScratchId),
}

#[derive(Debug, Clone)]
pub struct Operand<E: Engine> {
    role: OperandRole,
    shape: Shape,
    layout: E::Layout,
    storage: Storage,
    handle: Option<usize>,
}

impl<E: Engine> Operand<E> {
    /// Bind a caller operand. A hint is used as-is after checking its shape;
    /// without one the engine's default convention for `role` applies.
    pub fn bind(
        engine: &E,
        role: OperandRole,
        shape: &Shape,
        hint: Option<&E::Layout>,
        storage: Storage,
    ) -> Result<Self> {
        let layout = match hint {
            Some(layout) => {
                let got = engine.layout_shape(layout);
                if got != *shape {
                    return Err(Error::ShapeMismatch {
                        expected: shape.clone(),
                        got,
                    });
                }
                layout.clone()
            }
            None => engine.default_layout(shape, Convention::for_role(role))?,
        };
        Ok(Self::with_layout(role, shape.clone(), layout, storage))
    }

    /// Bind under a layout the engine already chose.
    pub fn with_layout(role: OperandRole, shape: Shape, layout: E::Layout, storage: Storage) -> Self {
        Operand {
            role,
            shape,
            layout,
            storage,
            handle: None,
        }
    }

    pub fn role(&self) -> OperandRole {
        self.role
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn layout(&self) -> &E::Layout {
        &self.layout
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    pub fn is_caller_facing(&self) -> bool {
        matches!(self.storage, Storage::Caller(_))
    }

    /// Address of the buffer bound by the most recent run, for caller-facing
    /// operands that have been run at least once.
    pub fn handle(&self) -> Option<usize> {
        self.handle
    }

    pub(crate) fn rebind(&mut self, address: usize) {
        self.handle = Some(address);
    }
}
