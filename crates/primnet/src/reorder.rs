use std::fmt;

use log::debug;
use primnet_core::{Engine, Error, OperandRole, Result};

use crate::binding::{Operand, OperandId, Storage};
use crate::registry::{PrimitiveId, Registry};

/// Which side of the compute step a reorder sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller layout to engine layout, before compute.
    Input,
    /// Engine layout to caller layout, after compute.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "in"),
            Direction::Output => write!(f, "out"),
        }
    }
}

/// A layout conversion between a caller-facing operand and its internal twin.
#[derive(Debug, Clone)]
pub struct ReorderStep {
    pub role: OperandRole,
    pub from: OperandId,
    pub to: OperandId,
    pub primitive: PrimitiveId,
    pub direction: Direction,
}

impl ReorderStep {
    /// The operand held in the engine's layout.
    pub fn internal(&self) -> OperandId {
        match self.direction {
            Direction::Input => self.to,
            Direction::Output => self.from,
        }
    }

    /// The operand the caller's buffer is bound to.
    pub fn caller(&self) -> OperandId {
        match self.direction {
            Direction::Input => self.from,
            Direction::Output => self.to,
        }
    }
}

/// Plan the conversion of caller operand `caller` to `preferred`.
///
/// Returns `None` when the engine considers both layouts equal. Otherwise an
/// internal operand bound to a fresh zeroed scratch buffer is appended to
/// `operands` and the reorder primitive is registered in `registry`.
pub(crate) fn plan<E: Engine>(
    engine: &E,
    registry: &mut Registry<E>,
    operands: &mut Vec<Operand<E>>,
    caller: OperandId,
    preferred: &E::Layout,
    direction: Direction,
    scratch_limit: Option<usize>,
) -> Result<Option<ReorderStep>> {
    let op = operands
        .get(caller.0)
        .ok_or_else(|| Error::msg(format!("unknown operand {}", caller.0)))?;
    let role = op.role();
    if engine.layouts_equal(op.layout(), preferred) {
        debug!("{role}: caller layout {} matches engine, no reorder", op.layout());
        return Ok(None);
    }

    let len = engine.layout_size(preferred);
    if let Some(limit) = scratch_limit {
        let used = registry.scratch_elements();
        if used + len > limit {
            return Err(Error::resource(
                role,
                format!("scratch of {len} elements exceeds the limit of {limit} ({used} in use)"),
            ));
        }
    }

    let (from_layout, to_layout) = match direction {
        Direction::Input => (op.layout(), preferred),
        Direction::Output => (preferred, op.layout()),
    };
    debug!("{role}: reorder {direction} {from_layout} -> {to_layout}, scratch {len} elements");
    let primitive = engine.create_reorder(from_layout, to_layout)?;
    let shape = op.shape().clone();

    let primitive = registry.add_primitive(primitive);
    let scratch = registry.alloc_scratch(role, len)?;
    let internal = OperandId(operands.len());
    operands.push(Operand::with_layout(
        role,
        shape,
        preferred.clone(),
        Storage::Scratch(scratch),
    ));

    let (from, to) = match direction {
        Direction::Input => (caller, internal),
        Direction::Output => (internal, caller),
    };
    Ok(Some(ReorderStep {
        role,
        from,
        to,
        primitive,
        direction,
    }))
}
