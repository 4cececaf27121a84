use log::debug;
use primnet_core::{Engine, Error, OpDesc, OperandRole, Result};

/// An operator bound to the engine, with the layout it prefers per role.
pub struct Resolved<E: Engine> {
    pub pd: E::PrimitiveDesc,
    pub layouts: Vec<(OperandRole, E::Layout)>,
    pub workspace_len: Option<usize>,
}

impl<E: Engine> Resolved<E> {
    pub fn layout(&self, role: OperandRole) -> Result<&E::Layout> {
        self.layouts
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, l)| l)
            .ok_or_else(|| Error::msg(format!("no {role} layout resolved")))
    }
}

/// Ask `engine` for its preferred layout of every data operand of `op`.
///
/// Fails if the engine rejects the operator; nothing is left allocated in that
/// case.
pub fn resolve<E: Engine>(
    engine: &E,
    op: &OpDesc,
    hint: Option<&E::PrimitiveDesc>,
) -> Result<Resolved<E>> {
    let pd = engine.create_primitive_desc(op, hint)?;
    let mut layouts = Vec::with_capacity(3);
    for &role in op.input_roles().iter().chain(std::iter::once(&op.output_role())) {
        let layout = engine.query_layout(&pd, role)?;
        debug!("{}: engine prefers {} = {}", op.kind(), role, layout);
        layouts.push((role, layout));
    }
    let workspace_len = engine.workspace_len(&pd);
    Ok(Resolved {
        pd,
        layouts,
        workspace_len,
    })
}
