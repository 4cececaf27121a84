use std::fmt;

use log::trace;
use primnet_core::{Engine, Error, OperandRole, Result};

use crate::workspace::Workspace;

// Registry: everything one kernel graph owns
//
// Descriptors, primitives, scratch buffers and workspaces live in a single
// ordered collection and are released in reverse acquisition order when the
// registry is dropped. Assembly builds its registry incrementally, so an early
// return from a failed assembly releases whatever had been acquired so far.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchId(usize);

/// Zero-initialised buffer holding one operand in the engine's layout.
#[derive(Debug)]
pub struct ScratchBuffer {
    role: OperandRole,
    data: Vec<f32>,
}

impl ScratchBuffer {
    pub fn role(&self) -> OperandRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

enum Resource<E: Engine> {
    Desc(E::PrimitiveDesc),
    Primitive(E::Primitive),
    Scratch(ScratchBuffer),
    Workspace { workspace: Workspace, allocated: bool },
}

impl<E: Engine> Resource<E> {
    fn describe(&self) -> String {
        match self {
            Resource::Desc(_) => "primitive descriptor".to_string(),
            Resource::Primitive(_) => "primitive".to_string(),
            Resource::Scratch(s) => format!("{} scratch ({} elements)", s.role, s.data.len()),
            Resource::Workspace { workspace, allocated } => format!(
                "workspace ({} entries, {})",
                workspace.len(),
                if *allocated { "owned" } else { "shared" }
            ),
        }
    }
}

pub struct Registry<E: Engine> {
    resources: Vec<Resource<E>>,
    allocations: usize,
}

impl<E: Engine> Default for Registry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> Registry<E> {
    pub fn new() -> Self {
        Registry {
            resources: Vec::new(),
            allocations: 0,
        }
    }

    pub fn add_desc(&mut self, pd: E::PrimitiveDesc) -> DescId {
        self.resources.push(Resource::Desc(pd));
        DescId(self.resources.len() - 1)
    }

    pub fn add_primitive(&mut self, primitive: E::Primitive) -> PrimitiveId {
        self.resources.push(Resource::Primitive(primitive));
        PrimitiveId(self.resources.len() - 1)
    }

    /// Allocate a zeroed scratch buffer of `len` elements for `role`.
    pub fn alloc_scratch(&mut self, role: OperandRole, len: usize) -> Result<ScratchId> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| Error::resource(role, format!("scratch of {len} elements: {e}")))?;
        data.resize(len, 0.0);
        self.resources
            .push(Resource::Scratch(ScratchBuffer { role, data }));
        self.allocations += 1;
        Ok(ScratchId(self.resources.len() - 1))
    }

    /// Allocate a fresh workspace owned by this registry.
    pub fn alloc_workspace(&mut self, len: usize) -> Result<Workspace> {
        let workspace = Workspace::new(len)?;
        self.resources.push(Resource::Workspace {
            workspace: workspace.clone(),
            allocated: true,
        });
        self.allocations += 1;
        Ok(workspace)
    }

    /// Keep a workspace allocated elsewhere alive for this registry's lifetime.
    pub fn adopt_workspace(&mut self, workspace: Workspace) {
        self.resources.push(Resource::Workspace {
            workspace,
            allocated: false,
        });
    }

    pub fn desc(&self, id: DescId) -> Result<&E::PrimitiveDesc> {
        match self.resources.get(id.0) {
            Some(Resource::Desc(pd)) => Ok(pd),
            _ => Err(Error::msg(format!("no primitive descriptor at slot {}", id.0))),
        }
    }

    pub fn primitive(&self, id: PrimitiveId) -> Result<&E::Primitive> {
        match self.resources.get(id.0) {
            Some(Resource::Primitive(p)) => Ok(p),
            _ => Err(Error::msg(format!("no primitive at slot {}", id.0))),
        }
    }

    pub fn scratch(&self, id: ScratchId) -> Result<&ScratchBuffer> {
        match self.resources.get(id.0) {
            Some(Resource::Scratch(s)) => Ok(s),
            _ => Err(Error::msg(format!("no scratch buffer at slot {}", id.0))),
        }
    }

    /// Move a scratch buffer's storage out so it can be written while other
    /// scratch buffers are read. Must be paired with [`Registry::restore_scratch`].
    pub(crate) fn take_scratch(&mut self, id: ScratchId) -> Result<Vec<f32>> {
        match self.resources.get_mut(id.0) {
            Some(Resource::Scratch(s)) => Ok(std::mem::take(&mut s.data)),
            _ => Err(Error::msg(format!("no scratch buffer at slot {}", id.0))),
        }
    }

    pub(crate) fn restore_scratch(&mut self, id: ScratchId, data: Vec<f32>) {
        if let Some(Resource::Scratch(s)) = self.resources.get_mut(id.0) {
            s.data = data;
        }
    }

    /// Total elements held by scratch buffers.
    pub fn scratch_elements(&self) -> usize {
        self.scratch_buffers().map(|s| s.data.len()).sum()
    }

    pub fn scratch_buffers(&self) -> impl Iterator<Item = &ScratchBuffer> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Scratch(s) => Some(s),
            _ => None,
        })
    }

    /// Number of buffers (scratch and workspace) this registry allocated
    /// itself, as opposed to adopted.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl<E: Engine> fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.resources.len())
            .field("allocations", &self.allocations)
            .field("scratch_elements", &self.scratch_elements())
            .finish()
    }
}

impl<E: Engine> Drop for Registry<E> {
    fn drop(&mut self) {
        while let Some(resource) = self.resources.pop() {
            trace!("release {}", resource.describe());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primnet_cpu::CpuEngine;

    #[test]
    fn test_scratch_take_and_restore() {
        let mut reg: Registry<CpuEngine> = Registry::new();
        let id = reg.alloc_scratch(OperandRole::Src, 6).unwrap();
        assert_eq!(reg.scratch_elements(), 6);

        let mut buf = reg.take_scratch(id).unwrap();
        buf[0] = 1.5;
        reg.restore_scratch(id, buf);
        assert_eq!(reg.scratch(id).unwrap().as_slice()[0], 1.5);
        assert_eq!(reg.allocations(), 1);
    }

    #[test]
    fn test_adopted_workspace_is_not_counted() {
        let mut reg: Registry<CpuEngine> = Registry::new();
        let ws = Workspace::new(8).unwrap();
        reg.adopt_workspace(ws);
        assert_eq!(reg.allocations(), 0);
        let _own = reg.alloc_workspace(4).unwrap();
        assert_eq!(reg.allocations(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_wrong_slot_kind_is_an_error() {
        let mut reg: Registry<CpuEngine> = Registry::new();
        let id = reg.alloc_scratch(OperandRole::Dst, 1).unwrap();
        assert!(reg.primitive(PrimitiveId(id.0)).is_err());
    }
}
