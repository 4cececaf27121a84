use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use primnet_core::{Error, OperandRole, Result};

/// Max-pooling argmax buffer.
///
/// Written by the forward graph and read by the backward graph assembled from
/// its [`PoolingContext`](crate::PoolingContext). Clones share the same
/// buffer; [`Workspace::ptr_eq`] tells whether two handles do.
#[derive(Debug, Clone)]
pub struct Workspace {
    data: Arc<RwLock<Vec<u32>>>,
    len: usize,
}

impl Workspace {
    /// Allocate a zeroed workspace of `len` entries.
    pub fn new(len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| Error::resource(OperandRole::Workspace, e.to_string()))?;
        data.resize(len, 0);
        Ok(Workspace {
            data: Arc::new(RwLock::new(data)),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first entry.
    pub fn as_ptr(&self) -> *const u32 {
        match self.data.read() {
            Ok(guard) => guard.as_ptr(),
            Err(poisoned) => poisoned.into_inner().as_ptr(),
        }
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(a: &Workspace, b: &Workspace) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Vec<u32>>> {
        self.data
            .read()
            .map_err(|_| Error::resource(OperandRole::Workspace, "workspace lock poisoned"))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<u32>>> {
        self.data
            .write()
            .map_err(|_| Error::resource(OperandRole::Workspace, "workspace lock poisoned"))
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Result<Vec<u32>> {
        Ok(self.read()?.clone())
    }
}
