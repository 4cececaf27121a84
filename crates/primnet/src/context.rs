use primnet_core::{Engine, PoolDesc};

use crate::workspace::Workspace;

/// What a forward pooling graph hands to its backward counterpart.
///
/// Backward assembly creates its descriptor with `pd` as hint, expects the
/// engine to choose `dst_layout` for the incoming gradient and `src_layout`
/// for the outgoing one, and reads max pooling's argmax from `workspace`.
#[derive(Debug, Clone)]
pub struct PoolingContext<E: Engine> {
    pub(crate) desc: PoolDesc,
    pub(crate) pd: E::PrimitiveDesc,
    pub(crate) src_layout: E::Layout,
    pub(crate) dst_layout: E::Layout,
    pub(crate) workspace: Option<Workspace>,
}

impl<E: Engine> PoolingContext<E> {
    pub fn desc(&self) -> &PoolDesc {
        &self.desc
    }

    pub fn primitive_desc(&self) -> &E::PrimitiveDesc {
        &self.pd
    }

    /// Engine layout of the forward source.
    pub fn src_layout(&self) -> &E::Layout {
        &self.src_layout
    }

    /// Engine layout of the forward destination.
    pub fn dst_layout(&self) -> &E::Layout {
        &self.dst_layout
    }

    /// Argmax buffer; `None` for average pooling.
    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }
}
