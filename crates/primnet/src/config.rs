/// Per-assembler options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyConfig {
    /// Name shown in logs and in the graph's `Display` output.
    pub name: Option<String>,
    /// Maximum number of scratch elements one graph may allocate.
    pub scratch_limit: Option<usize>,
}

impl AssemblyConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_scratch_limit(mut self, limit: usize) -> Self {
        self.scratch_limit = Some(limit);
        self
    }
}
