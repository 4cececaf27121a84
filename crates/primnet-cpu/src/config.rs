/// Tuning knobs for [`CpuEngine`](crate::CpuEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuEngineConfig {
    /// Channel block used for blocked feature-map layouts. `None` disables
    /// blocking, so every feature map is preferred in plain NCHW.
    pub channel_block: Option<usize>,
    /// Whether kernels split per-sample work across the rayon pool.
    pub parallel: bool,
}

impl Default for CpuEngineConfig {
    fn default() -> Self {
        Self {
            channel_block: Some(8),
            parallel: true,
        }
    }
}

impl CpuEngineConfig {
    pub fn with_channel_block(mut self, block: Option<usize>) -> Self {
        self.channel_block = block.filter(|&b| b > 1);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}
