use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// StepTiming: wall-clock time of one executed step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepTiming {
    /// Position of the step in the graph.
    pub index: usize,
    /// Same text as `Step::label`, e.g. `reorder in src`.
    pub label: String,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// RunProfile: per-step breakdown of one `KernelGraph::run_profiled` call
// ---------------------------------------------------------------------------

/// Timings of one profiled run, printed with `Display`.
#[derive(Debug, Clone)]
pub struct RunProfile {
    pub steps: Vec<StepTiming>,
    /// Wall-clock time of the whole run, buffer checks included.
    pub total: Duration,
}

impl RunProfile {
    /// Time spent in reorder steps.
    pub fn reorder_time(&self) -> Duration {
        self.steps
            .iter()
            .filter(|s| s.label.starts_with("reorder"))
            .map(|s| s.duration)
            .sum()
    }

    /// Time spent in the compute step.
    pub fn compute_time(&self) -> Duration {
        self.steps
            .iter()
            .filter(|s| s.label.starts_with("compute"))
            .map(|s| s.duration)
            .sum()
    }
}

impl fmt::Display for RunProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>4}  {:<32} {:>12} {:>8}", "Step", "Label", "Time", "%")?;
        for step in &self.steps {
            let pct = if self.total.as_nanos() > 0 {
                (step.duration.as_nanos() as f64 / self.total.as_nanos() as f64) * 100.0
            } else {
                0.0
            };
            writeln!(
                f,
                "{:>4}  {:<32} {:>12.2?} {:>7.1}%",
                step.index,
                truncate_str(&step.label, 32),
                step.duration,
                pct
            )?;
        }
        writeln!(f, "Total: {:.2?}", self.total)
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    } else {
        s.to_string()
    }
}
