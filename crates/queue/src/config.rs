use std::path::PathBuf;

/// Default directory batches are exported into.
pub const DEFAULT_QUEUE_ROOT: &str = "./queue";

/// Default directory the external worker writes results into.
pub const DEFAULT_RESULTS_ROOT: &str = "./results";

/// Locations of the two shared directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub queue_root: PathBuf,
    pub results_root: PathBuf,
}

impl QueueConfig {
    pub fn new(queue_root: impl Into<PathBuf>, results_root: impl Into<PathBuf>) -> Self {
        Self {
            queue_root: queue_root.into(),
            results_root: results_root.into(),
        }
    }

    /// Load from environment variables with defaults.
    ///
    /// | Env Var        | Default     |
    /// |----------------|-------------|
    /// | `QUEUE_ROOT`   | `./queue`   |
    /// | `RESULTS_ROOT` | `./results` |
    pub fn from_env() -> Self {
        let queue_root = std::env::var("QUEUE_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE_ROOT.into());
        let results_root = std::env::var("RESULTS_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RESULTS_ROOT.into());

        Self::new(queue_root, results_root)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_ROOT, DEFAULT_RESULTS_ROOT)
    }
}
