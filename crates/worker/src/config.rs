use plansight_client::synchronizer::SyncConfig;
use plansight_queue::QueueConfig;

/// Everything the worker reads from the environment.
///
/// | Env Var            | Default |
/// |--------------------|---------|
/// | `WATCH_PROJECT_ID` | unset   |
/// | `WATCH_BATCH_ID`   | unset   |
///
/// plus the variables documented on [`QueueConfig::from_env`] and
/// [`SyncConfig::from_env`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    /// Project whose server-side processing is followed until it settles.
    pub watch_project_id: Option<String>,
    /// Queued batch whose server-side status is polled until it settles.
    pub watch_batch_id: Option<String>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            queue: QueueConfig::from_env(),
            sync: SyncConfig::from_env(),
            watch_project_id: non_blank(std::env::var("WATCH_PROJECT_ID").ok()),
            watch_batch_id: non_blank(std::env::var("WATCH_BATCH_ID").ok()),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
