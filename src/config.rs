use std::num::NonZeroUsize;

use serde::Deserialize;

use crate::error::ImportError;

/// Configuration of an [`ImportManager`](crate::ImportManager).
///
/// All fields are optional when deserializing, missing ones take their
/// default values.
///
/// ```rust
/// use yomikomi::ImportConfig;
///
/// let config = ImportConfig::from_json(r#"{ "workers": 4, "max_active_sessions": 2 }"#).unwrap();
/// assert_eq!(config.worker_count(), 4);
/// assert_eq!(config.session_budget(), 2);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    /// Number of threads in the worker pool, `0` picks the available
    /// parallelism of the machine.
    pub workers: usize,
    /// How many sessions may run at once. Defaults to the worker count.
    pub max_active_sessions: Option<usize>,
    /// Name of the single thread running designated-only tasks.
    pub designated_thread_name: String,
    /// Prefix of the worker thread names, suffixed with the thread index.
    pub worker_thread_prefix: String,
    /// Whether sessions attach a progress bar to their tracing span.
    pub progress: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_active_sessions: None,
            designated_thread_name: "yomikomi-designated".into(),
            worker_thread_prefix: "yomikomi-worker".into(),
            progress: true,
        }
    }
}

impl ImportConfig {
    pub fn from_json(text: &str) -> Result<Self, ImportError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_session_budget(mut self, budget: usize) -> Self {
        self.max_active_sessions = Some(budget);
        self
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.max_active_sessions == Some(0) {
            return Err(ImportError::Config(
                "max_active_sessions must be at least 1".into(),
            ));
        }

        if self.designated_thread_name.is_empty() {
            return Err(ImportError::Config(
                "designated_thread_name must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Resolved size of the worker pool.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            n => n,
        }
    }

    /// Resolved number of sessions allowed past admission at once.
    pub fn session_budget(&self) -> usize {
        self.max_active_sessions
            .unwrap_or_else(|| self.worker_count())
    }
}
