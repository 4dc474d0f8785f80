//! Engine configuration

use serde::{Deserialize, Serialize};

/// Default values for engine configuration
pub mod defaults {
    /// Operation bodies allowed in flight within one update
    pub const MAX_CONCURRENT_TASKS: usize = 8;
    /// Buffered events per subscriber before it starts lagging
    pub const EVENT_CAPACITY: usize = 256;
    /// Turn panicking bodies into cell errors
    pub const CATCH_PANICS: bool = true;
}

/// Tunables of the update/apply engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum number of operation bodies running concurrently (at least 1)
    pub max_concurrent_tasks: usize,
    /// Capacity of the broadcast channel behind `State::subscribe`
    pub event_capacity: usize,
    /// Catch panics in operation bodies and report them as cell errors
    pub catch_panics: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: defaults::MAX_CONCURRENT_TASKS,
            event_capacity: defaults::EVENT_CAPACITY,
            catch_panics: defaults::CATCH_PANICS,
        }
    }
}

impl EngineConfig {
    /// Run bodies one at a time
    pub fn sequential() -> Self {
        Self {
            max_concurrent_tasks: 1,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.max_concurrent_tasks.max(1)
    }
}
