//! Ambient context handed to operations.
//!
//! - [`GlobalContext`]: typed map of host objects (services, caches,
//!   settings) that schema functions, applicability predicates and bodies
//!   may read. Passed by the caller, never owned by the tree.
//! - [`CancellationToken`]: cooperative cancellation flag.
//! - [`RuntimeContext`]: what a running body sees: its cell ref, the
//!   cancellation flag and a progress channel.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StateError};
use crate::events::{EventSink, StateEvent};
use crate::tree::Ref;

/// Typed map for injecting non-serializable host objects into operations.
pub struct GlobalContext {
    inner: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl GlobalContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    /// Insert a typed value under the given key, replacing any previous one.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: &str, value: T) {
        self.inner.insert(key.to_string(), Box::new(value));
    }

    /// Get a typed value by key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<&T> {
        self.inner.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for cooperative cancellation.
///
/// Clones share the flag. The engine never aborts a body; bodies poll
/// [`RuntimeContext::is_cancelled`] or call [`RuntimeContext::checkpoint`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Context passed to a running transform body.
#[derive(Clone)]
pub struct RuntimeContext {
    cell_ref: Ref,
    cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
    global: Arc<GlobalContext>,
}

impl RuntimeContext {
    pub(crate) fn new(
        cell_ref: Ref,
        cancel: CancellationToken,
        sink: Arc<dyn EventSink>,
        global: Arc<GlobalContext>,
    ) -> Self {
        Self {
            cell_ref,
            cancel,
            sink,
            global,
        }
    }

    /// Context detached from any state, for calling bodies directly.
    pub fn detached(cell_ref: impl Into<Ref>) -> Self {
        Self::new(
            cell_ref.into(),
            CancellationToken::new(),
            Arc::new(crate::events::NullEventSink),
            Arc::new(GlobalContext::new()),
        )
    }

    /// Ref of the cell being computed
    pub fn cell_ref(&self) -> &str {
        &self.cell_ref
    }

    pub fn global(&self) -> &GlobalContext {
        &self.global
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`StateError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StateError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report a human-readable phase message.
    pub fn update(&self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("[{}] {}", self.cell_ref, message);
        let event = StateEvent::Progress {
            cell_ref: Some(self.cell_ref.clone()),
            message,
        };
        if let Err(e) = self.sink.send(event) {
            log::trace!("Progress event dropped: {}", e);
        }
    }

    /// Named suspension point: report progress, yield to the scheduler,
    /// then observe cancellation.
    pub async fn checkpoint(&self, message: impl Into<String>) -> Result<()> {
        self.update(message);
        tokio::task::yield_now().await;
        self.check_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VecEventSink;

    #[test]
    fn test_global_context_typed_lookup() {
        let mut global = GlobalContext::new();
        global.set("count", 42u32);
        global.set("name", "membrane".to_string());

        assert_eq!(global.get::<u32>("count"), Some(&42));
        assert!(global.get::<String>("count").is_none());
        assert!(global.has("name"));
        assert!(!global.has("missing"));
    }

    #[test]
    fn test_token_clones_share_flag() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_checkpoint_reports_and_observes_cancellation() {
        let sink = Arc::new(VecEventSink::new());
        let token = CancellationToken::new();
        let ctx = RuntimeContext::new(
            "cell-1".to_string(),
            token.clone(),
            sink.clone(),
            Arc::new(GlobalContext::new()),
        );

        ctx.checkpoint("Initialize").await.unwrap();
        token.cancel();
        let err = ctx.checkpoint("Refine").await.unwrap_err();
        assert!(err.is_cancelled());

        let messages: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StateEvent::Progress { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["Initialize", "Refine"]);
    }
}
