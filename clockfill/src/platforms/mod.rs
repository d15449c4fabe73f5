use crate::{AutomationError, Element};
use std::fmt;
use tokio::sync::mpsc;

pub mod bridge;

pub use bridge::BridgeEngine;

/// The common trait that every page backend must implement
#[async_trait::async_trait]
pub trait PageEngine: Send + Sync {
    /// Document-wide `querySelectorAll`, in document order
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, AutomationError>;

    async fn query_selector(&self, selector: &str) -> Result<Option<Element>, AutomationError> {
        Ok(self.query_selector_all(selector).await?.into_iter().next())
    }

    /// Start observing child-list, subtree and attribute mutations under `root`
    /// (the whole document when `None`).
    async fn observe_mutations(
        &self,
        root: Option<&Element>,
    ) -> Result<MutationWatch, AutomationError>;
}

type Teardown = Box<dyn FnOnce() + Send>;

/// A live mutation subscription.
///
/// The teardown runs exactly once: on `disconnect()` or, failing that, on drop.
pub struct MutationWatch {
    events: mpsc::UnboundedReceiver<()>,
    teardown: Option<Teardown>,
}

impl MutationWatch {
    pub fn new(
        events: mpsc::UnboundedReceiver<()>,
        teardown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Resolves on the next mutation signal. A closed feed never resolves,
    /// leaving callers to their polling fallback.
    pub async fn changed(&mut self) {
        if self.events.recv().await.is_some() {
            // Collapse a burst of records into one wakeup.
            while self.events.try_recv().is_ok() {}
            return;
        }
        std::future::pending::<()>().await
    }

    pub fn disconnect(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.teardown.is_some()
    }
}

impl Drop for MutationWatch {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for MutationWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationWatch")
            .field("connected", &self.is_connected())
            .finish()
    }
}
