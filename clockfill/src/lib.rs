//! Attendance timesheet auto-filler
//!
//! Scans an attendance grid for rows flagged as missing clock-in/clock-out
//! entries, opens each row's edit sidebar, fills the configured shift and
//! saves, reporting progress as it goes. The engine talks to the page only
//! through [`PageEngine`], so it runs against a live browser tab (via the
//! extension bridge) or an in-memory page in tests.

use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub mod automation;
pub mod config;
pub mod controller;
pub mod dom;
pub mod element;
pub mod errors;
pub mod extension_bridge;
pub mod locator;
pub mod messages;
pub mod platforms;
pub mod rows;
pub mod schedule;
pub mod sidebar;
#[cfg(test)]
pub mod testing;
#[cfg(test)]
mod tests;

pub use automation::{
    AutomationSession, NoProgress, ProgressSink, ProgressState, RowOutcome, RunResult, SkipReason,
    Timings,
};
pub use config::Settings;
pub use controller::AutomationController;
pub use element::{DomEvent, Element, ElementImpl};
pub use errors::AutomationError;
pub use extension_bridge::ExtensionBridge;
pub use locator::Locator;
pub use messages::RelayMessage;
pub use platforms::{MutationWatch, PageEngine};
pub use rows::Grid;
pub use schedule::{ShiftSettings, TimeValue};
pub use sidebar::SidebarDriver;

/// The main entry point: one automatable page
#[derive(Clone)]
pub struct Page {
    engine: Arc<dyn PageEngine>,
    timings: Timings,
}

impl Page {
    pub fn new(engine: Arc<dyn PageEngine>) -> Self {
        Self {
            engine,
            timings: Timings::default(),
        }
    }

    /// The active tab of the extension connected to `bridge`, waiting up to
    /// `connect_timeout` for the extension to show up.
    #[instrument(skip(bridge))]
    pub async fn connect(
        bridge: Arc<ExtensionBridge>,
        connect_timeout: Duration,
    ) -> Result<Self, AutomationError> {
        if !bridge.wait_for_client(connect_timeout).await {
            return Err(AutomationError::PlatformError(format!(
                "Extension did not connect within {connect_timeout:?}. Make sure it is installed and the attendance page is open."
            )));
        }
        Ok(Self::new(Arc::new(platforms::BridgeEngine::new(bridge))))
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn engine(&self) -> Arc<dyn PageEngine> {
        self.engine.clone()
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn locator(&self, probes: &[&str]) -> Locator {
        Locator::new(self.engine.clone(), probes)
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.engine.clone())
    }

    pub fn sidebar(&self) -> SidebarDriver {
        SidebarDriver::new(self.engine.clone(), self.timings.clone())
    }

    /// A fresh automation run over this page.
    pub fn session(&self, settings: ShiftSettings) -> AutomationSession {
        AutomationSession::with_timings(self.engine.clone(), settings, self.timings.clone())
    }

    pub fn controller(&self) -> AutomationController {
        AutomationController::with_timings(self.engine.clone(), self.timings.clone())
    }
}
