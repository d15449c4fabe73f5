use tracing::{debug, instrument};

use crate::dom::{self, WaitOptions};
use crate::element::Element;
use crate::errors::AutomationError;
use crate::platforms::PageEngine;
use std::sync::Arc;
use std::time::Duration;

// Default timeout if none is specified on the locator itself
const DEFAULT_LOCATOR_TIMEOUT: Duration = Duration::from_secs(15);

/// An ordered list of CSS probes for one piece of UI.
///
/// Vendor markup for the same surface varies by entry point, so a locator
/// carries every known shape and tries them in priority order; the first
/// probe that yields an acceptable element wins.
#[derive(Clone)]
pub struct Locator {
    engine: Arc<dyn PageEngine>,
    probes: Vec<String>,
    timeout: Duration, // Default timeout for this locator instance
    root: Option<Element>,
    visible_only: bool,
}

impl Locator {
    /// Create a new locator over the given probes, highest priority first
    pub fn new(engine: Arc<dyn PageEngine>, probes: &[&str]) -> Self {
        Self {
            engine,
            probes: probes.iter().map(|p| p.to_string()).collect(),
            timeout: DEFAULT_LOCATOR_TIMEOUT,
            root: None,
            visible_only: false,
        }
    }

    /// Set a default timeout for [`Locator::wait`].
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Search below `element` instead of the whole document
    pub fn within(mut self, element: &Element) -> Self {
        self.root = Some(element.clone());
        self
    }

    /// Only accept elements that currently have a rendered box
    pub fn visible(mut self, visible_only: bool) -> Self {
        self.visible_only = visible_only;
        self
    }

    async fn probe(&self, selector: &str) -> Result<Vec<Element>, AutomationError> {
        match &self.root {
            Some(root) => root.query_selector_all(selector).await,
            None => self.engine.query_selector_all(selector).await,
        }
    }

    /// First acceptable element, trying probes in priority order.
    pub async fn first(&self) -> Result<Option<Element>, AutomationError> {
        for selector in &self.probes {
            for candidate in self.probe(selector).await? {
                if !self.visible_only || dom::is_visible(&candidate).await {
                    debug!(probe = %selector, "Locator probe matched");
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    /// Every acceptable element from every probe, probe order then DOM order,
    /// without duplicates.
    pub async fn all(&self) -> Result<Vec<Element>, AutomationError> {
        let mut found: Vec<Element> = Vec::new();
        for selector in &self.probes {
            for candidate in self.probe(selector).await? {
                if found.iter().any(|f| f.same_node(&candidate)) {
                    continue;
                }
                if !self.visible_only || dom::is_visible(&candidate).await {
                    found.push(candidate);
                }
            }
        }
        Ok(found)
    }

    /// Wait for an acceptable element to appear, up to the specified timeout.
    /// If no timeout is provided, uses the locator's default timeout.
    #[instrument(level = "debug", skip(self, timeout), fields(probes = %self.selector_string()))]
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Element, AutomationError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        let mut options = WaitOptions::default().with_timeout(effective_timeout);
        if let Some(root) = &self.root {
            options = options.within(root);
        }

        dom::wait_for(
            self.engine.as_ref(),
            || async move { self.first().await.ok().flatten() },
            options,
        )
        .await
        .map_err(|e| match e {
            AutomationError::Timeout(_) => AutomationError::Timeout(format!(
                "Timed out after {effective_timeout:?} waiting for {}",
                self.selector_string()
            )),
            other => other,
        })
    }

    pub fn selector_string(&self) -> String {
        self.probes.join(" | ")
    }
}
