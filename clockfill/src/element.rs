use crate::errors::AutomationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Debug;
use tracing::instrument;

/// DOM events the engine dispatches on page elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomEvent {
    Click,
    FocusIn,
    Input,
    Change,
    Blur,
    FocusOut,
}

impl DomEvent {
    /// The DOM event type name (`"focusin"`, `"change"`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            DomEvent::Click => "click",
            DomEvent::FocusIn => "focusin",
            DomEvent::Input => "input",
            DomEvent::Change => "change",
            DomEvent::Blur => "blur",
            DomEvent::FocusOut => "focusout",
        }
    }

    /// Whether the platform constructs this as a `MouseEvent` rather than a plain `Event`.
    pub fn is_pointer(&self) -> bool {
        matches!(self, DomEvent::Click)
    }
}

impl fmt::Display for DomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computed paint colors of an element, as CSS color strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedColors {
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub background_color: String,
    #[serde(default)]
    pub fill: String,
    #[serde(default)]
    pub stroke: String,
}

impl ComputedColors {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        [
            self.color.as_str(),
            self.background_color.as_str(),
            self.fill.as_str(),
            self.stroke.as_str(),
        ]
        .into_iter()
    }
}

/// Text and paint of one possible warning badge inside a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorSample {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub colors: ComputedColors,
}

/// What the warning check reads from one row.
///
/// `marker` is the first matching marker selector. When it is set,
/// `indicators` may be left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningSnapshot {
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub indicators: Vec<IndicatorSample>,
}

/// Interface for backend-specific element implementations
#[async_trait]
pub trait ElementImpl: Send + Sync + Debug {
    /// Identity of the underlying node; equal ids mean the same live node.
    fn object_id(&self) -> String;
    async fn tag_name(&self) -> Result<String, AutomationError>;
    async fn attribute(&self, name: &str) -> Result<Option<String>, AutomationError>;
    async fn text_content(&self) -> Result<String, AutomationError>;
    /// Descendants matching a CSS selector, in document order.
    async fn query_selector_all(&self, selector: &str) -> Result<Vec<Element>, AutomationError>;
    async fn closest(&self, selector: &str) -> Result<Option<Element>, AutomationError>;
    async fn parent(&self) -> Result<Option<Element>, AutomationError>;
    /// True iff the element has a non-zero rendered box or any client rects.
    async fn has_layout(&self) -> Result<bool, AutomationError>;
    async fn computed_colors(&self) -> Result<ComputedColors, AutomationError>;
    /// False once the node has been removed from the document.
    async fn is_connected(&self) -> Result<bool, AutomationError>;
    /// Fires a bubbling, cancelable event of the given kind.
    async fn dispatch_event(&self, event: DomEvent) -> Result<(), AutomationError>;
    /// Assigns `value` through the platform's native input value setter, firing no events.
    async fn set_native_value(&self, value: &str) -> Result<(), AutomationError>;
    async fn scroll_into_view(&self) -> Result<(), AutomationError>;

    /// Reads the first descendant matching any of `markers`, else text and
    /// colors of every descendant matching `candidates`. Backends with a
    /// per-call cost override this to answer in one call.
    async fn warning_snapshot(
        &self,
        markers: &[&str],
        candidates: &str,
    ) -> Result<WarningSnapshot, AutomationError> {
        for marker in markers {
            if !self.query_selector_all(marker).await?.is_empty() {
                return Ok(WarningSnapshot {
                    marker: Some(marker.to_string()),
                    indicators: Vec::new(),
                });
            }
        }
        let mut indicators = Vec::new();
        for candidate in self.query_selector_all(candidates).await? {
            indicators.push(IndicatorSample {
                text: candidate.text_content().await?,
                colors: candidate.computed_colors().await?,
            });
        }
        Ok(WarningSnapshot {
            marker: None,
            indicators,
        })
    }

    fn clone_box(&self) -> Box<dyn ElementImpl>;

    /// Enable downcasting to the backend's concrete element type
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Represents one element of the automated page
pub struct Element {
    inner: Box<dyn ElementImpl>,
}

impl Element {
    /// Create a new element from a backend-specific implementation
    pub fn new(impl_: Box<dyn ElementImpl>) -> Self {
        Self { inner: impl_ }
    }

    pub fn object_id(&self) -> String {
        self.inner.object_id()
    }

    /// Whether both handles point at the same live node
    pub fn same_node(&self, other: &Element) -> bool {
        self.object_id() == other.object_id()
    }

    pub async fn tag_name(&self) -> Result<String, AutomationError> {
        self.inner.tag_name().await
    }

    pub async fn attribute(&self, name: &str) -> Result<Option<String>, AutomationError> {
        self.inner.attribute(name).await
    }

    /// Check whether the `class` attribute contains the given token
    pub async fn has_class(&self, class_name: &str) -> Result<bool, AutomationError> {
        Ok(self
            .attribute("class")
            .await?
            .map(|classes| classes.split_whitespace().any(|c| c == class_name))
            .unwrap_or(false))
    }

    pub async fn text_content(&self) -> Result<String, AutomationError> {
        self.inner.text_content().await
    }

    pub async fn query_selector_all(
        &self,
        selector: &str,
    ) -> Result<Vec<Element>, AutomationError> {
        self.inner.query_selector_all(selector).await
    }

    /// First descendant matching the selector
    pub async fn query_selector(&self, selector: &str) -> Result<Option<Element>, AutomationError> {
        Ok(self.query_selector_all(selector).await?.into_iter().next())
    }

    pub async fn closest(&self, selector: &str) -> Result<Option<Element>, AutomationError> {
        self.inner.closest(selector).await
    }

    pub async fn parent(&self) -> Result<Option<Element>, AutomationError> {
        self.inner.parent().await
    }

    pub async fn has_layout(&self) -> Result<bool, AutomationError> {
        self.inner.has_layout().await
    }

    pub async fn computed_colors(&self) -> Result<ComputedColors, AutomationError> {
        self.inner.computed_colors().await
    }

    pub async fn is_connected(&self) -> Result<bool, AutomationError> {
        self.inner.is_connected().await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn dispatch_event(&self, event: DomEvent) -> Result<(), AutomationError> {
        self.inner.dispatch_event(event).await
    }

    pub async fn set_native_value(&self, value: &str) -> Result<(), AutomationError> {
        self.inner.set_native_value(value).await
    }

    pub async fn scroll_into_view(&self) -> Result<(), AutomationError> {
        self.inner.scroll_into_view().await
    }

    pub async fn warning_snapshot(
        &self,
        markers: &[&str],
        candidates: &str,
    ) -> Result<WarningSnapshot, AutomationError> {
        self.inner.warning_snapshot(markers, candidates).await
    }

    /// Get the underlying implementation
    pub fn inner(&self) -> &dyn ElementImpl {
        self.inner.as_ref()
    }
}

impl Clone for Element {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone_box(),
        }
    }
}

impl Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("object_id", &self.object_id())
            .finish()
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}
