//! Driver for the attendance edit sidebar: finding it, waiting for it to show
//! the clicked row, resolving the clock-in/clock-out pickers and saving.

use crate::automation::Timings;
use crate::dom::{self, attr_selector, commit_value, normalize, WaitOptions};
use crate::locator::Locator;
use crate::platforms::PageEngine;
use crate::schedule::{Segment, TimeValue};
use crate::{AutomationError, Element};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

pub const SIDEBAR_SELECTORS: &[&str] = &[
    ".rpp-panel-content",
    "app-attendance-entries-panel",
    "app-attendance-entry-form",
    "aside",
    "[role=\"dialog\"]",
    "[data-qa*=\"sidebar\" i]",
    "[class*=\"Sidebar\"]",
    "[class*=\"side-panel\"]",
    "[class*=\"sidepanel\"]",
];

const SIDEBAR_ROOT: &str = "#attendance-right-panel, [role=\"complementary\"], sidebar";

const ADD_ENTRY_SELECTORS: &[&str] = &[
    "#empty-state-action-btn",
    "[data-testid=\"empty-state-action-btn\"]",
    ".add-entry-btn-side-panel button",
    "[data-icon-before=\"time-add\"]",
];
const ADD_ENTRY_TEXT: &[&str] = &["add entry", "add"];

const SAVE_SELECTOR: &str = ".save-btn-side-panel button";
const SAVE_TEXT: &[&str] = &["save"];

const TIME_PICKER: &str = "b-timepicker";
const HOURS_INPUT: &str = "input.btmpckr-input-hours";
const MINUTES_INPUT: &str = "input.btmpckr-input-minutes";

pub const CLOCK_IN_LABEL: &str = "Clock in";
pub const CLOCK_OUT_LABEL: &str = "Clock out";

/// Text cues of a freshly opened panel that cannot show the row label.
const OPENING_CUES: &[&str] = &["entries", "add entry", "clock in"];

const TOAST_SELECTOR: &str =
    "[role=\"alert\"], [role=\"status\"], .toast, [class*=\"toast\"], [class*=\"Toast\"]";
static TOAST_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)updated|saved|attendance").expect("valid toast pattern"));

/// The hours and minutes boxes of one time picker
#[derive(Debug, Clone)]
pub struct TimeInputs {
    pub hours: Element,
    pub minutes: Element,
}

impl TimeInputs {
    pub async fn commit(&self, time: TimeValue) -> Result<(), AutomationError> {
        commit_value(&self.hours, &time.hours()).await?;
        commit_value(&self.minutes, &time.minutes()).await
    }
}

/// A clock-in picker and the clock-out picker of the same entry
#[derive(Debug, Clone)]
pub struct EntryPair {
    pub clock_in: TimeInputs,
    pub clock_out: TimeInputs,
}

impl EntryPair {
    pub async fn fill(&self, segment: &Segment) -> Result<(), AutomationError> {
        self.clock_in.commit(segment.clock_in).await?;
        self.clock_out.commit(segment.clock_out).await
    }
}

/// How the entry form became available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMode {
    /// The sidebar already showed clock-in/clock-out pickers
    ExistingEntry,
    /// The form was created through the "add entry" affordance
    EmptyState,
}

/// The edit surface for one row
#[derive(Debug, Clone)]
pub struct SidebarPanel {
    pub root: Element,
    pub mode: FormMode,
    pub entries: Vec<EntryPair>,
}

/// What a save wait observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveConfirmation {
    /// The sidebar was removed or hidden
    Closed,
    /// A success toast appeared
    Toast,
    /// Nothing observable within the budget; the edit may still have landed
    Unconfirmed,
}

impl SaveConfirmation {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, SaveConfirmation::Unconfirmed)
    }
}

async fn resolve_inputs(root: &Element) -> Result<Option<TimeInputs>, AutomationError> {
    let hours = root.query_selector(HOURS_INPUT).await?;
    let minutes = root.query_selector(MINUTES_INPUT).await?;
    Ok(match (hours, minutes) {
        (Some(hours), Some(minutes)) => Some(TimeInputs { hours, minutes }),
        _ => None,
    })
}

async fn picker_scope(label: &Element) -> Result<Option<Element>, AutomationError> {
    if let Some(picker) = label.closest(TIME_PICKER).await? {
        return Ok(Some(picker));
    }
    let Some(parent) = label.parent().await? else {
        return Ok(None);
    };
    if let Some(picker) = parent.closest(TIME_PICKER).await? {
        return Ok(Some(picker));
    }
    Ok(Some(parent))
}

fn push_unique(found: &mut Vec<TimeInputs>, inputs: TimeInputs) {
    if !found.iter().any(|f| f.hours.same_node(&inputs.hours)) {
        found.push(inputs);
    }
}

/// Every picker in `container` whose label contains `label_text`, in the
/// order the label strategies find them.
pub async fn locate_all_time_inputs(
    container: &Element,
    label_text: &str,
) -> Result<Vec<TimeInputs>, AutomationError> {
    let wanted = normalize(label_text);
    let mut found = Vec::new();

    for label in container.query_selector_all("label").await? {
        if !normalize(&label.text_content().await?).contains(&wanted) {
            continue;
        }

        if let Some(target_id) = label.attribute("for").await? {
            if let Some(target) = container
                .query_selector(&attr_selector("id", &target_id))
                .await?
            {
                if let Some(inputs) = resolve_inputs(&target).await? {
                    push_unique(&mut found, inputs);
                    continue;
                }
            }
        }

        if let Some(scope) = picker_scope(&label).await? {
            if let Some(inputs) = resolve_inputs(&scope).await? {
                push_unique(&mut found, inputs);
            }
        }
    }

    for picker in container.query_selector_all(TIME_PICKER).await? {
        let Some(label) = picker.query_selector("label").await? else {
            continue;
        };
        if !normalize(&label.text_content().await?).contains(&wanted) {
            continue;
        }
        if let Some(inputs) = resolve_inputs(&picker).await? {
            push_unique(&mut found, inputs);
        }
    }

    Ok(found)
}

/// The first picker labelled `label_text`, or `None`.
pub async fn locate_time_inputs(
    container: &Element,
    label_text: &str,
) -> Result<Option<TimeInputs>, AutomationError> {
    Ok(locate_all_time_inputs(container, label_text)
        .await?
        .into_iter()
        .next())
}

/// Clock-in pickers zipped with clock-out pickers, in DOM order.
pub async fn locate_entry_pairs(container: &Element) -> Result<Vec<EntryPair>, AutomationError> {
    let clock_ins = locate_all_time_inputs(container, CLOCK_IN_LABEL).await?;
    let clock_outs = locate_all_time_inputs(container, CLOCK_OUT_LABEL).await?;
    Ok(clock_ins
        .into_iter()
        .zip(clock_outs)
        .map(|(clock_in, clock_out)| EntryPair {
            clock_in,
            clock_out,
        })
        .collect())
}

pub async fn locate_add_entry_button(sidebar: &Element) -> Result<Option<Element>, AutomationError> {
    for selector in ADD_ENTRY_SELECTORS {
        if let Some(button) = sidebar.query_selector(selector).await? {
            return Ok(Some(button));
        }
    }
    dom::find_button_by_visible_text(sidebar, ADD_ENTRY_TEXT).await
}

pub async fn locate_save_button(sidebar: &Element) -> Result<Option<Element>, AutomationError> {
    if let Some(button) = sidebar.query_selector(SAVE_SELECTOR).await? {
        return Ok(Some(button));
    }
    dom::find_button_by_visible_text(sidebar, SAVE_TEXT).await
}

pub async fn has_missing_time_validation(container: &Element) -> Result<bool, AutomationError> {
    let text = normalize(&container.text_content().await?);
    Ok(text.contains("missing clock in") || text.contains("missing clock out"))
}

/// Widens a located sidebar to the panel that also holds its footer buttons.
pub async fn sidebar_root(sidebar: &Element) -> Result<Element, AutomationError> {
    Ok(sidebar
        .closest(SIDEBAR_ROOT)
        .await?
        .unwrap_or_else(|| sidebar.clone()))
}

/// Drives the sidebar of one page
#[derive(Clone)]
pub struct SidebarDriver {
    engine: Arc<dyn PageEngine>,
    timings: Timings,
}

impl SidebarDriver {
    pub fn new(engine: Arc<dyn PageEngine>, timings: Timings) -> Self {
        Self { engine, timings }
    }

    fn wait_options(&self, timeout: std::time::Duration) -> WaitOptions {
        WaitOptions::default()
            .with_timeout(timeout)
            .with_interval(self.timings.poll_interval)
    }

    fn sidebar_locator(&self) -> Locator {
        Locator::new(self.engine.clone(), SIDEBAR_SELECTORS)
            .visible(true)
            .set_default_timeout(self.timings.sidebar_timeout)
    }

    /// First visible sidebar candidate.
    pub async fn locate_sidebar(&self) -> Result<Option<Element>, AutomationError> {
        self.sidebar_locator().first().await
    }

    /// Text of the currently visible sidebar, empty when none is open.
    pub async fn snapshot_text(&self) -> Result<String, AutomationError> {
        match self.locate_sidebar().await? {
            Some(sidebar) => sidebar.text_content().await,
            None => Ok(String::new()),
        }
    }

    async fn sidebar_matching(
        &self,
        label: &str,
        previous: &str,
    ) -> Result<Option<Element>, AutomationError> {
        let Some(sidebar) = self.locate_sidebar().await? else {
            return Ok(None);
        };
        if label.is_empty() {
            return Ok(Some(sidebar));
        }

        let text = normalize(&sidebar.text_content().await?);
        if text.contains(label) {
            return Ok(Some(sidebar));
        }
        if !previous.is_empty()
            && !text.is_empty()
            && text != previous
            && OPENING_CUES.iter().any(|cue| text.contains(cue))
        {
            return Ok(Some(sidebar));
        }
        if previous.is_empty() && !text.is_empty() {
            return Ok(Some(sidebar));
        }
        Ok(None)
    }

    /// Waits until a visible sidebar shows `row_label`, or has changed from
    /// `previous_snapshot` into an entries view, or (with no previous
    /// snapshot) any non-empty sidebar is open.
    #[instrument(level = "debug", skip(self, previous_snapshot))]
    pub async fn await_sidebar_for(
        &self,
        row_label: &str,
        previous_snapshot: &str,
    ) -> Result<Element, AutomationError> {
        let label = normalize(row_label);
        let previous = normalize(previous_snapshot);
        dom::wait_for(
            self.engine.as_ref(),
            || {
                let (label, previous) = (&label, &previous);
                async move {
                    self.sidebar_matching(label, previous)
                        .await
                        .unwrap_or_else(|e| {
                            debug!(error = %e, "Sidebar probe failed");
                            None
                        })
                }
            },
            self.wait_options(self.timings.sidebar_timeout),
        )
        .await
    }

    async fn await_entry_pairs(
        &self,
        root: &Element,
        at_least: usize,
    ) -> Result<Vec<EntryPair>, AutomationError> {
        dom::wait_for(
            self.engine.as_ref(),
            || async move {
                match locate_entry_pairs(root).await {
                    Ok(pairs) if pairs.len() >= at_least => Some(pairs),
                    _ => None,
                }
            },
            self.wait_options(self.timings.entry_form_timeout).within(root),
        )
        .await
    }

    async fn add_entry(&self, root: &Element) -> Result<(), AutomationError> {
        let button = dom::wait_for(
            self.engine.as_ref(),
            || async move { locate_add_entry_button(root).await.ok().flatten() },
            self.wait_options(self.timings.add_entry_timeout).within(root),
        )
        .await?;
        dom::dispatch_click(&button).await
    }

    /// Resolves the entry form under `root`, clicking "add entry" when the
    /// sidebar opened on its empty state.
    #[instrument(level = "debug", skip(self, root))]
    pub async fn open_form(&self, root: &Element) -> Result<SidebarPanel, AutomationError> {
        let entries = locate_entry_pairs(root).await?;
        if !entries.is_empty() {
            return Ok(SidebarPanel {
                root: root.clone(),
                mode: FormMode::ExistingEntry,
                entries,
            });
        }

        self.add_entry(root).await?;
        let entries = self.await_entry_pairs(root, 1).await?;
        Ok(SidebarPanel {
            root: root.clone(),
            mode: FormMode::EmptyState,
            entries,
        })
    }

    /// Fills segment *k* into entry pair *k*, adding entries as needed.
    pub async fn fill_segments(
        &self,
        panel: &mut SidebarPanel,
        segments: &[Segment],
    ) -> Result<(), AutomationError> {
        while panel.entries.len() < segments.len() {
            let have = panel.entries.len();
            self.add_entry(&panel.root).await.map_err(|e| {
                AutomationError::ElementNotFound(format!(
                    "No add-entry control for entry {}: {e}",
                    have + 1
                ))
            })?;
            panel.entries = self.await_entry_pairs(&panel.root, have + 1).await?;
        }

        for (pair, segment) in panel.entries.iter().zip(segments) {
            pair.fill(segment).await?;
        }
        Ok(())
    }

    /// Waits for "missing clock in/out" validation text to go away.
    pub async fn await_validation_clear(&self, root: &Element) -> Result<(), AutomationError> {
        dom::wait_for(
            self.engine.as_ref(),
            || async move {
                match has_missing_time_validation(root).await {
                    Ok(false) => Some(()),
                    _ => None,
                }
            },
            self.wait_options(self.timings.validation_timeout).within(root),
        )
        .await
    }

    pub async fn click_save(&self, root: &Element) -> Result<(), AutomationError> {
        let button = locate_save_button(root)
            .await?
            .ok_or_else(|| AutomationError::ElementNotFound("Save button".to_string()))?;
        dom::dispatch_click(&button).await
    }

    async fn save_signal(&self, sidebar: &Element) -> Result<Option<SaveConfirmation>, AutomationError> {
        let gone = match sidebar.is_connected().await {
            Ok(connected) => !connected,
            Err(_) => true,
        };
        if gone || !dom::is_visible(sidebar).await {
            return Ok(Some(SaveConfirmation::Closed));
        }
        for toast in self.engine.query_selector_all(TOAST_SELECTOR).await? {
            if TOAST_TEXT.is_match(&toast.text_content().await?) {
                return Ok(Some(SaveConfirmation::Toast));
            }
        }
        Ok(None)
    }

    /// Waits for the sidebar to close or a success toast. Running out of time
    /// is reported as [`SaveConfirmation::Unconfirmed`], never as an error.
    #[instrument(level = "debug", skip(self, sidebar))]
    pub async fn await_save_completion(&self, sidebar: &Element) -> SaveConfirmation {
        let outcome = dom::wait_for(
            self.engine.as_ref(),
            || async move { self.save_signal(sidebar).await.ok().flatten() },
            self.wait_options(self.timings.save_timeout),
        )
        .await;
        match outcome {
            Ok(confirmation) => confirmation,
            Err(e) => {
                warn!(error = %e, "Save completion not observed");
                SaveConfirmation::Unconfirmed
            }
        }
    }
}
