//! The automation loop: scan for warning rows, drive each through the
//! sidebar, and report progress until nothing is pending, the run is
//! cancelled, or the iteration cap is hit.

use crate::dom::{self, WaitOptions};
use crate::platforms::PageEngine;
use crate::rows::{self, Grid};
use crate::schedule::ShiftSettings;
use crate::sidebar::{self, SidebarDriver};
use crate::{AutomationError, Element};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Wait budgets and settle pauses used by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub sidebar_timeout: Duration,
    pub add_entry_timeout: Duration,
    pub entry_form_timeout: Duration,
    pub validation_timeout: Duration,
    pub save_timeout: Duration,
    pub warning_clear_timeout: Duration,
    /// Pause after scrolling a row into view
    pub scroll_settle: Duration,
    /// Pause after a saved row before the next scan
    pub row_settle: Duration,
    pub poll_interval: Duration,
    /// Hard cap on rows picked per run
    pub max_iterations: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            sidebar_timeout: dom::DEFAULT_WAIT_TIMEOUT,
            add_entry_timeout: Duration::from_secs(15),
            entry_form_timeout: dom::DEFAULT_WAIT_TIMEOUT,
            validation_timeout: Duration::from_secs(4),
            save_timeout: Duration::from_secs(20),
            warning_clear_timeout: Duration::from_secs(8),
            scroll_settle: Duration::from_millis(250),
            row_settle: Duration::from_millis(400),
            poll_interval: dom::DEFAULT_POLL_INTERVAL,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Warning rows counted once at run start
    pub total: usize,
    /// Rows attempted so far
    pub completed: usize,
    /// Rows whose save was confirmed
    pub saved: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub processed_count: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The row id no longer resolves to an element
    RowNotFound,
    /// The row stopped showing a warning before it was opened
    WarningCleared,
    /// No clock-in/clock-out pickers, even after "add entry"
    InputsNotFound,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::RowNotFound => f.write_str("row not found"),
            SkipReason::WarningCleared => f.write_str("warning already cleared"),
            SkipReason::InputsNotFound => f.write_str("time inputs not found"),
        }
    }
}

/// How one picked row ended. Anything but `Saved` leaves the row for a later run.
#[derive(Debug)]
pub enum RowOutcome {
    Saved,
    Skipped(SkipReason),
    Failed(AutomationError),
}

impl RowOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, RowOutcome::Saved)
    }
}

/// Receives a progress snapshot after every state change.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, state: ProgressState);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressState> {
    fn emit(&self, state: ProgressState) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(state);
    }
}

/// Discards progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _state: ProgressState) {}
}

/// One automation run against one page. Create a fresh session per run.
pub struct AutomationSession {
    grid: Grid,
    sidebar: SidebarDriver,
    engine: Arc<dyn PageEngine>,
    settings: ShiftSettings,
    timings: Timings,
    cancel: CancellationToken,
    rng: StdRng,
    processed: HashSet<String>,
    progress: ProgressState,
}

impl AutomationSession {
    pub fn new(engine: Arc<dyn PageEngine>, settings: ShiftSettings) -> Self {
        Self::with_timings(engine, settings, Timings::default())
    }

    pub fn with_timings(
        engine: Arc<dyn PageEngine>,
        settings: ShiftSettings,
        timings: Timings,
    ) -> Self {
        Self {
            grid: Grid::new(engine.clone()),
            sidebar: SidebarDriver::new(engine.clone(), timings.clone()),
            engine,
            settings,
            timings,
            cancel: CancellationToken::new(),
            rng: StdRng::from_entropy(),
            processed: HashSet::new(),
            progress: ProgressState::default(),
        }
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Deterministic jitter for randomized times.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> ProgressState {
        self.progress
    }

    /// Row ids picked so far in this run.
    pub fn processed_row_ids(&self) -> &HashSet<String> {
        &self.processed
    }

    /// Runs until no unattempted warning row remains, cancellation is
    /// observed at an iteration boundary, or the iteration cap is reached.
    #[instrument(skip(self, sink), fields(clock_in = %self.settings.clock_in, clock_out = %self.settings.clock_out))]
    pub async fn run(&mut self, sink: &dyn ProgressSink) -> Result<RunResult, AutomationError> {
        self.progress = ProgressState {
            total: self.grid.pending_warning_row_ids().await?.len(),
            completed: 0,
            saved: 0,
        };
        info!(total = self.progress.total, "Starting attendance run");
        sink.emit(self.progress);

        let mut cancelled = false;
        let mut iterations = 0;
        while iterations < self.timings.max_iterations {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let pending: Vec<String> = self
                .grid
                .pending_warning_row_ids()
                .await?
                .into_iter()
                .filter(|id| !self.processed.contains(id))
                .collect();
            let Some(row_id) = pending.into_iter().next() else {
                break;
            };

            self.processed.insert(row_id.clone());
            iterations += 1;
            self.progress.completed += 1;
            sink.emit(self.progress);

            let (outcome, label) = self.attempt_row(&row_id).await;
            match outcome {
                RowOutcome::Saved => {
                    self.progress.saved += 1;
                    sink.emit(self.progress);
                    self.settle_after_save(&row_id, &label).await;
                }
                RowOutcome::Skipped(reason) => {
                    debug!(row_id = %row_id, %reason, "Row skipped");
                }
                RowOutcome::Failed(_) => {}
            }
        }

        if iterations >= self.timings.max_iterations {
            warn!(
                cap = self.timings.max_iterations,
                "Iteration cap reached; stopping run"
            );
        }

        sink.emit(self.progress);
        info!(
            saved = self.progress.saved,
            completed = self.progress.completed,
            cancelled,
            "Attendance run finished"
        );
        Ok(RunResult {
            processed_count: self.progress.saved,
            cancelled,
        })
    }

    /// Opens, fills and saves one row. Never propagates: every failure
    /// becomes the row's outcome.
    pub async fn process_row(&mut self, row_id: &str) -> RowOutcome {
        self.attempt_row(row_id).await.0
    }

    /// The row's outcome and the label it was logged under (the row id until
    /// the row resolves).
    async fn attempt_row(&mut self, row_id: &str) -> (RowOutcome, String) {
        let row = match self.grid.resolve_row_element(row_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(row = %row_id, "Row not found; skipping");
                return (
                    RowOutcome::Skipped(SkipReason::RowNotFound),
                    row_id.to_string(),
                );
            }
            Err(e) => {
                warn!(row = %row_id, error = %e, "Row lookup failed; skipping");
                return (RowOutcome::Failed(e), row_id.to_string());
            }
        };

        let label = rows::extract_label(&row)
            .await
            .unwrap_or_else(|_| row_id.to_string());

        match rows::row_has_warning(&row).await {
            Ok(true) => {}
            Ok(false) => {
                info!(row = %label, "Row no longer has a warning; skipping");
                return (RowOutcome::Skipped(SkipReason::WarningCleared), label);
            }
            Err(e) => {
                warn!(row = %label, error = %e, "Warning check failed; skipping");
                return (RowOutcome::Failed(e), label);
            }
        }

        let outcome = match self.drive_row(&row, &label).await {
            Ok(outcome) => {
                if outcome.is_saved() {
                    info!(row = %label, "Updated row");
                }
                outcome
            }
            Err(e) => {
                warn!(row = %label, error = %e, "Failed on row; skipping");
                RowOutcome::Failed(e)
            }
        };
        (outcome, label)
    }

    async fn drive_row(&mut self, row: &Element, label: &str) -> Result<RowOutcome, AutomationError> {
        let previous_snapshot = self.sidebar.snapshot_text().await?;
        row.scroll_into_view().await?;
        tokio::time::sleep(self.timings.scroll_settle).await;

        let target = self.grid.click_target(row).await?;
        dom::dispatch_click(&target).await?;

        let located = self
            .sidebar
            .await_sidebar_for(label, &previous_snapshot)
            .await?;
        let root = sidebar::sidebar_root(&located).await?;

        let mut panel = match self.sidebar.open_form(&root).await {
            Ok(panel) => panel,
            Err(e @ (AutomationError::Timeout(_) | AutomationError::ElementNotFound(_))) => {
                warn!(row = %label, error = %e, "Time inputs not found; skipping");
                return Ok(RowOutcome::Skipped(SkipReason::InputsNotFound));
            }
            Err(e) => return Err(e),
        };
        debug!(row = %label, mode = ?panel.mode, "Entry form ready");

        let segments = self.settings.plan(&mut self.rng);
        self.sidebar.fill_segments(&mut panel, &segments).await?;

        if let Err(e) = self.sidebar.await_validation_clear(&panel.root).await {
            warn!(row = %label, error = %e, "Time validation still shows missing entries");
        }

        self.sidebar.click_save(&panel.root).await?;
        let confirmation = self.sidebar.await_save_completion(&panel.root).await;
        if !confirmation.is_confirmed() {
            warn!(row = %label, "Save did not complete; skipping");
            return Ok(RowOutcome::Failed(AutomationError::SaveUnconfirmed(
                label.to_string(),
            )));
        }

        Ok(RowOutcome::Saved)
    }

    /// Waits for the saved row's warning to clear, then lets the grid settle.
    async fn settle_after_save(&self, row_id: &str, label: &str) {
        let grid = &self.grid;
        let cleared = dom::wait_for(
            self.engine.as_ref(),
            || async move {
                match grid.resolve_row_element(row_id).await {
                    Ok(Some(row)) => match rows::row_has_warning(&row).await {
                        Ok(false) => Some(()),
                        _ => None,
                    },
                    Ok(None) => Some(()),
                    Err(_) => None,
                }
            },
            WaitOptions::default()
                .with_timeout(self.timings.warning_clear_timeout)
                .with_interval(self.timings.poll_interval),
        )
        .await;
        if let Err(e) = cleared {
            warn!(row = %label, error = %e, "Warning badge did not clear");
        }
        tokio::time::sleep(self.timings.row_settle).await;
    }
}
