//! Row and warning detection for the attendance grid.
//!
//! The grid renders each record twice (frozen left columns and scrollable
//! center columns) and sometimes falls back to plain tables, so every lookup
//! here is a list of shapes tried in priority order.

use crate::dom::{self, attr_selector, normalize};
use crate::element::IndicatorSample;
use crate::platforms::PageEngine;
use crate::{AutomationError, Element};
use std::sync::Arc;
use tracing::{debug, instrument};

pub const ROW_ID_ATTR: &str = "row-id";

const PINNED_CONTAINER: &str = ".ag-pinned-left-cols-container";
const CENTER_CONTAINER: &str = ".ag-center-cols-container";
const GRID_CELL: &str = "[role=\"gridcell\"]";
const SUMMARY_CLASSES: [&str; 2] = ["row-summary", "is-summary"];

const WARNING_SELECTORS: &[&str] = &[
    ".alert-icons .b-icon-error",
    ".alert-icons .error-icon",
    ".alert-icons .alert-label",
    "[data-icon-before=\"error\"]",
    "[data-qa*=\"warning\" i]",
    "[data-qa*=\"alert\" i]",
    "[data-qa*=\"missing\" i]",
    "[aria-label*=\"warning\" i]",
    "[aria-label*=\"missing\" i]",
    "[aria-label*=\"alert\" i]",
    "[title*=\"warning\" i]",
    "[title*=\"missing\" i]",
    "[title*=\"alert\" i]",
    ".warning",
    ".alert",
    ".error",
];

const INDICATOR_CANDIDATES: &str = "svg, span, i, div";
const DATE_CELL: &str = "[col-id*=\"date\"] .ag-cell-value";
const LABEL_CELLS: &str = "td, [role=\"gridcell\"]";

/// Text a warning badge renders; never a meaningful row label.
fn is_badge_text(text: &str) -> bool {
    text == "1" || text == "!"
}

/// Where data rows are read from, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    /// Frozen left columns of the virtualized grid
    PinnedGrid,
    /// Plain `<table>` rendering
    TableBody,
    /// Any ARIA grid row holding at least one cell
    GenericGrid,
}

impl RowSource {
    pub const PRIORITY: [RowSource; 3] = [
        RowSource::PinnedGrid,
        RowSource::TableBody,
        RowSource::GenericGrid,
    ];

    fn selector(&self) -> String {
        match self {
            RowSource::PinnedGrid => format!("{PINNED_CONTAINER} [role=\"row\"].ag-row"),
            RowSource::TableBody => "table tbody tr".to_string(),
            RowSource::GenericGrid => "[role=\"row\"]".to_string(),
        }
    }

    async fn probe(&self, engine: &dyn PageEngine) -> Result<Vec<Element>, AutomationError> {
        let mut rows = Vec::new();
        for row in engine.query_selector_all(&self.selector()).await? {
            if is_summary_row(&row).await? {
                continue;
            }
            let needs_cell = matches!(self, RowSource::PinnedGrid | RowSource::GenericGrid);
            if needs_cell && row.query_selector(GRID_CELL).await?.is_none() {
                continue;
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// One rendering of an attendance record. Only `row_id` outlives a scan.
#[derive(Debug, Clone)]
pub struct GridRow {
    pub row_id: String,
    pub element: Element,
}

pub async fn is_summary_row(row: &Element) -> Result<bool, AutomationError> {
    for class in SUMMARY_CLASSES {
        if row.has_class(class).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn looks_like_badge(sample: &IndicatorSample) -> bool {
    is_badge_text(&normalize(&sample.text)) || sample.colors.iter().any(dom::is_reddish)
}

/// Known warning markers, or the red-badge heuristic when the grid renders
/// an unmarked icon font.
pub async fn row_has_warning(row: &Element) -> Result<bool, AutomationError> {
    let snapshot = row
        .warning_snapshot(WARNING_SELECTORS, INDICATOR_CANDIDATES)
        .await?;
    if let Some(marker) = &snapshot.marker {
        debug!(%marker, "Row carries a warning marker");
        return Ok(true);
    }
    Ok(snapshot.indicators.iter().any(looks_like_badge))
}

/// Any `svg/span/i/div` reading exactly `!` or `1`, or painted red.
pub async fn has_red_indicator(row: &Element) -> Result<bool, AutomationError> {
    let snapshot = row.warning_snapshot(&[], INDICATOR_CANDIDATES).await?;
    Ok(snapshot.indicators.iter().any(looks_like_badge))
}

/// Date cell text, else the first non-badge cell text, else the row's text.
pub async fn extract_label(row: &Element) -> Result<String, AutomationError> {
    if let Some(date_cell) = row.query_selector(DATE_CELL).await? {
        let text = date_cell.text_content().await?.trim().to_string();
        if !text.is_empty() {
            return Ok(text);
        }
    }

    for cell in row.query_selector_all(LABEL_CELLS).await? {
        let text = cell.text_content().await?.trim().to_string();
        if !text.is_empty() && !is_badge_text(&text) {
            return Ok(text);
        }
    }

    Ok(row.text_content().await?.trim().to_string())
}

/// Read-only view over the attendance grid of one page
#[derive(Clone)]
pub struct Grid {
    engine: Arc<dyn PageEngine>,
}

impl Grid {
    pub fn new(engine: Arc<dyn PageEngine>) -> Self {
        Self { engine }
    }

    /// Data rows from the first row source that yields any.
    pub async fn list_data_rows(&self) -> Result<Vec<Element>, AutomationError> {
        for source in RowSource::PRIORITY {
            let rows = source.probe(self.engine.as_ref()).await?;
            if !rows.is_empty() {
                debug!(?source, count = rows.len(), "Resolved grid rows");
                return Ok(rows);
            }
        }
        Ok(Vec::new())
    }

    /// Data rows that show a warning and carry a row id.
    pub async fn warning_rows(&self) -> Result<Vec<GridRow>, AutomationError> {
        let mut found = Vec::new();
        for element in self.list_data_rows().await? {
            if !row_has_warning(&element).await? {
                continue;
            }
            if let Some(row_id) = element.attribute(ROW_ID_ATTR).await? {
                if !row_id.is_empty() {
                    found.push(GridRow { row_id, element });
                }
            }
        }
        Ok(found)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn pending_warning_row_ids(&self) -> Result<Vec<String>, AutomationError> {
        Ok(self
            .warning_rows()
            .await?
            .into_iter()
            .map(|row| row.row_id)
            .collect())
    }

    async fn row_in(
        &self,
        container: &str,
        row_id: &str,
    ) -> Result<Option<Element>, AutomationError> {
        let selector = format!(
            "{container} [role=\"row\"]{}",
            attr_selector(ROW_ID_ATTR, row_id)
        );
        Ok(self
            .engine
            .query_selector_all(&selector)
            .await?
            .into_iter()
            .next())
    }

    /// Re-locates a row by id: pinned representation first, else center.
    pub async fn resolve_row_element(
        &self,
        row_id: &str,
    ) -> Result<Option<Element>, AutomationError> {
        if let Some(row) = self.row_in(PINNED_CONTAINER, row_id).await? {
            return Ok(Some(row));
        }
        self.row_in(CENTER_CONTAINER, row_id).await
    }

    /// The representation that opens the sidebar when clicked: the center
    /// row when one exists, else the row itself.
    pub async fn click_target(&self, row: &Element) -> Result<Element, AutomationError> {
        if let Some(row_id) = row.attribute(ROW_ID_ATTR).await? {
            if let Some(center) = self.row_in(CENTER_CONTAINER, &row_id).await? {
                return Ok(center);
            }
        }
        Ok(row.clone())
    }
}
