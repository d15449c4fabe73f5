//! Messages exchanged with the extension's relay layer.

use crate::automation::{ProgressState, RunResult};
use crate::config::{
    DEFAULT_BREAK_DURATION_MINUTES, DEFAULT_BREAK_START, DEFAULT_RANDOMIZE_MINUTES,
};
use crate::schedule::{ShiftSettings, TimeValue};
use crate::AutomationError;
use serde::{Deserialize, Serialize};

pub use crate::schedule::is_valid_time;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    RunAutomation(RunRequest),
    CancelAutomation(CancelRequest),
    AutomationProgress(ProgressMessage),
    AutomationResult(ResultMessage),
}

impl RelayMessage {
    pub fn request_id(&self) -> &str {
        match self {
            RelayMessage::RunAutomation(m) => &m.request_id,
            RelayMessage::CancelAutomation(m) => &m.request_id,
            RelayMessage::AutomationProgress(m) => &m.request_id,
            RelayMessage::AutomationResult(m) => &m.request_id,
        }
    }
}

/// Run parameters as the popup sends them. Times are strings until
/// [`RunPayload::into_shift_settings`] validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub clock_in: String,
    pub clock_out: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomize_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomize_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_duration_minutes: Option<u32>,
}

impl RunPayload {
    /// Missing optional fields take the stored-settings defaults.
    pub fn into_shift_settings(self) -> Result<ShiftSettings, AutomationError> {
        if !is_valid_time(&self.clock_in) || !is_valid_time(&self.clock_out) {
            return Err(AutomationError::InvalidArgument(
                "Clock in/out must be valid HH:MM times.".to_string(),
            ));
        }
        let clock_in: TimeValue = self.clock_in.parse()?;
        let clock_out: TimeValue = self.clock_out.parse()?;
        let mut settings = ShiftSettings::new(clock_in, clock_out);

        if self.randomize_enabled.unwrap_or(false) {
            settings = settings
                .with_randomize(self.randomize_minutes.unwrap_or(DEFAULT_RANDOMIZE_MINUTES));
        }

        if self.break_enabled.unwrap_or(false) {
            let start = self
                .break_start
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_BREAK_START.to_string());
            if !is_valid_time(&start) {
                return Err(AutomationError::InvalidArgument(format!(
                    "Break start '{start}' must be a valid HH:MM time."
                )));
            }
            settings = settings.with_break(
                start.parse()?,
                self.break_duration_minutes
                    .unwrap_or(DEFAULT_BREAK_DURATION_MINUTES),
            );
        }

        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub request_id: String,
    pub payload: RunPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub request_id: String,
    pub total: usize,
    pub completed: usize,
    #[serde(default)]
    pub saved: usize,
}

impl ProgressMessage {
    pub fn new(request_id: impl Into<String>, state: ProgressState) -> Self {
        Self {
            request_id: request_id.into(),
            total: state.total,
            completed: state.completed,
            saved: state.saved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultMessage {
    /// A finished run. A cancelled run is reported as not successful.
    pub fn finished(request_id: impl Into<String>, result: RunResult) -> Self {
        Self {
            request_id: request_id.into(),
            success: !result.cancelled,
            processed: Some(result.processed_count),
            cancelled: Some(result.cancelled),
            error: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            processed: None,
            cancelled: None,
            error: Some(error.to_string()),
        }
    }

    /// Reply to a cancel request that reached an active run.
    pub fn cancel_accepted(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            processed: None,
            cancelled: Some(true),
            error: None,
        }
    }
}

impl From<ProgressMessage> for RelayMessage {
    fn from(message: ProgressMessage) -> Self {
        RelayMessage::AutomationProgress(message)
    }
}

impl From<ResultMessage> for RelayMessage {
    fn from(message: ResultMessage) -> Self {
        RelayMessage::AutomationResult(message)
    }
}
