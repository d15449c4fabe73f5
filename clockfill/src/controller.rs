use crate::automation::{AutomationSession, ProgressSink, ProgressState, Timings};
use crate::messages::{CancelRequest, ProgressMessage, RelayMessage, ResultMessage, RunRequest};
use crate::platforms::PageEngine;
use crate::AutomationError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The run currently holding the page
#[derive(Clone, Debug)]
pub struct ActiveRun {
    pub request_id: String,
    pub cancellation_token: CancellationToken,
}

type Slot = Arc<Mutex<Option<ActiveRun>>>;

/// Clears the active slot on every exit path of a run.
struct ActiveGuard {
    slot: Slot,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Forwards session progress to the relay, tagged with the request id.
pub struct RelayProgress {
    request_id: String,
    outgoing: mpsc::UnboundedSender<RelayMessage>,
}

impl RelayProgress {
    pub fn new(request_id: impl Into<String>, outgoing: mpsc::UnboundedSender<RelayMessage>) -> Self {
        Self {
            request_id: request_id.into(),
            outgoing,
        }
    }
}

impl ProgressSink for RelayProgress {
    fn emit(&self, state: ProgressState) {
        let message = ProgressMessage::new(self.request_id.clone(), state);
        if self.outgoing.send(message.into()).is_err() {
            warn!(request_id = %self.request_id, "Progress channel closed");
        }
    }
}

/// Per-page host for automation requests: at most one run at a time, each
/// in a fresh session.
#[derive(Clone)]
pub struct AutomationController {
    engine: Arc<dyn PageEngine>,
    timings: Timings,
    active: Slot,
}

impl AutomationController {
    pub fn new(engine: Arc<dyn PageEngine>) -> Self {
        Self::with_timings(engine, Timings::default())
    }

    pub fn with_timings(engine: Arc<dyn PageEngine>, timings: Timings) -> Self {
        Self {
            engine,
            timings,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn active_request_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|run| run.request_id.clone())
    }

    fn claim(&self, request_id: &str) -> Result<(ActiveGuard, CancellationToken), AutomationError> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(AutomationError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *slot = Some(ActiveRun {
            request_id: request_id.to_string(),
            cancellation_token: token.clone(),
        });
        Ok((
            ActiveGuard {
                slot: self.active.clone(),
            },
            token,
        ))
    }

    /// Runs one automation and reports how it ended.
    pub async fn start(&self, request: RunRequest, sink: &dyn ProgressSink) -> ResultMessage {
        let request_id = request.request_id;
        let settings = match request.payload.into_shift_settings() {
            Ok(settings) => settings,
            Err(e) => return ResultMessage::failed(request_id, e),
        };

        let (_guard, token) = match self.claim(&request_id) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%request_id, "Rejected run request; automation already running");
                return ResultMessage::failed(request_id, e);
            }
        };

        info!(%request_id, "Automation started");
        let mut session =
            AutomationSession::with_timings(self.engine.clone(), settings, self.timings.clone())
                .with_cancellation(token);

        match session.run(sink).await {
            Ok(result) => ResultMessage::finished(request_id, result),
            Err(e) => {
                error!(%request_id, error = %e, "Automation failed");
                ResultMessage::failed(request_id, e)
            }
        }
    }

    /// Requests cooperative cancellation of the active run.
    pub fn cancel(&self, request: &CancelRequest) -> ResultMessage {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(run) => {
                info!(request_id = %run.request_id, "Cancellation requested");
                run.cancellation_token.cancel();
                ResultMessage::cancel_accepted(request.request_id.clone())
            }
            None => ResultMessage::failed(request.request_id.clone(), "No automation running."),
        }
    }

    /// Serves one relay message, streaming progress to `outgoing`. Returns the
    /// reply, if the message expects one.
    pub async fn handle(
        &self,
        message: RelayMessage,
        outgoing: mpsc::UnboundedSender<RelayMessage>,
    ) -> Option<ResultMessage> {
        match message {
            RelayMessage::RunAutomation(request) => {
                let sink = RelayProgress::new(request.request_id.clone(), outgoing);
                Some(self.start(request, &sink).await)
            }
            RelayMessage::CancelAutomation(request) => Some(self.cancel(&request)),
            other => {
                warn!(kind = ?other, "Ignoring message that is not a request");
                None
            }
        }
    }
}
