use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Save was not confirmed: {0}")]
    SaveUnconfirmed(String),

    #[error("Automation already running.")]
    AlreadyRunning,

    #[error("Element is detached from DOM: {0}")]
    ElementDetached(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Platform-specific error: {0}")]
    PlatformError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
