use thiserror::Error;

/// Failures that cross a component boundary.
///
/// Per-item and per-selector faults are converted to boolean/`None`
/// sentinels at the lowest layer and never reach callers as errors; the
/// variants here are the ones that either require tearing down the current
/// browser or surface to the HTTP layer as a failed operation.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("browser launch failed: {detail}")]
    Launch { detail: String },

    #[error("navigation to {url} failed: {detail}")]
    Navigation { url: String, detail: String },

    #[error("no {role} field matched for provider {provider}")]
    FieldNotFound { role: &'static str, provider: String },

    #[error("credential submit failed for provider {provider}")]
    Submit { provider: String },

    #[error("extraction fault: {detail}")]
    Extraction { detail: String },

    #[error("{what} abandoned after {secs}s; browser state is undefined")]
    Timeout { what: &'static str, secs: u64 },

    #[error("no active session")]
    NoSession,

    #[error("session is busy with another operation")]
    Busy,
}

pub type Result<T> = std::result::Result<T, AutomationError>;
