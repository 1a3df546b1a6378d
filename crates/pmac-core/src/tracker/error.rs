//! The error taxonomy every adapter normalizes into.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::TrackerKind;

/// Failure of one tracker operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("{tracker}: authentication failed: {message}")]
    Auth {
        tracker: TrackerKind,
        message: String,
    },

    #[error("{tracker}: rate limited until {resume_at}")]
    RateLimited {
        tracker: TrackerKind,
        resume_at: DateTime<Utc>,
    },

    #[error("{tracker}: API error{}: {message}", status_suffix(.status))]
    Api {
        tracker: TrackerKind,
        status: Option<u16>,
        message: String,
        /// Worth retrying (timeouts, 5xx, connection resets).
        transient: bool,
    },

    #[error("{tracker}: not found: {what}")]
    NotFound { tracker: TrackerKind, what: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Coarse classification used by the retry policy and the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    RateLimited,
    Transient,
    Permanent,
    NotFound,
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::Auth { .. } => ErrorKind::Auth,
            TrackerError::RateLimited { .. } => ErrorKind::RateLimited,
            TrackerError::Api {
                transient: true, ..
            } => ErrorKind::Transient,
            TrackerError::Api { .. } => ErrorKind::Permanent,
            TrackerError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub fn tracker(&self) -> TrackerKind {
        match self {
            TrackerError::Auth { tracker, .. }
            | TrackerError::RateLimited { tracker, .. }
            | TrackerError::Api { tracker, .. }
            | TrackerError::NotFound { tracker, .. } => *tracker,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TrackerError::NotFound { .. })
    }

    pub fn permanent(tracker: TrackerKind, message: impl Into<String>) -> Self {
        TrackerError::Api {
            tracker,
            status: None,
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(tracker: TrackerKind, message: impl Into<String>) -> Self {
        TrackerError::Api {
            tracker,
            status: None,
            message: message.into(),
            transient: true,
        }
    }

    pub fn not_found(tracker: TrackerKind, what: impl Into<String>) -> Self {
        TrackerError::NotFound {
            tracker,
            what: what.into(),
        }
    }
}
