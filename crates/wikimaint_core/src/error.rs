use std::time::Duration;

use thiserror::Error;

use crate::cursor::Window;
use crate::row::Key;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("batch size must be greater than zero (got {0})")]
    InvalidBatchSize(i64),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: impl ToString, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection drop, lock contention, read timeout. Worth retrying.
    #[error("transient read failure: {0}")]
    Transient(String),

    #[error("read failed: {0}")]
    Fatal(String),

    #[error("read failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {key}: {message}")]
pub struct RowApplyError {
    pub key: Key,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor cannot move backwards from {from} to {to}")]
    Regressed { from: Key, to: Key },

    #[error("cursor cannot skip from {from} to {to}; the current window ends at {limit}")]
    Skipped { from: Key, to: Key, limit: Key },
}

/// Conditions that end a run early. Every variant except `Configuration`
/// carries the cursor an operator should pass to `--start` to resume.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("fetch of window {window} failed: {source}")]
    FatalFetch {
        window: Window,
        cursor: Key,
        #[source]
        source: FetchError,
    },

    #[error("replicas did not catch up within {timeout:?} ({detail})")]
    ReplicationTimeout {
        cursor: Key,
        timeout: Duration,
        detail: String,
    },

    #[error("aborting on first row error: {source}")]
    FailFast {
        cursor: Key,
        #[source]
        source: RowApplyError,
    },

    #[error("interrupted by operator")]
    Interrupted { cursor: Key },

    #[error("write sink failed in window {window}: {message}")]
    Sink {
        window: Window,
        cursor: Key,
        message: String,
    },

    #[error("checkpoint failed: {message}")]
    Checkpoint { cursor: Key, message: String },

    #[error("cursor error: {source}")]
    Cursor {
        cursor: Key,
        #[source]
        source: CursorError,
    },
}

impl RunError {
    pub fn cursor(&self) -> Option<Key> {
        match self {
            Self::Configuration(_) => None,
            Self::FatalFetch { cursor, .. }
            | Self::ReplicationTimeout { cursor, .. }
            | Self::FailFast { cursor, .. }
            | Self::Interrupted { cursor }
            | Self::Sink { cursor, .. }
            | Self::Checkpoint { cursor, .. }
            | Self::Cursor { cursor, .. } => Some(*cursor),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::FatalFetch { .. } => "fatal_fetch",
            Self::ReplicationTimeout { .. } => "replication_timeout",
            Self::FailFast { .. } => "fail_fast",
            Self::Interrupted { .. } => "interrupted",
            Self::Sink { .. } => "sink",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Cursor { .. } => "cursor",
        }
    }
}
