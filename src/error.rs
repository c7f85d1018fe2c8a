// SPDX-License-Identifier: GPL-3.0-only
//! Error types for the reconciliation loop
//!
//! Every kind here is local to one output's reconciliation attempt. None of
//! them escape the [`Reconciler`](crate::reconciler::Reconciler).

use std::time::Duration;

use thiserror::Error;

/// Failure kinds for a single output's query, parse, select or apply step
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The query tool did not finish within the bound and was killed
    #[error("query tool did not finish within {}ms", .0.as_millis())]
    QueryTimeout(Duration),

    /// The query tool finished but printed nothing
    #[error("query tool returned no output")]
    QueryEmpty,

    /// The output's "connected" header is absent from the query text
    #[error("no connected header for output {0}")]
    HeaderNotFound(String),

    /// The header was found but no valid mode line followed it
    #[error("no modes parsed for output {0}")]
    NoModesParsed(String),

    /// Neither selection tier produced a mode
    #[error("no candidate mode under the current policy")]
    SelectorNoCandidate,

    /// The apply tool exited non-zero (`None` when killed by a signal)
    #[error("apply tool failed with exit code {code:?}")]
    ApplyFailed { code: Option<i32> },

    /// The apply tool did not finish within the bound and was killed
    #[error("apply tool did not finish within {}ms", .0.as_millis())]
    ApplyTimeout(Duration),

    /// The external tool could not be started at all
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while starting the service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Another instance already holds the single-instance lock
    #[error("another instance is already running (lock held on {})", .0.display())]
    AlreadyRunning(std::path::PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ReconcileError
pub type Result<T> = std::result::Result<T, ReconcileError>;
