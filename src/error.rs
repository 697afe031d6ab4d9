//! Crate-wide error handling.
//!
//! Follows the two-tier shape the rest of this codebase expects: a single
//! top-level [`ScheduleError`] that aggregates per-subsystem sources, each
//! its own `thiserror` enum. "Cannot run" outcomes are *not* errors — see
//! [`crate::fit::RunOutcome`] — `ScheduleError` is reserved for conditions
//! that abort a cycle outright (§7: loss of server connection, config/IO
//! failure at startup).

use thiserror::Error;

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("server connector error")]
    Connector(#[from] ConnectorError),

    #[error("calendar error")]
    Calendar(#[from] CalendarError),

    #[error("fit evaluator error")]
    Fit(#[from] FitError),
}

/// Errors from resource-definition loading and indirect-resource
/// resolution that are internal inconsistencies rather than expected
/// "cannot run" outcomes (§4.H, §9). `RunOutcome::CannotRun` stays the
/// channel for every per-job verdict; this enum is reserved for snapshot
/// data that is outright malformed.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("resource definition error: {0}")]
    ResourceDef(String),

    #[error("snapshot ingestion failed: {0}")]
    Snapshot(String),

    #[error("indirect resource resolution exceeded {limit} hops for {resource} on {node}")]
    IndirectCycle {
        resource: String,
        node: String,
        limit: u32,
    },

    #[error("internal scheduler invariant violated: {0}")]
    Internal(String),
}

/// Errors raised while loading `sched_config`, holidays, or the fairshare
/// tree definition (§6.2).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config line {line_no} in {path}: {line}")]
    MalformedLine {
        path: String,
        line_no: usize,
        line: String,
    },

    #[error("$include depth exceeded {max} while resolving {path}")]
    IncludeDepthExceeded { path: String, max: u32 },

    #[error("unknown config key {0}")]
    UnknownKey(String),

    #[error("invalid value for key {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors raised by the external server protocol (§6.1). The transport
/// itself is out of scope; this enum only models the contract a connector
/// must honor.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("lost connection to server")]
    ConnectionLost,

    #[error("server rejected query: {0}")]
    QueryRejected(String),

    #[error("commit {action} for {target} failed: {reason}")]
    CommitFailed {
        action: &'static str,
        target: String,
        reason: String,
    },

    #[error("malformed batch_status attribute on {entity}: {attr}")]
    MalformedAttribute { entity: String, attr: String },
}

/// Errors from calendar construction/simulation (§4.I).
#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("event list is not time-ordered at index {index}")]
    OutOfOrder { index: usize },

    #[error("referenced resresv {0} not found in universe")]
    DanglingReference(String),

    #[error("simulation exceeded horizon without converging")]
    HorizonExceeded,
}
