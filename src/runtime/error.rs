//! Error types for the action runtime
//!
//! Each layer gets its own thiserror enum. Callers of the site API only ever
//! see [`ActionError`]; the others surface inside it or at load time.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::context::ContextId;
use crate::interpreter::PlanError;

/// Error returned to callers of site actions
#[derive(Debug, Error)]
pub enum ActionError {
    /// The named plan does not exist or has no steps; no context was created
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    /// A step failed
    #[error("{0}")]
    Failed(Arc<FailureReport>),

    /// The context was reaped by the timeout sweep
    #[error("Action '{0}' timed out")]
    TimedOut(String),

    /// The context went away without reaching a terminal state
    #[error("Action '{0}' was dropped before finishing")]
    Dropped(String),

    /// Configuration problem discovered while preparing the call
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration and load-time errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration text is not valid JSON
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A site entry has the wrong shape
    #[error("Site '{site}' is invalid: {reason}")]
    InvalidSite {
        /// Site name
        site: String,
        /// What is wrong with it
        reason: String,
    },

    /// A plan failed validation
    #[error("Site '{site}', action '{action}': {source}")]
    Plan {
        /// Site name
        site: String,
        /// Action name
        action: String,
        /// Validation failure
        #[source]
        source: PlanError,
    },

    /// Address could not be parsed
    #[error("Invalid address '{address}': {source}")]
    InvalidAddress {
        /// Offending address
        address: String,
        /// Parser error
        #[source]
        source: url::ParseError,
    },

    /// No catalog entry matched
    #[error("No site configuration for '{0}'")]
    UnknownSite(String),
}

/// Reason a single step failed
#[derive(Debug, Error)]
pub enum StepError {
    /// A path did not resolve
    #[error("Key '{0}' not found")]
    KeyMissing(String),

    /// `rx` did not match the value at `path`
    #[error("Pattern did not match value at '{0}'")]
    RegexMismatch(String),

    /// Value at the path is not a list
    #[error("Value at '{0}' is not a list")]
    NotAList(String),

    /// A `${}` placeholder did not resolve
    #[error("Template key '{0}' not found")]
    TemplateKey(String),

    /// `J: ` literal is not valid JSON
    #[error("Invalid JSON literal: {0}")]
    BadJsonLiteral(String),

    /// Comparison did not hold
    #[error("Match failed: '{left}' vs '{right}'")]
    MatchMismatch {
        /// Resolved left operand
        left: String,
        /// Right operand
        right: String,
    },

    /// Iteration step reached at index 0 with state already open
    #[error("Array '{0}' re-entered at index 0")]
    ArrayReentry(String),

    /// `yield`/`continue`/`return-array` without an open iteration
    #[error("No open iteration for '{0}'")]
    NoIteration(String),

    /// `append` source is undefined
    #[error("Append source '{0}' is undefined")]
    AppendSource(String),

    /// `append to` target is missing or not a list
    #[error("Append target '{0}' is not a list")]
    AppendTarget(String),

    /// Request URL could not be built
    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Response body could not be decoded
    #[error("Response decode failed: {0}")]
    Decode(String),

    /// Delegated sub-action failed
    #[error("Sub-action '{action}' failed: {reason}")]
    SubAction {
        /// Sub-action name
        action: String,
        /// Failure description
        reason: String,
    },

    /// A control instance tried to delegate to itself
    #[error("Sub-action '{0}' cannot be delegated from the control instance")]
    SelfDelegation(String),

    /// The interactive page was closed without a usable result
    #[error("Interactive page dismissed")]
    PageDismissed,
}

/// HTTP transport errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Non-success status
    #[error("HTTP {status} from {url}")]
    Status {
        /// Request URL
        url: String,
        /// Status code
        status: u16,
    },

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Per-request timeout elapsed
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// URL rejected by the transport
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Diagnostic record of a failed execution
#[derive(Debug)]
pub struct FailureReport {
    /// Action name
    pub action: String,
    /// Context that failed
    pub context: ContextId,
    /// Index of the failed step
    pub step_index: usize,
    /// Declared form of the failed step
    pub step: Value,
    /// Stash as it was just before the failure
    pub stash: Value,
    /// Why the step failed
    pub reason: StepError,
    /// When the failure was recorded
    pub failed_at: DateTime<Utc>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Action '{}' failed at step {} ({}): {}",
            self.action, self.step_index, self.step, self.reason
        )
    }
}

/// Result alias for site calls
pub type ActionResult<T> = std::result::Result<T, ActionError>;

/// Result alias for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for step evaluation
pub type StepResult<T> = std::result::Result<T, StepError>;

/// Result alias for transport calls
pub type TransportResult<T> = std::result::Result<T, TransportError>;
