//! Error types for Convoflow.
//!
//! All errors in Convoflow are represented by the `ConvoflowError` enum.
//! Variants are narrow on purpose: callers match on them to decide whether to
//! relaunch a flow, report a definition problem, or surface an environment fault.

use std::{io::ErrorKind, string::FromUtf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a snapshot that could not be turned back into execution data.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnmarshalKind {
    /// The stored bytes are truncated, corrupt, or fail to decompress.
    Io,
    /// The bytes decode, but their structure does not match the deployed
    /// execution types (written by an incompatible build).
    Incompatible,
}

/// Unified error type for all Convoflow operations.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum ConvoflowError {
    /// Configuration parsing or validation errors.
    #[error("{0}")]
    Config(String),

    /// An operation was invoked in a state that does not allow it.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// An argument failed validation.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Malformed flow definition.
    #[error("{0}")]
    Definition(String),

    /// The definition locator has no flow with this id.
    #[error("no flow definition '{flow_id}' found")]
    NoSuchFlowDefinition { flow_id: String },

    /// The flow has no state with this id.
    #[error("no state '{state_id}' in flow '{flow_id}'")]
    NoSuchState { flow_id: String, state_id: String },

    /// No transition of the current state (or the flow's global transitions)
    /// matched the signaled event.
    #[error("no transition found on occurrence of event '{event_id}' in state '{state_id}' of flow '{flow_id}'")]
    NoMatchingTransition {
        flow_id: String,
        state_id: String,
        event_id: String,
    },

    /// A listener vetoed entry into a state.
    #[error("entering state '{target_state_id}' of flow '{flow_id}' was vetoed: {reason}")]
    EnterStateVetoed {
        flow_id: String,
        source_state_id: Option<String>,
        target_state_id: String,
        reason: String,
    },

    /// A flow execution key string did not match the key format.
    #[error("badly formatted flow execution key '{key}', the expected format is '{format}'")]
    BadlyFormattedKey { key: String, format: String },

    /// The conversation or snapshot addressed by the key no longer exists.
    #[error("no flow execution could be found with key '{key}': {reason}")]
    NoSuchFlowExecution { key: String, reason: String },

    /// The snapshot exists but could not be restored into a live execution.
    #[error("a problem occurred restoring the flow execution with key '{key}': {source}")]
    FlowExecutionRestorationFailure { key: String, source: Box<ConvoflowError> },

    /// The conversation manager has no conversation with this id.
    #[error("no conversation could be found with id '{conversation_id}'")]
    NoSuchConversation { conversation_id: String },

    /// A snapshot could not be taken.
    #[error("could not create flow execution snapshot: {reason}")]
    SnapshotCreation { reason: String },

    /// A stored snapshot could not be unmarshalled.
    #[error("could not unmarshal flow execution snapshot ({kind}): {reason}")]
    SnapshotUnmarshal { kind: UnmarshalKind, reason: String },

    /// The conversation lock could not be acquired in time.
    #[error("unable to acquire lock for conversation '{conversation_id}' within {timeout_ms}ms")]
    LockTimeout { conversation_id: String, timeout_ms: u64 },

    /// An error raised while the engine processed a request in a flow state.
    #[error("exception thrown in state '{}' of flow '{flow_id}': {source}", .state_id.as_deref().unwrap_or("<none>"))]
    FlowExecution {
        flow_id: String,
        state_id: Option<String>,
        source: Box<ConvoflowError>,
    },

    /// Action execution errors.
    #[error("{0}")]
    Action(String),

    /// Expression parsing or evaluation errors.
    #[error("{0}")]
    Expression(String),

    /// Attribute access or conversion errors.
    #[error("{0}")]
    Attribute(String),

    /// Data conversion errors (JSON, TOML, etc.).
    #[error("{0}")]
    Convert(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),
}

impl ConvoflowError {
    /// Returns the innermost error, looking through execution and restoration wrappers.
    pub fn root_cause(&self) -> &ConvoflowError {
        match self {
            ConvoflowError::FlowExecution {
                source, ..
            }
            | ConvoflowError::FlowExecutionRestorationFailure {
                source, ..
            } => source.root_cause(),
            other => other,
        }
    }

    /// Whether this error already identifies the flow and state it happened in.
    pub(crate) fn carries_flow_context(&self) -> bool {
        matches!(
            self,
            ConvoflowError::FlowExecution { .. }
                | ConvoflowError::NoMatchingTransition { .. }
                | ConvoflowError::EnterStateVetoed { .. }
                | ConvoflowError::NoSuchState { .. }
        )
    }
}

impl From<ConvoflowError> for String {
    fn from(val: ConvoflowError) -> Self {
        val.to_string()
    }
}

impl From<std::io::Error> for ConvoflowError {
    fn from(error: std::io::Error) -> Self {
        ConvoflowError::IoError(error.to_string())
    }
}

impl From<ConvoflowError> for std::io::Error {
    fn from(val: ConvoflowError) -> Self {
        #[allow(clippy::io_other_error)]
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<FromUtf8Error> for ConvoflowError {
    fn from(_: FromUtf8Error) -> Self {
        ConvoflowError::Convert("Error with utf-8 string convert".to_string())
    }
}

impl From<serde_json::Error> for ConvoflowError {
    fn from(error: serde_json::Error) -> Self {
        ConvoflowError::Convert(error.to_string())
    }
}
