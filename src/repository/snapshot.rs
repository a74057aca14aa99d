//! Snapshots of paused flow executions.
//!
//! Restoring is two phase: the stored bytes are decoded into
//! [`FlowExecutionData`], which carries only flow and state ids, and the
//! [`FlowExecutionFactory`] then looks every definition up again.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use tracing::trace;

use crate::{
    AttributeMap, ConvoflowError, FlowExecution, FlowExecutionFactory, FlowExecutionKey, FlowSessionStatus, Result, UnmarshalKind,
};

/// Serializable form of one session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowSessionData {
    pub flow_id: String,
    pub state_id: Option<String>,
    pub status: FlowSessionStatus,
    pub scope: AttributeMap,
    pub view_scope: Option<AttributeMap>,
}

/// Serializable form of an execution. Conversation scope is not part of it;
/// it lives with the conversation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowExecutionData {
    pub flow_id: String,
    pub sessions: Vec<FlowSessionData>,
    pub flash_scope: AttributeMap,
    /// The execution paused with a redirect, so flash scope has not been rendered yet.
    #[serde(default)]
    pub redirect_pending: bool,
}

impl FlowExecutionData {
    /// Captures `execution`, rejecting live objects in any persisted scope.
    pub fn capture(execution: &FlowExecution) -> Result<Self> {
        check_serializable(execution.flash_scope(), "flash", execution.definition().id())?;
        let mut sessions = Vec::with_capacity(execution.sessions().len());
        for session in execution.sessions() {
            check_serializable(session.scope(), "flow", session.flow_id())?;
            let view_scope = session.view_scope().ok().cloned();
            if let Some(view) = &view_scope {
                check_serializable(view, "view", session.flow_id())?;
            }
            sessions.push(FlowSessionData {
                flow_id: session.flow_id().to_string(),
                state_id: session.state_id().map(str::to_string),
                status: session.status(),
                scope: session.scope().clone(),
                view_scope,
            });
        }
        Ok(Self {
            flow_id: execution.definition().id().to_string(),
            sessions,
            flash_scope: execution.flash_scope().clone(),
            redirect_pending: execution.redirect_requested(),
        })
    }
}

pub(crate) fn check_serializable(
    scope: &AttributeMap,
    scope_name: &str,
    flow_id: &str,
) -> Result<()> {
    match scope.first_non_serializable() {
        None => Ok(()),
        Some((key, type_name)) => Err(ConvoflowError::SnapshotCreation {
            reason: format!(
                "attribute '{}' in {} scope of flow '{}' holds a non-serializable object of type '{}'; \
                 this is a programming error in application code: only serializable data may be stored in persisted scopes",
                key, scope_name, flow_id, type_name
            ),
        }),
    }
}

fn frame_length(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| ConvoflowError::SnapshotCreation {
        reason: format!("snapshot payload of {} bytes does not fit a frame length header", len),
    })
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// A snapshot as stored: JSON bytes, optionally gzip compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedFlowExecutionSnapshot {
    data: Vec<u8>,
    compressed: bool,
}

impl SerializedFlowExecutionSnapshot {
    pub fn new(
        data: &FlowExecutionData,
        compress: bool,
    ) -> Result<Self> {
        let json = serde_json::to_vec(data).map_err(|e| ConvoflowError::SnapshotCreation {
            reason: e.to_string(),
        })?;
        let data = if compress {
            gzip(&json).map_err(|e| ConvoflowError::SnapshotCreation {
                reason: format!("could not compress snapshot: {}", e),
            })?
        } else {
            json
        };
        Ok(Self {
            data,
            compressed: compress,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Stored payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn unmarshal(&self) -> Result<FlowExecutionData> {
        let json = if self.compressed {
            let mut json = Vec::new();
            GzDecoder::new(self.data.as_slice()).read_to_end(&mut json).map_err(|e| ConvoflowError::SnapshotUnmarshal {
                kind: UnmarshalKind::Io,
                reason: format!("could not decompress snapshot: {}", e),
            })?;
            json
        } else {
            self.data.clone()
        };
        serde_json::from_slice(&json).map_err(|e| {
            let kind = match e.classify() {
                Category::Data => UnmarshalKind::Incompatible,
                Category::Io | Category::Syntax | Category::Eof => UnmarshalKind::Io,
            };
            let reason = match kind {
                UnmarshalKind::Incompatible => format!("{}; the snapshot was probably written by an incompatible version of the flow execution types", e),
                UnmarshalKind::Io => e.to_string(),
            };
            ConvoflowError::SnapshotUnmarshal {
                kind,
                reason,
            }
        })
    }

    /// Framed form: big-endian `i32` payload length, payload, one flag byte.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let length = frame_length(self.data.len())?;
        let mut bytes = Vec::with_capacity(self.data.len() + 5);
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes.push(u8::from(self.compressed));
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| ConvoflowError::SnapshotUnmarshal {
            kind: UnmarshalKind::Io,
            reason: reason.to_string(),
        };
        let (header, rest) = bytes.split_first_chunk::<4>().ok_or_else(|| corrupt("snapshot frame is shorter than its length header"))?;
        let length = i32::from_be_bytes(*header);
        let length = usize::try_from(length).map_err(|_| corrupt("snapshot frame has a negative length"))?;
        if rest.len() != length + 1 {
            return Err(corrupt(&format!("snapshot frame declares {} payload bytes but holds {}", length, rest.len().saturating_sub(1))));
        }
        let compressed = match rest[length] {
            0 => false,
            1 => true,
            other => return Err(corrupt(&format!("invalid compression flag {}", other))),
        };
        Ok(Self {
            data: rest[..length].to_vec(),
            compressed,
        })
    }
}

/// Takes snapshots of executions and restores executions from them.
pub trait FlowExecutionSnapshotFactory: Send + Sync {
    fn create_snapshot(
        &self,
        execution: &FlowExecution,
    ) -> Result<SerializedFlowExecutionSnapshot>;

    fn restore_execution(
        &self,
        snapshot: &SerializedFlowExecutionSnapshot,
        key: FlowExecutionKey,
        conversation_scope: AttributeMap,
    ) -> Result<FlowExecution>;
}

pub struct SerializedFlowExecutionSnapshotFactory {
    execution_factory: Arc<FlowExecutionFactory>,
    compress: bool,
}

impl SerializedFlowExecutionSnapshotFactory {
    pub fn new(
        execution_factory: Arc<FlowExecutionFactory>,
        compress: bool,
    ) -> Self {
        Self {
            execution_factory,
            compress,
        }
    }
}

impl FlowExecutionSnapshotFactory for SerializedFlowExecutionSnapshotFactory {
    fn create_snapshot(
        &self,
        execution: &FlowExecution,
    ) -> Result<SerializedFlowExecutionSnapshot> {
        let snapshot = SerializedFlowExecutionSnapshot::new(&FlowExecutionData::capture(execution)?, self.compress)?;
        trace!("created snapshot of flow '{}' ({} bytes, compressed: {})", execution.definition().id(), snapshot.len(), snapshot.compressed);
        Ok(snapshot)
    }

    fn restore_execution(
        &self,
        snapshot: &SerializedFlowExecutionSnapshot,
        key: FlowExecutionKey,
        conversation_scope: AttributeMap,
    ) -> Result<FlowExecution> {
        let data = snapshot.unmarshal()?;
        self.execution_factory.restore_flow_execution(data, key, conversation_scope)
    }
}
