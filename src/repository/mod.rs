//! Persistence of paused flow executions.
//!
//! Executions are stored as serialized snapshots grouped per conversation and
//! addressed by a [`FlowExecutionKey`]. Every mutation of a conversation's
//! snapshots happens while its reentrant [`ConversationLock`] is held.

mod conversation;
mod group;
mod key;
mod lock;
#[allow(clippy::module_inception)]
mod repository;
pub(crate) mod snapshot;

pub use conversation::{Conversation, ConversationIdStrategy, ConversationManager, ConversationParameters, InMemoryConversation, InMemoryConversationManager};
pub use group::SnapshotGroup;
pub use key::{FlowExecutionKey, KEY_FORMAT};
pub use lock::{ConversationLock, DEFAULT_LOCK_TIMEOUT, FlowExecutionLock, LockGuard};
pub use repository::{CONVERSATION_SCOPE_ATTRIBUTE, ConversationBackedLock, DefaultFlowExecutionRepository, FlowExecutionRepository, SNAPSHOT_GROUP_ATTRIBUTE};
pub use snapshot::{FlowExecutionData, FlowExecutionSnapshotFactory, FlowSessionData, SerializedFlowExecutionSnapshot, SerializedFlowExecutionSnapshotFactory};
