use std::{
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AttributeMap, AttributeValue, ConversationLock, ConvoflowError, MemCache, Result, utils};

/// Descriptive information recorded when a conversation begins.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationParameters {
    pub name: String,
    pub caption: String,
    pub description: String,
}

impl ConversationParameters {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// A lockable container of technical attributes, independent of serialization.
pub trait Conversation: Send + Sync {
    fn id(&self) -> &str;

    fn parameters(&self) -> &ConversationParameters;

    /// Blocks until this thread holds the conversation; reentrant.
    fn lock(&self) -> Result<()>;

    fn unlock(&self);

    fn attribute(
        &self,
        name: &str,
    ) -> Option<AttributeValue>;

    fn put_attribute(
        &self,
        name: &str,
        value: AttributeValue,
    ) -> Result<()>;

    fn remove_attribute(
        &self,
        name: &str,
    ) -> Option<AttributeValue>;

    /// Ends the conversation and releases everything it holds.
    fn end(&self);
}

pub trait ConversationManager: Send + Sync {
    fn begin_conversation(
        &self,
        parameters: ConversationParameters,
    ) -> Result<Arc<dyn Conversation>>;

    /// Fails with `NoSuchConversation` when the id is unknown or expired.
    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Arc<dyn Conversation>>;

    /// Validates the textual form of a conversation id.
    fn parse_conversation_id(
        &self,
        encoded: &str,
    ) -> Result<String>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationIdStrategy {
    /// Random 32 character hex ids.
    #[default]
    Uuid,
    /// Increasing integers, starting at 1.
    Sequential,
}

type ConversationCache = MemCache<String, Arc<InMemoryConversation>>;

pub struct InMemoryConversation {
    id: String,
    parameters: ConversationParameters,
    created_at: i64,
    lock: ConversationLock,
    attributes: Mutex<AttributeMap>,
    container: Weak<ConversationCache>,
}

impl InMemoryConversation {
    /// Creation time in epoch milliseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }
}

impl Conversation for InMemoryConversation {
    fn id(&self) -> &str {
        &self.id
    }

    fn parameters(&self) -> &ConversationParameters {
        &self.parameters
    }

    fn lock(&self) -> Result<()> {
        self.lock.lock()
    }

    fn unlock(&self) {
        self.lock.unlock()
    }

    fn attribute(
        &self,
        name: &str,
    ) -> Option<AttributeValue> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn put_attribute(
        &self,
        name: &str,
        value: AttributeValue,
    ) -> Result<()> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner).put_value(name, value)?;
        Ok(())
    }

    fn remove_attribute(
        &self,
        name: &str,
    ) -> Option<AttributeValue> {
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    fn end(&self) {
        debug!("ending conversation '{}'", self.id);
        if let Some(container) = self.container.upgrade() {
            container.remove(&self.id);
        }
        self.attributes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Keeps conversations in memory, bounded by count with optional idle expiry.
pub struct InMemoryConversationManager {
    conversations: Arc<ConversationCache>,
    id_strategy: ConversationIdStrategy,
    sequence: AtomicU64,
    lock_timeout: Duration,
}

impl InMemoryConversationManager {
    pub fn new(
        max_conversations: u64,
        idle_timeout: Option<Duration>,
        lock_timeout: Duration,
        id_strategy: ConversationIdStrategy,
    ) -> Self {
        Self {
            conversations: Arc::new(MemCache::new(max_conversations, idle_timeout)),
            id_strategy,
            sequence: AtomicU64::new(0),
            lock_timeout,
        }
    }

    fn next_id(&self) -> String {
        match self.id_strategy {
            ConversationIdStrategy::Uuid => utils::id::longid(),
            ConversationIdStrategy::Sequential => (self.sequence.fetch_add(1, Ordering::SeqCst) + 1).to_string(),
        }
    }

    /// Number of live conversations, after pending evictions are applied.
    pub fn conversation_count(&self) -> u64 {
        self.conversations.sync();
        self.conversations.len()
    }
}

impl ConversationManager for InMemoryConversationManager {
    fn begin_conversation(
        &self,
        parameters: ConversationParameters,
    ) -> Result<Arc<dyn Conversation>> {
        let id = self.next_id();
        let conversation = Arc::new(InMemoryConversation {
            lock: ConversationLock::new(&id, self.lock_timeout),
            id: id.clone(),
            parameters,
            created_at: utils::time::time_millis(),
            attributes: Mutex::new(AttributeMap::new()),
            container: Arc::downgrade(&self.conversations),
        });
        self.conversations.set(id.clone(), conversation.clone());
        debug!("began conversation '{}' for '{}'", id, conversation.parameters.name);
        Ok(conversation)
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Arc<dyn Conversation>> {
        match self.conversations.get(&conversation_id.to_string()) {
            Some(conversation) => Ok(conversation),
            None => Err(ConvoflowError::NoSuchConversation {
                conversation_id: conversation_id.to_string(),
            }),
        }
    }

    fn parse_conversation_id(
        &self,
        encoded: &str,
    ) -> Result<String> {
        let valid = match self.id_strategy {
            ConversationIdStrategy::Uuid => uuid::Uuid::try_parse(encoded).is_ok(),
            ConversationIdStrategy::Sequential => encoded.parse::<u64>().is_ok(),
        };
        if valid {
            Ok(encoded.to_string())
        } else {
            Err(ConvoflowError::IllegalArgument(format!("'{}' is not a valid {} conversation id", encoded, self.id_strategy.as_ref())))
        }
    }
}
