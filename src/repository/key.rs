use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ConvoflowError, Result};

/// Human readable description of the encoded key layout.
pub const KEY_FORMAT: &str = "e<conversationId>s<snapshotId>";

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^e(.+)s(0|[1-9][0-9]*)$").unwrap());

/// Identity of one persisted snapshot of a conversation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowExecutionKey {
    conversation_id: String,
    snapshot_id: u64,
}

impl FlowExecutionKey {
    pub fn new(
        conversation_id: &str,
        snapshot_id: u64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            snapshot_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }

    /// Parses `e<conversationId>s<snapshotId>`; the last `s` separates the parts.
    pub fn parse(encoded: &str) -> Result<Self> {
        let bad = || ConvoflowError::BadlyFormattedKey {
            key: encoded.to_string(),
            format: KEY_FORMAT.to_string(),
        };
        let captures = KEY_PATTERN.captures(encoded).ok_or_else(bad)?;
        let snapshot_id = captures[2].parse::<u64>().map_err(|_| bad())?;
        Ok(Self::new(&captures[1], snapshot_id))
    }
}

impl fmt::Display for FlowExecutionKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "e{}s{}", self.conversation_id, self.snapshot_id)
    }
}

impl FromStr for FlowExecutionKey {
    type Err = ConvoflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
