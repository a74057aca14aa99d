use chrono::{DateTime, Utc};

use crate::{AttributeMap, ConvoflowError, Result};

pub const SUCCESS: &str = "success";
pub const ERROR: &str = "error";
pub const YES: &str = "yes";
pub const NO: &str = "no";

/// Signals that something happened; immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: String,
    timestamp: DateTime<Utc>,
    source: String,
    attributes: AttributeMap,
}

impl Event {
    /// Creates an event; `id` must not be blank.
    pub fn new(
        id: &str,
        source: &str,
    ) -> Result<Self> {
        if id.trim().is_empty() {
            return Err(ConvoflowError::IllegalArgument("event id must not be blank".to_string()));
        }
        Ok(Self::well_known(id, source))
    }

    fn well_known(
        id: &str,
        source: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn success(source: &str) -> Self {
        Self::well_known(SUCCESS, source)
    }

    pub fn error(source: &str) -> Self {
        Self::well_known(ERROR, source)
    }

    pub fn yes(source: &str) -> Self {
        Self::well_known(YES, source)
    }

    pub fn no(source: &str) -> Self {
        Self::well_known(NO, source)
    }

    pub fn with_attributes(
        mut self,
        attributes: AttributeMap,
    ) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Description of whatever produced the event.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }
}
