use std::sync::Arc;

use serde_json::Value;

use crate::{AttributeMap, ConvoflowError, Expression, RequestContext, Result};

/// Copies one attribute from a source map to a target map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    source: String,
    target: String,
    required: bool,
}

impl Mapping {
    pub fn new(
        source: &str,
        target: &str,
    ) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn map(
        &self,
        source: &AttributeMap,
        target: &mut AttributeMap,
    ) -> Result<()> {
        match source.get(&self.source) {
            Some(value) => {
                target.put_value(&self.target, value.clone())?;
                Ok(())
            }
            None if self.required => Err(ConvoflowError::Attribute(format!("required mapping source '{}' is not present", self.source))),
            None => Ok(()),
        }
    }
}

/// Evaluates an expression and stores the result under a target key.
#[derive(Debug, Clone)]
pub struct ExpressionMapping {
    expression: Arc<dyn Expression>,
    target: String,
    required: bool,
}

impl ExpressionMapping {
    pub fn new(
        expression: Arc<dyn Expression>,
        target: &str,
    ) -> Self {
        Self {
            expression,
            target: target.to_string(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn map(
        &self,
        ctx: &RequestContext<'_>,
        target: &mut AttributeMap,
    ) -> Result<()> {
        let value = self.expression.evaluate(ctx)?;
        if value == Value::Null && self.required {
            return Err(ConvoflowError::Attribute(format!("required mapping {:?} into '{}' produced no value", self.expression, self.target)));
        }
        target.put(&self.target, value)?;
        Ok(())
    }
}
