use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Action, AttributeMap, ConvoflowError, Expression, RequestContext, Result,
    definition::{action::is_success_event, expression::as_text},
};

/// Decides whether a transition fires for the current request.
#[derive(Debug, Clone)]
pub enum TransitionCriteria {
    /// Matches every event.
    Wildcard,
    /// Matches events with exactly this id.
    EventId(String),
    /// Boolean results are used directly; any other result is rendered as
    /// text and compared with the current event id.
    Expression(Arc<dyn Expression>),
}

impl TransitionCriteria {
    pub fn test(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<bool> {
        match self {
            TransitionCriteria::Wildcard => Ok(true),
            TransitionCriteria::EventId(id) => Ok(ctx.current_event().is_some_and(|e| e.id() == id)),
            TransitionCriteria::Expression(expression) => match expression.evaluate(ctx)? {
                Value::Bool(b) => Ok(b),
                other => Ok(ctx.current_event().is_some_and(|e| e.id() == as_text(&other))),
            },
        }
    }
}

/// Yields the id of the state a transition moves to, within the active flow.
#[derive(Debug, Clone)]
pub enum TargetStateResolver {
    Static(String),
    Expression(Arc<dyn Expression>),
}

impl TargetStateResolver {
    pub fn resolve(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<String> {
        match self {
            TargetStateResolver::Static(id) => Ok(id.clone()),
            TargetStateResolver::Expression(expression) => match expression.evaluate(ctx)? {
                Value::Null => Err(ConvoflowError::Expression(format!("target state expression {:?} resolved to null", expression))),
                other => Ok(as_text(&other)),
            },
        }
    }
}

/// What happens to earlier snapshots of the conversation when a transition executes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HistoryPolicy {
    /// Earlier snapshots stay reachable.
    #[default]
    Preserve,
    /// The snapshot the execution was restored from is removed.
    Discard,
    /// Every earlier snapshot of the conversation is removed.
    Invalidate,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub(crate) criteria: TransitionCriteria,
    pub(crate) target: Option<TargetStateResolver>,
    pub(crate) execution_criteria: Vec<Arc<dyn Action>>,
    pub(crate) history: HistoryPolicy,
    pub(crate) attributes: AttributeMap,
}

impl Transition {
    pub fn new(
        criteria: TransitionCriteria,
        target: Option<TargetStateResolver>,
    ) -> Self {
        Self {
            criteria,
            target,
            execution_criteria: Vec::new(),
            history: HistoryPolicy::Preserve,
            attributes: AttributeMap::new(),
        }
    }

    pub fn criteria(&self) -> &TransitionCriteria {
        &self.criteria
    }

    pub fn target(&self) -> Option<&TargetStateResolver> {
        self.target.as_ref()
    }

    pub fn history(&self) -> HistoryPolicy {
        self.history
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn matches(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<bool> {
        self.criteria.test(ctx)
    }

    /// Runs the execution criteria; every result must be `success`, `yes` or `true`.
    pub fn can_execute(
        &self,
        ctx: &mut RequestContext<'_>,
    ) -> Result<bool> {
        for action in &self.execution_criteria {
            if !is_success_event(&action.execute(ctx)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn target_state_id(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Option<String>> {
        self.target.as_ref().map(|t| t.resolve(ctx)).transpose()
    }

    /// Text used in logs and error messages.
    pub fn describe(&self) -> String {
        let on = match &self.criteria {
            TransitionCriteria::Wildcard => "*".to_string(),
            TransitionCriteria::EventId(id) => id.clone(),
            TransitionCriteria::Expression(e) => format!("{:?}", e),
        };
        match &self.target {
            Some(TargetStateResolver::Static(id)) => format!("on '{}' to '{}'", on, id),
            Some(TargetStateResolver::Expression(e)) => format!("on '{}' to {:?}", on, e),
            None => format!("on '{}'", on),
        }
    }
}
