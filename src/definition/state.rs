use std::sync::Arc;

use serde_json::Value;

use crate::{Action, AttributeMap, ConvoflowError, Expression, ExpressionMapping, Mapping, RequestContext, Result, Transition, definition::expression::as_text};

/// Identifies the flow a subflow state spawns.
#[derive(Debug, Clone)]
pub enum SubflowResolver {
    Static(String),
    Expression(Arc<dyn Expression>),
}

impl SubflowResolver {
    pub fn resolve(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<String> {
        match self {
            SubflowResolver::Static(id) => Ok(id.clone()),
            SubflowResolver::Expression(expression) => match expression.evaluate(ctx)? {
                Value::Null => Err(ConvoflowError::Expression(format!("subflow expression {:?} resolved to null", expression))),
                other => Ok(as_text(&other)),
            },
        }
    }
}

#[derive(Debug, Clone, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StateKind {
    /// Pauses the execution and waits for user input.
    View {
        view: Option<String>,
        redirect: bool,
        render_actions: Vec<Arc<dyn Action>>,
    },
    /// Runs its actions in order; the first result event matching a transition wins.
    Action { actions: Vec<Arc<dyn Action>> },
    /// Transitions on the first criteria that holds.
    Decision,
    /// Spawns a nested session of another flow.
    Subflow {
        subflow: SubflowResolver,
        input: Vec<ExpressionMapping>,
        /// `None` copies the whole subflow output into flow scope.
        output: Option<Vec<Mapping>>,
    },
    /// Ends the owning session with the state id as outcome.
    End {
        output: Vec<ExpressionMapping>,
        view: Option<String>,
    },
}

#[derive(Debug)]
pub struct State {
    pub(crate) id: String,
    pub(crate) flow_id: String,
    pub(crate) kind: StateKind,
    pub(crate) entry_actions: Vec<Arc<dyn Action>>,
    pub(crate) exit_actions: Vec<Arc<dyn Action>>,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) attributes: AttributeMap,
}

impl State {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn entry_actions(&self) -> &[Arc<dyn Action>] {
        &self.entry_actions
    }

    pub fn exit_actions(&self) -> &[Arc<dyn Action>] {
        &self.exit_actions
    }

    pub fn is_view_state(&self) -> bool {
        matches!(self.kind, StateKind::View { .. })
    }

    pub fn is_end_state(&self) -> bool {
        matches!(self.kind, StateKind::End { .. })
    }

    /// The first transition, in declaration order, whose criteria match.
    pub fn matching_transition(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Option<&Transition>> {
        for transition in &self.transitions {
            if transition.matches(ctx)? {
                return Ok(Some(transition));
            }
        }
        Ok(None)
    }
}
