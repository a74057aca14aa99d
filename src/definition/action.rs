use std::{fmt, sync::Arc};

use serde_json::Value;
use tracing::trace;

use crate::{Event, Expression, RequestContext, Result, ScopeType, execution::event};

pub trait Action: Send + Sync + fmt::Debug {
    /// Executes the action.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The [`RequestContext`] of the request being processed.
    ///
    /// # Returns
    ///
    /// The result [`Event`]; action states match it against their transitions.
    fn execute(
        &self,
        ctx: &mut RequestContext<'_>,
    ) -> Result<Event>;
}

/// Whether an action result counts as a pass for transition execution criteria.
pub fn is_success_event(event: &Event) -> bool {
    matches!(event.id(), event::SUCCESS | event::YES | "true")
}

/// Runs `actions` in order and stops at the first error; result events are ignored.
pub(crate) fn execute_all(
    actions: &[Arc<dyn Action>],
    ctx: &mut RequestContext<'_>,
) -> Result<()> {
    for action in actions {
        trace!("executing action {:?}", action);
        action.execute(ctx)?;
    }
    Ok(())
}

fn result_event(
    value: &Value,
    source: &str,
) -> Event {
    match value {
        Value::Bool(true) => Event::yes(source),
        Value::Bool(false) => Event::no(source),
        Value::String(s) => Event::new(s, source).unwrap_or_else(|_| Event::success(source)),
        _ => Event::success(source),
    }
}

type ExecuteFn = dyn Fn(&mut RequestContext<'_>) -> Result<Event> + Send + Sync;

/// An action backed by a closure.
#[derive(Clone)]
pub struct FnAction {
    name: String,
    f: Arc<ExecuteFn>,
}

impl FnAction {
    pub fn new<F>(
        name: &str,
        f: F,
    ) -> Self
    where
        F: Fn(&mut RequestContext<'_>) -> Result<Event> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for FnAction {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "FnAction({})", self.name)
    }
}

impl Action for FnAction {
    fn execute(
        &self,
        ctx: &mut RequestContext<'_>,
    ) -> Result<Event> {
        (self.f)(ctx)
    }
}

/// Evaluates an expression and stores the value in a scope.
#[derive(Debug, Clone)]
pub struct SetAction {
    scope: ScopeType,
    name: String,
    value: Arc<dyn Expression>,
}

impl SetAction {
    pub fn new(
        scope: ScopeType,
        name: &str,
        value: Arc<dyn Expression>,
    ) -> Self {
        Self {
            scope,
            name: name.to_string(),
            value,
        }
    }
}

impl Action for SetAction {
    fn execute(
        &self,
        ctx: &mut RequestContext<'_>,
    ) -> Result<Event> {
        let value = self.value.evaluate(ctx)?;
        ctx.scope_mut(self.scope)?.put(&self.name, value)?;
        Ok(Event::success("set"))
    }
}

/// Evaluates an expression, optionally stores the value, and turns it into an
/// event: booleans become `yes`/`no`, strings become an event of that id and
/// anything else is `success`.
#[derive(Debug, Clone)]
pub struct EvaluateAction {
    expression: Arc<dyn Expression>,
    result: Option<(ScopeType, String)>,
}

impl EvaluateAction {
    pub fn new(expression: Arc<dyn Expression>) -> Self {
        Self {
            expression,
            result: None,
        }
    }

    pub fn store_result(
        mut self,
        scope: ScopeType,
        name: &str,
    ) -> Self {
        self.result = Some((scope, name.to_string()));
        self
    }
}

impl Action for EvaluateAction {
    fn execute(
        &self,
        ctx: &mut RequestContext<'_>,
    ) -> Result<Event> {
        let value = self.expression.evaluate(ctx)?;
        if let Some((scope, name)) = &self.result {
            ctx.scope_mut(*scope)?.put(name, value.clone())?;
        }
        Ok(result_event(&value, "evaluate"))
    }
}
