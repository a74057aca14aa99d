use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::{AttributeMap, ConvoflowError, Event, Flow, FlowExecutionOutcome, FlowSession, RequestContext, Result, State, Transition};

/// Criteria matching every flow.
pub const ALL_FLOWS: &str = "*";

/// Reason a listener refused entry into a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    pub reason: String,
}

impl Veto {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Observer of flow execution lifecycle events; every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait FlowExecutionListener: Send + Sync {
    fn request_submitted(
        &self,
        ctx: &RequestContext<'_>,
    ) {
    }

    fn request_processed(
        &self,
        ctx: &RequestContext<'_>,
    ) {
    }

    fn session_creating(
        &self,
        ctx: &RequestContext<'_>,
        definition: &Flow,
    ) {
    }

    fn session_starting(
        &self,
        ctx: &RequestContext<'_>,
        session: &FlowSession,
        input: &AttributeMap,
    ) {
    }

    fn session_started(
        &self,
        ctx: &RequestContext<'_>,
        session: &FlowSession,
    ) {
    }

    fn event_signaled(
        &self,
        ctx: &RequestContext<'_>,
        event: &Event,
    ) {
    }

    fn transition_executing(
        &self,
        ctx: &RequestContext<'_>,
        transition: &Transition,
    ) {
    }

    /// Called before `state` is entered; returning a [`Veto`] cancels the
    /// transition and leaves the current state active.
    fn state_entering(
        &self,
        ctx: &RequestContext<'_>,
        state: &State,
    ) -> std::result::Result<(), Veto> {
        Ok(())
    }

    fn state_entered(
        &self,
        ctx: &RequestContext<'_>,
        previous: Option<&State>,
        state: &State,
    ) {
    }

    fn paused(
        &self,
        ctx: &RequestContext<'_>,
    ) {
    }

    fn resuming(
        &self,
        ctx: &RequestContext<'_>,
    ) {
    }

    fn session_ending(
        &self,
        ctx: &RequestContext<'_>,
        session: &FlowSession,
        output: &AttributeMap,
    ) {
    }

    fn session_ended(
        &self,
        ctx: &RequestContext<'_>,
        session: &FlowSession,
        outcome: &FlowExecutionOutcome,
    ) {
    }

    fn exception_thrown(
        &self,
        ctx: &RequestContext<'_>,
        error: &ConvoflowError,
    ) {
    }
}

/// Decides which listeners observe executions of a flow.
pub trait FlowExecutionListenerLoader: Send + Sync {
    fn listeners(
        &self,
        flow: &Flow,
    ) -> Vec<Arc<dyn FlowExecutionListener>>;
}

/// Attaches listeners whose glob criteria match the flow id.
///
/// Criteria are comma separated glob patterns, e.g. `"booking-*,search"`.
#[derive(Default)]
pub struct ConditionalListenerLoader {
    entries: Vec<(GlobSet, Arc<dyn FlowExecutionListener>)>,
}

impl ConditionalListenerLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &mut self,
        listener: Arc<dyn FlowExecutionListener>,
        criteria: &str,
    ) -> Result<()> {
        let mut builder = GlobSetBuilder::new();
        for pattern in criteria.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let glob = Glob::new(pattern).map_err(|e| ConvoflowError::Config(format!("invalid listener criteria '{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| ConvoflowError::Config(format!("invalid listener criteria '{}': {}", criteria, e)))?;
        if set.is_empty() {
            return Err(ConvoflowError::Config("listener criteria must not be empty".to_string()));
        }
        self.entries.push((set, listener));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FlowExecutionListenerLoader for ConditionalListenerLoader {
    fn listeners(
        &self,
        flow: &Flow,
    ) -> Vec<Arc<dyn FlowExecutionListener>> {
        let listeners: Vec<_> = self.entries.iter().filter(|(set, _)| set.is_match(flow.id())).map(|(_, l)| l.clone()).collect();
        debug!("attaching {} listener(s) to flow '{}'", listeners.len(), flow.id());
        listeners
    }
}
