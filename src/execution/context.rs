use std::sync::Arc;

use crate::{AttributeMap, ConvoflowError, Event, ExternalContext, Flow, FlowExecution, FlowExecutionListener, FlowSession, Result, ScopeType, State, Transition};

/// Everything an action, expression or listener can see while one request is processed.
pub struct RequestContext<'a> {
    pub(crate) execution: &'a mut FlowExecution,
    pub(crate) external: &'a mut dyn ExternalContext,
    request_scope: AttributeMap,
    pub(crate) current_event: Option<Event>,
    pub(crate) current_transition: Option<Transition>,
}

impl<'a> RequestContext<'a> {
    pub fn new(
        execution: &'a mut FlowExecution,
        external: &'a mut dyn ExternalContext,
    ) -> Self {
        Self {
            execution,
            external,
            request_scope: AttributeMap::new(),
            current_event: None,
            current_transition: None,
        }
    }

    pub fn flow_execution(&self) -> &FlowExecution {
        self.execution
    }

    pub fn external_context(&self) -> &dyn ExternalContext {
        &*self.external
    }

    pub fn external_context_mut(&mut self) -> &mut dyn ExternalContext {
        &mut *self.external
    }

    pub fn active_session(&self) -> Result<&FlowSession> {
        self.execution.active_session()
    }

    pub fn active_flow(&self) -> Result<&Arc<Flow>> {
        self.active_session().map(FlowSession::definition)
    }

    pub fn current_state(&self) -> Result<Arc<State>> {
        let session = self.active_session()?;
        session
            .state()
            .cloned()
            .ok_or_else(|| ConvoflowError::IllegalState(format!("session of flow '{}' has not entered a state yet", session.flow_id())))
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.current_event.as_ref()
    }

    pub fn current_transition(&self) -> Option<&Transition> {
        self.current_transition.as_ref()
    }

    pub(crate) fn set_current_event(
        &mut self,
        event: Event,
    ) {
        self.current_event = Some(event);
    }

    pub fn request_scope(&self) -> &AttributeMap {
        &self.request_scope
    }

    pub fn request_scope_mut(&mut self) -> &mut AttributeMap {
        &mut self.request_scope
    }

    pub fn flash_scope(&self) -> &AttributeMap {
        &self.execution.flash_scope
    }

    pub fn flash_scope_mut(&mut self) -> &mut AttributeMap {
        &mut self.execution.flash_scope
    }

    pub fn has_view_scope(&self) -> bool {
        self.active_session().is_ok_and(FlowSession::has_view_scope)
    }

    /// Fails with `IllegalState` unless the current state is a view state.
    pub fn view_scope(&self) -> Result<&AttributeMap> {
        self.active_session()?.view_scope()
    }

    pub fn view_scope_mut(&mut self) -> Result<&mut AttributeMap> {
        self.execution.active_session_mut()?.view_scope_mut()
    }

    pub fn flow_scope(&self) -> Result<&AttributeMap> {
        Ok(self.active_session()?.scope())
    }

    pub fn flow_scope_mut(&mut self) -> Result<&mut AttributeMap> {
        Ok(self.execution.active_session_mut()?.scope_mut())
    }

    pub fn conversation_scope(&self) -> &AttributeMap {
        &self.execution.conversation_scope
    }

    pub fn conversation_scope_mut(&mut self) -> &mut AttributeMap {
        &mut self.execution.conversation_scope
    }

    pub fn scope(
        &self,
        scope: ScopeType,
    ) -> Result<&AttributeMap> {
        match scope {
            ScopeType::Request => Ok(self.request_scope()),
            ScopeType::Flash => Ok(self.flash_scope()),
            ScopeType::View => self.view_scope(),
            ScopeType::Flow => self.flow_scope(),
            ScopeType::Conversation => Ok(self.conversation_scope()),
        }
    }

    pub fn scope_mut(
        &mut self,
        scope: ScopeType,
    ) -> Result<&mut AttributeMap> {
        match scope {
            ScopeType::Request => Ok(self.request_scope_mut()),
            ScopeType::Flash => Ok(self.flash_scope_mut()),
            ScopeType::View => self.view_scope_mut(),
            ScopeType::Flow => self.flow_scope_mut(),
            ScopeType::Conversation => Ok(self.conversation_scope_mut()),
        }
    }

    /// Calls `f` for every attached listener, in registration order.
    pub(crate) fn notify<F>(
        &self,
        f: F,
    ) where
        F: Fn(&dyn FlowExecutionListener, &RequestContext<'a>),
    {
        for listener in &self.execution.listeners {
            f(listener.as_ref(), self);
        }
    }
}
