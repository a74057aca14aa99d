use std::sync::Arc;

use tracing::trace;

use crate::{
    AttributeMap, ConvoflowError, Flow, FlowDefinitionLocator, FlowExecution, FlowExecutionData, FlowExecutionKey, FlowExecutionListenerLoader, FlowExecutionStatus,
    FlowSession, Result,
};

/// Creates new executions and rebuilds restored ones, attaching the transient
/// collaborators (locator, listeners, redirect policy) in both cases.
pub struct FlowExecutionFactory {
    locator: Arc<dyn FlowDefinitionLocator>,
    listener_loader: Option<Arc<dyn FlowExecutionListenerLoader>>,
    always_redirect_on_pause: bool,
}

impl FlowExecutionFactory {
    pub fn new(locator: Arc<dyn FlowDefinitionLocator>) -> Self {
        Self {
            locator,
            listener_loader: None,
            always_redirect_on_pause: false,
        }
    }

    pub fn listener_loader(
        mut self,
        loader: Arc<dyn FlowExecutionListenerLoader>,
    ) -> Self {
        self.listener_loader = Some(loader);
        self
    }

    pub fn always_redirect_on_pause(
        mut self,
        redirect: bool,
    ) -> Self {
        self.always_redirect_on_pause = redirect;
        self
    }

    pub fn locator(&self) -> &Arc<dyn FlowDefinitionLocator> {
        &self.locator
    }

    pub fn create_flow_execution(
        &self,
        flow: Arc<Flow>,
    ) -> FlowExecution {
        let mut execution = FlowExecution::new(flow);
        self.attach(&mut execution);
        execution
    }

    /// Rebuilds an execution from snapshot data. Every session looks up its own
    /// flow and state by id, so sessions of subflows get their own definitions.
    pub fn restore_flow_execution(
        &self,
        data: FlowExecutionData,
        key: FlowExecutionKey,
        conversation_scope: AttributeMap,
    ) -> Result<FlowExecution> {
        trace!("restoring flow execution '{}' of flow '{}'", key, data.flow_id);
        if data.sessions.is_empty() {
            return Err(ConvoflowError::IllegalState(format!("snapshot of flow '{}' has no sessions", data.flow_id)));
        }
        let definition = self.locator.get_flow_definition(&data.flow_id)?;

        let mut sessions = Vec::with_capacity(data.sessions.len());
        for (depth, session) in data.sessions.into_iter().enumerate() {
            let flow = self.locator.get_flow_definition(&session.flow_id)?;
            let state = session.state_id.as_deref().map(|id| flow.state(id)).transpose()?;
            sessions.push(FlowSession::restore(flow, state, session.status, session.scope, session.view_scope, depth));
        }

        let mut execution = FlowExecution::new(definition);
        execution.sessions = sessions;
        execution.status = FlowExecutionStatus::Active;
        execution.flash_scope = data.flash_scope;
        execution.redirect_requested = data.redirect_pending;
        execution.conversation_scope = conversation_scope;
        execution.key = Some(key);
        self.attach(&mut execution);
        Ok(execution)
    }

    fn attach(
        &self,
        execution: &mut FlowExecution,
    ) {
        execution.locator = Some(self.locator.clone());
        execution.always_redirect_on_pause = self.always_redirect_on_pause;
        if let Some(loader) = &self.listener_loader {
            execution.listeners = loader.listeners(&execution.definition);
        }
    }
}
