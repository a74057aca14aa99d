use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AttributeMap, ConvoflowError, Flow, Result, State};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowSessionStatus {
    #[default]
    Created,
    Starting,
    Active,
    /// Waiting for user input in a view state.
    Paused,
    /// Waiting for a subflow session to end.
    Suspended,
    Ending,
    Ended,
}

/// One activation of one flow; root session at depth 0, subflows above it.
#[derive(Debug, Clone)]
pub struct FlowSession {
    definition: Arc<Flow>,
    state: Option<Arc<State>>,
    status: FlowSessionStatus,
    scope: AttributeMap,
    view_scope: Option<AttributeMap>,
    depth: usize,
}

impl FlowSession {
    pub(crate) fn new(
        definition: Arc<Flow>,
        depth: usize,
    ) -> Self {
        Self {
            definition,
            state: None,
            status: FlowSessionStatus::Created,
            scope: AttributeMap::new(),
            view_scope: None,
            depth,
        }
    }

    /// Rebuilds a session from snapshot data and freshly located definitions.
    pub(crate) fn restore(
        definition: Arc<Flow>,
        state: Option<Arc<State>>,
        status: FlowSessionStatus,
        scope: AttributeMap,
        view_scope: Option<AttributeMap>,
        depth: usize,
    ) -> Self {
        let view_scope = match &state {
            Some(s) if s.is_view_state() => Some(view_scope.unwrap_or_default()),
            _ => None,
        };
        Self {
            definition,
            state,
            status,
            scope,
            view_scope,
            depth,
        }
    }

    pub fn definition(&self) -> &Arc<Flow> {
        &self.definition
    }

    pub fn flow_id(&self) -> &str {
        self.definition.id()
    }

    pub fn state(&self) -> Option<&Arc<State>> {
        self.state.as_ref()
    }

    pub fn state_id(&self) -> Option<&str> {
        self.state.as_deref().map(State::id)
    }

    pub fn status(&self) -> FlowSessionStatus {
        self.status
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    /// Flow scope.
    pub fn scope(&self) -> &AttributeMap {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut AttributeMap {
        &mut self.scope
    }

    /// Only available while the current state is a view state.
    pub fn view_scope(&self) -> Result<&AttributeMap> {
        let state_id = self.state_id().map(str::to_string);
        self.view_scope.as_ref().ok_or_else(|| no_view_scope(self.flow_id(), state_id))
    }

    pub fn view_scope_mut(&mut self) -> Result<&mut AttributeMap> {
        let flow_id = self.flow_id().to_string();
        let state_id = self.state_id().map(str::to_string);
        self.view_scope.as_mut().ok_or_else(|| no_view_scope(&flow_id, state_id))
    }

    pub fn has_view_scope(&self) -> bool {
        self.view_scope.is_some()
    }

    pub(crate) fn set_status(
        &mut self,
        status: FlowSessionStatus,
    ) {
        self.status = status;
    }

    /// Moves to `state`; a fresh view scope exists iff `state` is a view state.
    pub(crate) fn set_state(
        &mut self,
        state: Arc<State>,
    ) {
        self.view_scope = if state.is_view_state() { Some(AttributeMap::new()) } else { None };
        self.state = Some(state);
    }

    pub(crate) fn end(&mut self) {
        self.status = FlowSessionStatus::Ended;
        self.view_scope = None;
    }
}

fn no_view_scope(
    flow_id: &str,
    state_id: Option<String>,
) -> ConvoflowError {
    ConvoflowError::IllegalState(format!(
        "view scope is not available: state '{}' of flow '{}' is not a view state",
        state_id.as_deref().unwrap_or("<none>"),
        flow_id
    ))
}
