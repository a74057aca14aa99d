use std::sync::Arc;

use indexmap::IndexMap;

use crate::{Action, AttributeMap, ConvoflowError, Mapping, RequestContext, Result, State, Transition};

/// An immutable flow definition, shared by every execution of the flow.
#[derive(Debug)]
pub struct Flow {
    pub(crate) id: String,
    pub(crate) states: IndexMap<String, Arc<State>>,
    pub(crate) start_state_id: String,
    pub(crate) global_transitions: Vec<Transition>,
    pub(crate) variables: AttributeMap,
    pub(crate) input: Option<Vec<Mapping>>,
    pub(crate) start_actions: Vec<Arc<dyn Action>>,
    pub(crate) end_actions: Vec<Arc<dyn Action>>,
    pub(crate) attributes: AttributeMap,
}

impl Flow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(
        &self,
        state_id: &str,
    ) -> Result<Arc<State>> {
        self.states.get(state_id).cloned().ok_or_else(|| ConvoflowError::NoSuchState {
            flow_id: self.id.clone(),
            state_id: state_id.to_string(),
        })
    }

    pub fn contains_state(
        &self,
        state_id: &str,
    ) -> bool {
        self.states.contains_key(state_id)
    }

    pub fn state_ids(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn start_state(&self) -> Result<Arc<State>> {
        self.state(&self.start_state_id)
    }

    pub fn global_transitions(&self) -> &[Transition] {
        &self.global_transitions
    }

    /// Initial flow scope content of every new session.
    pub fn variables(&self) -> &AttributeMap {
        &self.variables
    }

    /// `None` copies the whole input into flow scope.
    pub fn input_mappings(&self) -> Option<&[Mapping]> {
        self.input.as_deref()
    }

    pub fn start_actions(&self) -> &[Arc<dyn Action>] {
        &self.start_actions
    }

    pub fn end_actions(&self) -> &[Arc<dyn Action>] {
        &self.end_actions
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// Resolves the transition for the current event: state transitions first,
    /// then the flow's global transitions.
    pub fn matching_transition(
        &self,
        state: &State,
        ctx: &RequestContext<'_>,
    ) -> Result<Option<Transition>> {
        if let Some(t) = state.matching_transition(ctx)? {
            return Ok(Some(t.clone()));
        }
        for transition in &self.global_transitions {
            if transition.matches(ctx)? {
                return Ok(Some(transition.clone()));
            }
        }
        Ok(None)
    }
}
