//! State machine driving: session start and end, state entry, event handling
//! and transition execution.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    AttributeMap, ConvoflowError, Event, Flow, FlowExecutionOutcome, FlowExecutionStatus, FlowSession, FlowSessionStatus, HistoryPolicy, RequestContext, Result, State,
    StateKind, Transition, definition::action::execute_all,
};

impl RequestContext<'_> {
    /// Pushes a new session for `flow`, initializes its flow scope and enters the start state.
    pub(crate) fn start_flow(
        &mut self,
        flow: Arc<Flow>,
        input: AttributeMap,
    ) -> Result<()> {
        self.notify(|l, ctx| l.session_creating(ctx, &flow));
        let depth = self.execution.sessions.len();
        let mut session = FlowSession::new(flow.clone(), depth);
        session.set_status(FlowSessionStatus::Starting);
        self.execution.sessions.push(session);
        debug!("starting session of flow '{}' at depth {}", flow.id(), depth);
        self.notify(|l, ctx| {
            if let Ok(session) = ctx.active_session() {
                l.session_starting(ctx, session, &input)
            }
        });

        {
            let scope = self.flow_scope_mut()?;
            scope.extend(flow.variables());
            match flow.input_mappings() {
                None => scope.extend(&input),
                Some(mappings) => {
                    for mapping in mappings {
                        mapping.map(&input, scope)?;
                    }
                }
            }
        }
        execute_all(flow.start_actions(), self)?;

        self.execution.active_session_mut()?.set_status(FlowSessionStatus::Active);
        self.notify(|l, ctx| {
            if let Ok(session) = ctx.active_session() {
                l.session_started(ctx, session)
            }
        });

        let start = flow.start_state()?;
        self.check_entry(&start)?;
        self.activate_state(start)
    }

    /// Resumes the paused active session with the event of the external request.
    pub(crate) fn resume_active_session(&mut self) -> Result<()> {
        self.execution.active_session_mut()?.set_status(FlowSessionStatus::Active);
        self.notify(|l, ctx| l.resuming(ctx));

        let state = self.current_state()?;
        match self.external.event_id() {
            Some(event_id) => {
                let event = Event::new(&event_id, "external")?.with_attributes(self.external.request_parameters().clone());
                self.handle_event(event)
            }
            None if state.is_view_state() => self.render_view(&state),
            None => Err(ConvoflowError::IllegalState(format!("state '{}' of flow '{}' cannot be refreshed without an event", state.id(), state.flow_id()))),
        }
    }

    /// Signals `event` to the current state and executes the matching transition.
    pub(crate) fn handle_event(
        &mut self,
        event: Event,
    ) -> Result<()> {
        self.signal(event);
        let state = self.current_state()?;
        let transition = self.required_transition(&state)?;
        self.execute_transition(&state, transition)
    }

    fn signal(
        &mut self,
        event: Event,
    ) {
        trace!("event '{}' signaled in {:?}", event.id(), self.active_session().ok().and_then(FlowSession::state_id));
        self.notify(|l, ctx| l.event_signaled(ctx, &event));
        self.current_event = Some(event);
    }

    fn matching_transition(
        &self,
        state: &State,
    ) -> Result<Option<Transition>> {
        self.active_flow()?.matching_transition(state, self)
    }

    fn required_transition(
        &self,
        state: &State,
    ) -> Result<Transition> {
        self.matching_transition(state)?.ok_or_else(|| ConvoflowError::NoMatchingTransition {
            flow_id: state.flow_id().to_string(),
            state_id: state.id().to_string(),
            event_id: self.current_event().map(|e| e.id().to_string()).unwrap_or_default(),
        })
    }

    fn execute_transition(
        &mut self,
        source: &Arc<State>,
        transition: Transition,
    ) -> Result<()> {
        trace!("executing transition {} from state '{}'", transition.describe(), source.id());
        self.notify(|l, ctx| l.transition_executing(ctx, &transition));
        self.current_transition = Some(transition.clone());

        if !transition.can_execute(self)? {
            if source.is_view_state() {
                debug!("transition {} rejected by its execution criteria, rendering '{}' again", transition.describe(), source.id());
                return self.pause_in_view(source);
            }
            return Err(ConvoflowError::IllegalState(format!(
                "transition {} of state '{}' was rejected by its execution criteria and the state cannot pause",
                transition.describe(),
                source.id()
            )));
        }

        let Some(target_id) = transition.target_state_id(self)? else {
            if source.is_view_state() {
                return self.pause_in_view(source);
            }
            return Err(ConvoflowError::Definition(format!(
                "transition {} of non-view state '{}' in flow '{}' has no target state",
                transition.describe(),
                source.id(),
                source.flow_id()
            )));
        };
        let target = self.active_flow()?.state(&target_id)?;

        self.check_entry(&target)?;
        self.exit_state(source)?;
        if transition.history() != HistoryPolicy::Preserve {
            self.execution.history_policy = transition.history();
        }
        self.activate_state(target)
    }

    /// Asks every listener whether `target` may be entered.
    fn check_entry(
        &self,
        target: &State,
    ) -> Result<()> {
        for listener in &self.execution.listeners {
            if let Err(veto) = listener.state_entering(self, target) {
                debug!("entering state '{}' of flow '{}' vetoed: {}", target.id(), target.flow_id(), veto.reason);
                return Err(ConvoflowError::EnterStateVetoed {
                    flow_id: target.flow_id().to_string(),
                    source_state_id: self.active_session().ok().and_then(FlowSession::state_id).map(str::to_string),
                    target_state_id: target.id().to_string(),
                    reason: veto.reason,
                });
            }
        }
        Ok(())
    }

    fn exit_state(
        &mut self,
        state: &State,
    ) -> Result<()> {
        trace!("exiting state '{}' of flow '{}'", state.id(), state.flow_id());
        execute_all(state.exit_actions(), self)
    }

    fn activate_state(
        &mut self,
        state: Arc<State>,
    ) -> Result<()> {
        let previous = self.execution.active_session_mut()?.state().cloned();
        self.execution.active_session_mut()?.set_state(state.clone());
        debug!("entered state '{}' ({}) of flow '{}'", state.id(), state.kind().as_ref(), state.flow_id());
        self.notify(|l, ctx| l.state_entered(ctx, previous.as_deref(), &state));

        execute_all(state.entry_actions(), self)?;

        match state.kind() {
            StateKind::View { .. } => self.pause_in_view(&state),
            StateKind::Action { actions } => {
                for action in actions {
                    let event = action.execute(self)?;
                    self.signal(event);
                    if let Some(transition) = self.matching_transition(&state)? {
                        return self.execute_transition(&state, transition);
                    }
                }
                Err(ConvoflowError::NoMatchingTransition {
                    flow_id: state.flow_id().to_string(),
                    state_id: state.id().to_string(),
                    event_id: self.current_event().map(|e| e.id().to_string()).unwrap_or_default(),
                })
            }
            StateKind::Decision => {
                let transition = self.required_transition(&state)?;
                self.execute_transition(&state, transition)
            }
            StateKind::Subflow { subflow, input, .. } => {
                let subflow_id = subflow.resolve(self)?;
                let locator = self
                    .execution
                    .locator
                    .clone()
                    .ok_or_else(|| ConvoflowError::IllegalState("no flow definition locator is attached to this execution".to_string()))?;
                let definition = locator.get_flow_definition(&subflow_id)?;
                let mut subflow_input = AttributeMap::new();
                for mapping in input {
                    mapping.map(self, &mut subflow_input)?;
                }
                self.execution.active_session_mut()?.set_status(FlowSessionStatus::Suspended);
                self.start_flow(definition, subflow_input)
            }
            StateKind::End { output, view } => {
                let mut session_output = AttributeMap::new();
                for mapping in output {
                    mapping.map(self, &mut session_output)?;
                }
                if let Some(view) = view {
                    if self.active_session()?.is_root() && !self.external.is_response_complete() {
                        self.execution.rendered_view = Some(view.clone());
                    }
                }
                self.end_active_session(state.id(), session_output)
            }
        }
    }

    /// Pauses in a view state after processing an event: asks for a redirect
    /// when the state or the execution wants one, otherwise renders the view.
    fn pause_in_view(
        &mut self,
        state: &State,
    ) -> Result<()> {
        let StateKind::View {
            redirect, ..
        } = state.kind()
        else {
            return Err(ConvoflowError::IllegalState(format!("state '{}' is not a view state", state.id())));
        };
        if self.external.is_response_complete() {
            trace!("response already complete, not pausing '{}' with a render", state.id());
            return Ok(());
        }
        if *redirect || self.execution.always_redirect_on_pause {
            trace!("requesting flow execution redirect for view state '{}'", state.id());
            self.execution.redirect_requested = true;
            self.external.request_flow_execution_redirect();
            return Ok(());
        }
        self.render_view(state)
    }

    /// Runs render actions and records the view, unless an action already
    /// completed the response.
    fn render_view(
        &mut self,
        state: &State,
    ) -> Result<()> {
        let StateKind::View {
            view,
            render_actions,
            ..
        } = state.kind()
        else {
            return Err(ConvoflowError::IllegalState(format!("state '{}' is not a view state", state.id())));
        };
        if self.external.is_response_complete() {
            return Ok(());
        }
        execute_all(render_actions, self)?;
        if !self.external.is_response_complete() {
            self.execution.rendered_view = Some(view.clone().unwrap_or_else(|| state.id().to_string()));
        }
        Ok(())
    }

    /// Ends the active session. `session_ended` fires even when end actions
    /// fail; the failure is returned afterwards.
    fn end_active_session(
        &mut self,
        outcome_id: &str,
        output: AttributeMap,
    ) -> Result<()> {
        let definition = self.active_flow()?.clone();
        self.execution.active_session_mut()?.set_status(FlowSessionStatus::Ending);
        self.notify(|l, ctx| {
            if let Ok(session) = ctx.active_session() {
                l.session_ending(ctx, session, &output)
            }
        });

        let end_actions = execute_all(definition.end_actions(), self);

        let mut ended = self.execution.sessions.pop().ok_or_else(|| ConvoflowError::IllegalState("no session to end".to_string()))?;
        ended.end();
        let outcome = FlowExecutionOutcome {
            id: outcome_id.to_string(),
            output,
        };
        debug!("session of flow '{}' ended with outcome '{}'", ended.flow_id(), outcome.id);
        self.notify(|l, ctx| l.session_ended(ctx, &ended, &outcome));
        end_actions?;

        if self.execution.sessions.is_empty() {
            self.execution.status = FlowExecutionStatus::Ended;
            self.execution.outcome = Some(outcome);
            return Ok(());
        }

        let parent_state = self.current_state()?;
        self.execution.active_session_mut()?.set_status(FlowSessionStatus::Active);
        if let StateKind::Subflow { output: mappings, .. } = parent_state.kind() {
            let scope = self.flow_scope_mut()?;
            match mappings {
                None => scope.extend(&outcome.output),
                Some(mappings) => {
                    for mapping in mappings {
                        mapping.map(&outcome.output, scope)?;
                    }
                }
            }
        }
        let event = Event::new(&outcome.id, ended.flow_id())?.with_attributes(outcome.output);
        self.handle_event(event)
    }

    /// Pauses the execution or wraps and reports the error of this request.
    pub(crate) fn complete_request(
        &mut self,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                if self.execution.is_active() {
                    self.execution.active_session_mut()?.set_status(FlowSessionStatus::Paused);
                    self.notify(|l, ctx| l.paused(ctx));
                }
                Ok(())
            }
            Err(error) => {
                let error = if error.carries_flow_context() {
                    error
                } else {
                    let session = self.active_session().ok();
                    ConvoflowError::FlowExecution {
                        flow_id: session.map(|s| s.flow_id().to_string()).unwrap_or_else(|| self.execution.definition.id().to_string()),
                        state_id: session.and_then(FlowSession::state_id).map(str::to_string),
                        source: Box::new(error),
                    }
                };
                debug!("request failed: {}", error);
                self.notify(|l, ctx| l.exception_thrown(ctx, &error));
                Err(error)
            }
        }
    }
}
