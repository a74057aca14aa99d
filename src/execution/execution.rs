use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    AttributeMap, ConvoflowError, ExternalContext, Flow, FlowDefinitionLocator, FlowExecutionKey, FlowExecutionListener, FlowSession, HistoryPolicy, RequestContext, Result,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FlowExecutionStatus {
    #[default]
    NotStarted,
    Active,
    Ended,
}

/// How the root session ended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowExecutionOutcome {
    /// Id of the end state reached.
    pub id: String,
    pub output: AttributeMap,
}

/// One run of a flow: the session stack plus conversation and flash scopes.
pub struct FlowExecution {
    pub(crate) definition: Arc<Flow>,
    pub(crate) sessions: Vec<FlowSession>,
    pub(crate) status: FlowExecutionStatus,
    pub(crate) key: Option<FlowExecutionKey>,
    pub(crate) conversation_scope: AttributeMap,
    pub(crate) flash_scope: AttributeMap,
    pub(crate) outcome: Option<FlowExecutionOutcome>,

    pub(crate) locator: Option<Arc<dyn FlowDefinitionLocator>>,
    pub(crate) listeners: Vec<Arc<dyn FlowExecutionListener>>,
    pub(crate) always_redirect_on_pause: bool,
    pub(crate) rendered_view: Option<String>,
    pub(crate) redirect_requested: bool,
    pub(crate) history_policy: HistoryPolicy,
}

impl FlowExecution {
    pub fn new(definition: Arc<Flow>) -> Self {
        Self {
            definition,
            sessions: Vec::new(),
            status: FlowExecutionStatus::NotStarted,
            key: None,
            conversation_scope: AttributeMap::new(),
            flash_scope: AttributeMap::new(),
            outcome: None,
            locator: None,
            listeners: Vec::new(),
            always_redirect_on_pause: false,
            rendered_view: None,
            redirect_requested: false,
            history_policy: HistoryPolicy::Preserve,
        }
    }

    /// Starts the root session; only valid once per execution. A vetoed start
    /// state leaves the execution not started.
    pub fn start(
        &mut self,
        input: AttributeMap,
        external: &mut dyn ExternalContext,
    ) -> Result<()> {
        if self.status != FlowExecutionStatus::NotStarted {
            return Err(ConvoflowError::IllegalState(format!("flow execution of '{}' has already been started", self.definition.id())));
        }
        debug!("starting flow execution of '{}'", self.definition.id());
        let checkpoint = Checkpoint::capture(self);
        self.status = FlowExecutionStatus::Active;
        self.begin_request();

        let definition = self.definition.clone();
        let mut ctx = RequestContext::new(self, external);
        ctx.notify(|l, ctx| l.request_submitted(ctx));
        let result = ctx.start_flow(definition, input);
        let result = ctx.complete_request(result);
        ctx.notify(|l, ctx| l.request_processed(ctx));
        self.roll_back_veto(result, checkpoint)
    }

    /// Resumes a paused execution with the event carried by `external`; without
    /// an event the current view state is rendered again.
    ///
    /// Flash scope is cleared first, unless the previous request paused with a
    /// redirect and nothing has rendered it yet. When a state entry is vetoed
    /// the execution is put back exactly as it was before this call. Any other
    /// error leaves it part way through the transition; it must then be
    /// discarded and restored again from its last snapshot.
    pub fn resume(
        &mut self,
        external: &mut dyn ExternalContext,
    ) -> Result<()> {
        if self.status != FlowExecutionStatus::Active {
            return Err(ConvoflowError::IllegalState(format!(
                "flow execution of '{}' is {} and cannot be resumed",
                self.definition.id(),
                self.status
            )));
        }
        trace!("resuming flow execution {:?}", self.key.as_ref().map(ToString::to_string));
        let checkpoint = Checkpoint::capture(self);
        if !self.redirect_requested {
            self.flash_scope.clear();
        }
        self.begin_request();

        let mut ctx = RequestContext::new(self, external);
        ctx.notify(|l, ctx| l.request_submitted(ctx));
        let result = ctx.resume_active_session();
        let result = ctx.complete_request(result);
        ctx.notify(|l, ctx| l.request_processed(ctx));
        self.roll_back_veto(result, checkpoint)
    }

    fn roll_back_veto(
        &mut self,
        result: Result<()>,
        checkpoint: Checkpoint,
    ) -> Result<()> {
        if let Err(error) = &result {
            if matches!(error.root_cause(), ConvoflowError::EnterStateVetoed { .. }) {
                debug!("rolling flow execution of '{}' back to its state before the vetoed request", self.definition.id());
                checkpoint.reinstate(self);
            }
        }
        result
    }

    fn begin_request(&mut self) {
        self.rendered_view = None;
        self.redirect_requested = false;
    }

    pub fn definition(&self) -> &Arc<Flow> {
        &self.definition
    }

    pub fn key(&self) -> Option<&FlowExecutionKey> {
        self.key.as_ref()
    }

    pub fn status(&self) -> FlowExecutionStatus {
        self.status
    }

    pub fn has_started(&self) -> bool {
        self.status != FlowExecutionStatus::NotStarted
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowExecutionStatus::Active
    }

    pub fn has_ended(&self) -> bool {
        self.status == FlowExecutionStatus::Ended
    }

    pub fn outcome(&self) -> Option<&FlowExecutionOutcome> {
        self.outcome.as_ref()
    }

    /// Session stack, root first.
    pub fn sessions(&self) -> &[FlowSession] {
        &self.sessions
    }

    pub fn active_session(&self) -> Result<&FlowSession> {
        self.sessions.last().ok_or_else(|| self.no_active_session())
    }

    pub fn active_session_mut(&mut self) -> Result<&mut FlowSession> {
        let err = self.no_active_session();
        self.sessions.last_mut().ok_or(err)
    }

    fn no_active_session(&self) -> ConvoflowError {
        ConvoflowError::IllegalState(format!("flow execution of '{}' has no active session ({})", self.definition.id(), self.status))
    }

    pub fn conversation_scope(&self) -> &AttributeMap {
        &self.conversation_scope
    }

    pub fn conversation_scope_mut(&mut self) -> &mut AttributeMap {
        &mut self.conversation_scope
    }

    pub fn flash_scope(&self) -> &AttributeMap {
        &self.flash_scope
    }

    pub fn flash_scope_mut(&mut self) -> &mut AttributeMap {
        &mut self.flash_scope
    }

    /// View rendered by the last request; `None` after a redirect or a completed response.
    pub fn rendered_view(&self) -> Option<&str> {
        self.rendered_view.as_deref()
    }

    /// Whether the last request asked for a redirect to the paused execution.
    pub fn redirect_requested(&self) -> bool {
        self.redirect_requested
    }

    /// History policy of the last transition that asked for one.
    pub fn history_policy(&self) -> HistoryPolicy {
        self.history_policy
    }

    pub(crate) fn take_history_policy(&mut self) -> HistoryPolicy {
        std::mem::take(&mut self.history_policy)
    }

    pub(crate) fn set_key(
        &mut self,
        key: FlowExecutionKey,
    ) {
        self.key = Some(key);
    }
}

/// Mutable execution state as it was when a request began.
struct Checkpoint {
    sessions: Vec<FlowSession>,
    status: FlowExecutionStatus,
    conversation_scope: AttributeMap,
    flash_scope: AttributeMap,
    outcome: Option<FlowExecutionOutcome>,
    redirect_requested: bool,
    history_policy: HistoryPolicy,
}

impl Checkpoint {
    fn capture(execution: &FlowExecution) -> Self {
        Self {
            sessions: execution.sessions.clone(),
            status: execution.status,
            conversation_scope: execution.conversation_scope.clone(),
            flash_scope: execution.flash_scope.clone(),
            outcome: execution.outcome.clone(),
            redirect_requested: execution.redirect_requested,
            history_policy: execution.history_policy,
        }
    }

    fn reinstate(
        self,
        execution: &mut FlowExecution,
    ) {
        execution.sessions = self.sessions;
        execution.status = self.status;
        execution.conversation_scope = self.conversation_scope;
        execution.flash_scope = self.flash_scope;
        execution.outcome = self.outcome;
        execution.redirect_requested = self.redirect_requested;
        execution.history_policy = self.history_policy;
        execution.rendered_view = None;
    }
}

impl std::fmt::Debug for FlowExecution {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("FlowExecution")
            .field("flow_id", &self.definition.id())
            .field("key", &self.key)
            .field("status", &self.status)
            .field("sessions", &self.sessions.iter().map(|s| (s.flow_id(), s.state_id())).collect::<Vec<_>>())
            .finish()
    }
}
