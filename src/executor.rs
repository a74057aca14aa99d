use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    AttributeMap, ConvoflowError, ExternalContext, FlowDefinitionLocator, FlowExecution, FlowExecutionFactory, FlowExecutionKey, FlowExecutionOutcome,
    FlowExecutionRepository, LockGuard, Result,
};

/// What a launch or resume request left behind.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowExecutionResult {
    /// The execution paused and was stored under `key`.
    Paused {
        flow_id: String,
        key: FlowExecutionKey,
        /// View to render, `None` when a redirect was requested or an action completed the response.
        view: Option<String>,
        redirect: bool,
    },
    /// The root session ended; nothing is stored any more.
    Ended {
        flow_id: String,
        outcome: FlowExecutionOutcome,
    },
}

impl FlowExecutionResult {
    pub fn flow_id(&self) -> &str {
        match self {
            FlowExecutionResult::Paused {
                flow_id, ..
            }
            | FlowExecutionResult::Ended {
                flow_id, ..
            } => flow_id,
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, FlowExecutionResult::Paused { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, FlowExecutionResult::Ended { .. })
    }

    pub fn key(&self) -> Option<&FlowExecutionKey> {
        match self {
            FlowExecutionResult::Paused {
                key, ..
            } => Some(key),
            FlowExecutionResult::Ended { .. } => None,
        }
    }

    pub fn outcome(&self) -> Option<&FlowExecutionOutcome> {
        match self {
            FlowExecutionResult::Ended {
                outcome, ..
            } => Some(outcome),
            FlowExecutionResult::Paused { .. } => None,
        }
    }
}

/// Entry point for callers: launches flows and resumes paused executions by key.
///
/// Each call is one request. Resuming holds the conversation lock from the
/// load of the snapshot until the next snapshot is stored, so concurrent
/// requests against one conversation are serialized.
pub struct FlowExecutor {
    locator: Arc<dyn FlowDefinitionLocator>,
    execution_factory: Arc<FlowExecutionFactory>,
    repository: Arc<dyn FlowExecutionRepository>,
}

impl FlowExecutor {
    pub fn new(
        locator: Arc<dyn FlowDefinitionLocator>,
        execution_factory: Arc<FlowExecutionFactory>,
        repository: Arc<dyn FlowExecutionRepository>,
    ) -> Self {
        Self {
            locator,
            execution_factory,
            repository,
        }
    }

    pub fn locator(&self) -> &Arc<dyn FlowDefinitionLocator> {
        &self.locator
    }

    pub fn execution_factory(&self) -> &Arc<FlowExecutionFactory> {
        &self.execution_factory
    }

    pub fn repository(&self) -> &Arc<dyn FlowExecutionRepository> {
        &self.repository
    }

    /// Starts a new execution of `flow_id` and stores it if it paused.
    pub fn launch_execution(
        &self,
        flow_id: &str,
        input: AttributeMap,
        external: &mut dyn ExternalContext,
    ) -> Result<FlowExecutionResult> {
        let definition = self.locator.get_flow_definition(flow_id)?;
        let mut execution = self.execution_factory.create_flow_execution(definition);
        info!("launching flow '{}'", flow_id);
        execution.start(input, external)?;
        self.finish(execution)
    }

    /// Restores the execution stored under `encoded_key` and resumes it.
    ///
    /// On error nothing is stored, so the key keeps pointing at the state
    /// before this request.
    pub fn resume_execution(
        &self,
        encoded_key: &str,
        external: &mut dyn ExternalContext,
    ) -> Result<FlowExecutionResult> {
        let key = self.repository.parse_flow_execution_key(encoded_key)?;
        let _guard = LockGuard::acquire(self.repository.get_lock(&key)?)?;
        let mut execution = self.repository.get_flow_execution(&key)?;
        debug!("resuming flow execution '{}' of flow '{}'", key, execution.definition().id());
        execution.resume(external)?;
        self.finish(execution)
    }

    fn finish(
        &self,
        mut execution: FlowExecution,
    ) -> Result<FlowExecutionResult> {
        let flow_id = execution.definition().id().to_string();
        if execution.has_ended() {
            if execution.key().is_some() {
                self.repository.remove_flow_execution(&execution)?;
            }
            let outcome = execution
                .outcome()
                .cloned()
                .ok_or_else(|| ConvoflowError::IllegalState(format!("flow execution of '{}' ended without an outcome", flow_id)))?;
            info!("flow '{}' ended with outcome '{}'", flow_id, outcome.id);
            return Ok(FlowExecutionResult::Ended {
                flow_id,
                outcome,
            });
        }

        self.repository.put_flow_execution(&mut execution)?;
        let key = execution.key().cloned().ok_or_else(|| ConvoflowError::IllegalState(format!("flow execution of '{}' was stored without a key", flow_id)))?;
        Ok(FlowExecutionResult::Paused {
            flow_id,
            key,
            view: execution.rendered_view().map(str::to_string),
            redirect: execution.redirect_requested(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Mutex, PoisonError, mpsc},
        thread,
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        Config, ConversationIdStrategy, Event, Flow, FlowBuilder, FlowDefinitionRegistry, FlowExecutionListener, FlowSession, FnAction, LocalExternalContext, RequestContext,
        FlowExecutorBuilder, LiteralExpression, ScopeType, SetAction, State, StateBuilder, Transition, TransitionBuilder, Veto,
    };

    fn booking() -> Flow {
        FlowBuilder::new("booking")
            .state(StateBuilder::view("enterData").on("submit", "validate"))
            .state(
                StateBuilder::action("validate")
                    .action_step(FnAction::new("validate", |ctx| {
                        let guests = ctx.current_event().map(|e| e.attributes().get_i64("guests")).transpose()?.flatten().unwrap_or(0);
                        ctx.flow_scope_mut()?.put("guests", guests)?;
                        if guests > 0 { Ok(Event::success("validate")) } else { Ok(Event::error("validate")) }
                    }))
                    .on("success", "confirm")
                    .on("error", "enterData"),
            )
            .state(StateBuilder::end("confirm").output("${flowScope.guests}", "guests"))
            .build()
            .unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.conversation.id_strategy = ConversationIdStrategy::Sequential;
        config.conversation.lock_timeout_ms = 5_000;
        config
    }

    fn executor_with(
        flows: Vec<Flow>,
        listeners: Vec<Arc<dyn FlowExecutionListener>>,
        config: Config,
    ) -> FlowExecutor {
        let registry = Arc::new(FlowDefinitionRegistry::new());
        for flow in flows {
            registry.register(flow);
        }
        let mut builder = FlowExecutorBuilder::new(registry).config(config);
        for listener in listeners {
            builder = builder.listener(listener, "*");
        }
        builder.build().unwrap()
    }

    fn executor(flows: Vec<Flow>) -> FlowExecutor {
        executor_with(flows, Vec::new(), config())
    }

    fn paused_key(result: &FlowExecutionResult) -> String {
        result.key().unwrap().to_string()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(
            &self,
            event: String,
        ) {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    impl FlowExecutionListener for Recorder {
        fn request_submitted(
            &self,
            _ctx: &RequestContext<'_>,
        ) {
            self.record("request_submitted".to_string());
        }

        fn request_processed(
            &self,
            _ctx: &RequestContext<'_>,
        ) {
            self.record("request_processed".to_string());
        }

        fn session_creating(
            &self,
            _ctx: &RequestContext<'_>,
            definition: &Flow,
        ) {
            self.record(format!("session_creating:{}", definition.id()));
        }

        fn session_starting(
            &self,
            _ctx: &RequestContext<'_>,
            session: &FlowSession,
            _input: &AttributeMap,
        ) {
            self.record(format!("session_starting:{}", session.flow_id()));
        }

        fn session_started(
            &self,
            _ctx: &RequestContext<'_>,
            session: &FlowSession,
        ) {
            self.record(format!("session_started:{}", session.flow_id()));
        }

        fn event_signaled(
            &self,
            _ctx: &RequestContext<'_>,
            event: &Event,
        ) {
            self.record(format!("event_signaled:{}", event.id()));
        }

        fn transition_executing(
            &self,
            _ctx: &RequestContext<'_>,
            transition: &Transition,
        ) {
            self.record(format!("transition_executing:{}", transition.describe()));
        }

        fn state_entering(
            &self,
            _ctx: &RequestContext<'_>,
            state: &State,
        ) -> std::result::Result<(), Veto> {
            self.record(format!("state_entering:{}", state.id()));
            Ok(())
        }

        fn state_entered(
            &self,
            _ctx: &RequestContext<'_>,
            _previous: Option<&State>,
            state: &State,
        ) {
            self.record(format!("state_entered:{}", state.id()));
        }

        fn paused(
            &self,
            _ctx: &RequestContext<'_>,
        ) {
            self.record("paused".to_string());
        }

        fn resuming(
            &self,
            _ctx: &RequestContext<'_>,
        ) {
            self.record("resuming".to_string());
        }

        fn session_ending(
            &self,
            _ctx: &RequestContext<'_>,
            session: &FlowSession,
            _output: &AttributeMap,
        ) {
            self.record(format!("session_ending:{}", session.flow_id()));
        }

        fn session_ended(
            &self,
            _ctx: &RequestContext<'_>,
            session: &FlowSession,
            outcome: &FlowExecutionOutcome,
        ) {
            self.record(format!("session_ended:{}:{}", session.flow_id(), outcome.id));
        }

        fn exception_thrown(
            &self,
            _ctx: &RequestContext<'_>,
            error: &ConvoflowError,
        ) {
            self.record(format!("exception_thrown:{}", error.root_cause()));
        }
    }

    // ==== launch and resume ====

    #[test]
    fn test_booking_ends_with_confirm() {
        let executor = executor(vec![booking()]);
        let launched = executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert_eq!(
            launched,
            FlowExecutionResult::Paused {
                flow_id: "booking".to_string(),
                key: FlowExecutionKey::new("1", 1),
                view: Some("enterData".to_string()),
                redirect: false,
            }
        );

        let ended = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("submit").parameter("guests", 2)).unwrap();
        let outcome = ended.outcome().unwrap();
        assert_eq!(outcome.id, "confirm");
        assert_eq!(outcome.output.get_i64("guests").unwrap(), Some(2));

        assert!(matches!(executor.resume_execution("e1s1", &mut LocalExternalContext::new()), Err(ConvoflowError::NoSuchFlowExecution { .. })));
    }

    #[test]
    fn test_error_event_returns_to_view() {
        let executor = executor(vec![booking()]);
        executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        let result = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("submit")).unwrap();
        assert_eq!(paused_key(&result), "e1s2");
        assert!(matches!(result, FlowExecutionResult::Paused { view: Some(ref v), .. } if v == "enterData"));

        let restored = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 2)).unwrap();
        assert_eq!(restored.active_session().unwrap().scope().get_i64("guests").unwrap(), Some(0));
    }

    #[test]
    fn test_launch_unknown_flow() {
        let executor = executor(vec![booking()]);
        assert_eq!(
            executor.launch_execution("search", AttributeMap::new(), &mut LocalExternalContext::new()),
            Err(ConvoflowError::NoSuchFlowDefinition {
                flow_id: "search".to_string()
            })
        );
    }

    #[test]
    fn test_flow_ending_on_launch_is_not_stored() {
        let flow = FlowBuilder::new("ping").state(StateBuilder::end("pong")).build().unwrap();
        let executor = executor(vec![flow]);
        let result = executor.launch_execution("ping", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert!(result.is_ended());
        assert!(result.key().is_none());
        assert!(matches!(executor.resume_execution("e1s1", &mut LocalExternalContext::new()), Err(ConvoflowError::NoSuchFlowExecution { .. })));
    }

    #[test]
    fn test_start_twice_is_illegal() {
        let registry = FlowDefinitionRegistry::new();
        let mut execution = FlowExecution::new(registry.register(booking()));
        execution.start(AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert!(matches!(execution.start(AttributeMap::new(), &mut LocalExternalContext::new()), Err(ConvoflowError::IllegalState(_))));
    }

    #[test]
    fn test_unknown_event_keeps_stored_state() {
        let executor = executor(vec![booking()]);
        executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();

        let err = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("fly")).unwrap_err();
        assert_eq!(
            err,
            ConvoflowError::NoMatchingTransition {
                flow_id: "booking".to_string(),
                state_id: "enterData".to_string(),
                event_id: "fly".to_string(),
            }
        );
        let stored = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 1)).unwrap();
        assert_eq!(stored.active_session().unwrap().state_id(), Some("enterData"));
        assert!(executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 2)).is_err());
    }

    #[test]
    fn test_malformed_key() {
        let executor = executor(vec![booking()]);
        assert!(matches!(executor.resume_execution("nonsense", &mut LocalExternalContext::new()), Err(ConvoflowError::BadlyFormattedKey { .. })));
    }

    // ==== transitions ====

    #[test]
    fn test_first_matching_transition_wins() {
        let flow = FlowBuilder::new("choice")
            .state(StateBuilder::view("start").on("foo", "a").on("*", "b"))
            .state(StateBuilder::end("a"))
            .state(StateBuilder::end("b"))
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("choice", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        let result = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("foo")).unwrap();
        assert_eq!(result.outcome().unwrap().id, "a");
    }

    #[test]
    fn test_decision_and_global_transition() {
        let flow = FlowBuilder::new("route")
            .variable("vip", false)
            .state(StateBuilder::view("ask").on("go", "decide"))
            .state(StateBuilder::decision("decide").when("flowScope.vip == true", "lounge").otherwise("queue"))
            .state(StateBuilder::view("lounge"))
            .state(StateBuilder::view("queue"))
            .state(StateBuilder::end("cancelled"))
            .global_transition(TransitionBuilder::on("cancel").to("cancelled"))
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("route", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        let result = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("go")).unwrap();
        assert!(matches!(result, FlowExecutionResult::Paused { view: Some(ref v), .. } if v == "queue"));

        let result = executor.resume_execution("e1s2", &mut LocalExternalContext::with_event("cancel")).unwrap();
        assert_eq!(result.outcome().unwrap().id, "cancelled");
    }

    #[test]
    fn test_execution_criteria_rejection_renders_again() {
        let flow = FlowBuilder::new("form")
            .state(
                StateBuilder::view("edit")
                    .transition(TransitionBuilder::on("save").to("done").execution_criteria(FnAction::new("check", |_| Ok(Event::no("check"))))),
            )
            .state(StateBuilder::end("done"))
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("form", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        let result = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("save")).unwrap();
        assert!(matches!(result, FlowExecutionResult::Paused { view: Some(ref v), .. } if v == "edit"));
    }

    // ==== scopes ====

    #[test]
    fn test_flash_scope_lifetime() {
        let flow = FlowBuilder::new("notes")
            .state(
                StateBuilder::view("edit")
                    .transition(TransitionBuilder::on("save").execution_criteria(SetAction::new(
                        ScopeType::Flash,
                        "message",
                        Arc::new(LiteralExpression(json!("saved"))),
                    )))
                    .on("next", "edit"),
            )
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("notes", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();

        executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("save")).unwrap();
        let after_save = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 2)).unwrap();
        assert_eq!(after_save.flash_scope().get_string("message").unwrap().as_deref(), Some("saved"));

        executor.resume_execution("e1s2", &mut LocalExternalContext::with_event("next")).unwrap();
        let after_next = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 3)).unwrap();
        assert!(after_next.flash_scope().is_empty());
    }

    #[test]
    fn test_view_scope_lifetime() {
        let flow = FlowBuilder::new("paging")
            .state(
                StateBuilder::view("list")
                    .transition(TransitionBuilder::on("more").execution_criteria(FnAction::new("page", |ctx| {
                        let page = ctx.view_scope()?.get_i64("page")?.unwrap_or(0);
                        ctx.view_scope_mut()?.put("page", page + 1)?;
                        Ok(Event::success("page"))
                    })))
                    .on("open", "detail"),
            )
            .state(StateBuilder::action("detail").action_step(FnAction::new("load", |_| Ok(Event::success("load")))).on("success", "show"))
            .state(StateBuilder::view("show"))
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("paging", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("more")).unwrap();
        executor.resume_execution("e1s2", &mut LocalExternalContext::new()).unwrap();
        executor.resume_execution("e1s3", &mut LocalExternalContext::with_event("more")).unwrap();

        let refreshed = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 4)).unwrap();
        assert_eq!(refreshed.active_session().unwrap().view_scope().unwrap().get_i64("page").unwrap(), Some(2));

        executor.resume_execution("e1s4", &mut LocalExternalContext::with_event("open")).unwrap();
        let moved = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 5)).unwrap();
        let session = moved.active_session().unwrap();
        assert_eq!(session.state_id(), Some("show"));
        assert!(!session.view_scope().unwrap().contains_key("page"));
    }

    #[test]
    fn test_conversation_scope_shared_with_subflow() {
        let parent = FlowBuilder::new("checkout")
            .start_action(SetAction::new(ScopeType::Conversation, "cart", Arc::new(LiteralExpression(json!(["tea"])))))
            .state(StateBuilder::subflow("pay", "payment").input("flowScope.total", "amount").output("receipt", "receipt").on("paid", "finish"))
            .state(StateBuilder::end("finish").output("flowScope.receipt", "receipt"))
            .variable("total", 12)
            .build()
            .unwrap();
        let payment = FlowBuilder::new("payment")
            .state(StateBuilder::view("card").on("submit", "paid"))
            .state(StateBuilder::end("paid").output("conversationScope.cart", "receipt"))
            .build()
            .unwrap();
        let executor = executor(vec![parent, payment]);
        let launched = executor.launch_execution("checkout", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert!(matches!(launched, FlowExecutionResult::Paused { view: Some(ref v), .. } if v == "card"));

        let stored = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 1)).unwrap();
        assert_eq!(stored.active_session().unwrap().scope().get_i64("amount").unwrap(), Some(12));

        let ended = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("submit")).unwrap();
        let outcome = ended.outcome().unwrap();
        assert_eq!(outcome.id, "finish");
        assert_eq!(outcome.output.get_as::<Vec<String>>("receipt").unwrap(), Some(vec!["tea".to_string()]));
    }

    // ==== listeners ====

    #[test]
    fn test_listener_order() {
        let recorder = Arc::new(Recorder::default());
        let executor = executor_with(vec![booking()], vec![recorder.clone() as Arc<dyn FlowExecutionListener>], config());
        executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert_eq!(
            recorder.take(),
            vec![
                "request_submitted",
                "session_creating:booking",
                "session_starting:booking",
                "session_started:booking",
                "state_entering:enterData",
                "state_entered:enterData",
                "paused",
                "request_processed",
            ]
        );

        executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("submit").parameter("guests", 1)).unwrap();
        let events = recorder.take();
        assert_eq!(events.first().map(String::as_str), Some("request_submitted"));
        assert_eq!(events[1], "resuming");
        assert_eq!(events[2], "event_signaled:submit");
        assert!(events.iter().any(|e| e == "event_signaled:success"));
        let ending = events.iter().position(|e| e == "session_ending:booking").unwrap();
        assert_eq!(events[ending + 1], "session_ended:booking:confirm");
        assert_eq!(events.last().map(String::as_str), Some("request_processed"));
        assert!(!events.iter().any(|e| e == "paused"));
    }

    struct ClosedForBusiness;

    impl FlowExecutionListener for ClosedForBusiness {
        fn state_entering(
            &self,
            _ctx: &RequestContext<'_>,
            state: &State,
        ) -> std::result::Result<(), Veto> {
            if state.id() == "confirm" { Err(Veto::new("bookings are closed")) } else { Ok(()) }
        }
    }

    #[test]
    fn test_veto_rolls_back_transition() {
        let flow = FlowBuilder::new("booking")
            .state(StateBuilder::view("review").exit_action(FnAction::new("leave", |_| Err(ConvoflowError::Action("review exited".to_string())))).on("confirm", "confirm"))
            .state(StateBuilder::end("confirm"))
            .build()
            .unwrap();
        let executor = executor_with(vec![flow], vec![Arc::new(ClosedForBusiness) as Arc<dyn FlowExecutionListener>], config());
        executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();

        let err = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("confirm")).unwrap_err();
        assert_eq!(
            err,
            ConvoflowError::EnterStateVetoed {
                flow_id: "booking".to_string(),
                source_state_id: Some("review".to_string()),
                target_state_id: "confirm".to_string(),
                reason: "bookings are closed".to_string(),
            }
        );
        let stored = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 1)).unwrap();
        assert_eq!(stored.active_session().unwrap().state_id(), Some("review"));
    }

    #[test]
    fn test_session_ended_follows_failing_end_action() {
        let recorder = Arc::new(Recorder::default());
        let flow = FlowBuilder::new("cleanup")
            .state(StateBuilder::view("work").on("finish", "done"))
            .state(StateBuilder::end("done"))
            .end_action(FnAction::new("release", |_| Err(ConvoflowError::Action("release failed".to_string()))))
            .build()
            .unwrap();
        let executor = executor_with(vec![flow], vec![recorder.clone() as Arc<dyn FlowExecutionListener>], config());
        executor.launch_execution("cleanup", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        recorder.take();

        let err = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("finish")).unwrap_err();
        assert!(matches!(&err, ConvoflowError::FlowExecution { flow_id, .. } if flow_id == "cleanup"));
        assert_eq!(err.root_cause(), &ConvoflowError::Action("release failed".to_string()));

        let events = recorder.take();
        let ending = events.iter().position(|e| e == "session_ending:cleanup").unwrap();
        assert_eq!(events[ending + 1], "session_ended:cleanup:done");
        assert!(events.contains(&"exception_thrown:release failed".to_string()));
    }

    #[test]
    fn test_action_error_is_wrapped_with_state() {
        let flow = FlowBuilder::new("import")
            .state(StateBuilder::view("upload").on("go", "parse"))
            .state(StateBuilder::action("parse").action_step(FnAction::new("parse", |_| Err(ConvoflowError::Action("bad file".to_string())))).on("success", "upload"))
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("import", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        let err = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("go")).unwrap_err();
        assert_eq!(
            err,
            ConvoflowError::FlowExecution {
                flow_id: "import".to_string(),
                state_id: Some("parse".to_string()),
                source: Box::new(ConvoflowError::Action("bad file".to_string())),
            }
        );
    }

    // ==== redirects and locking ====

    #[test]
    fn test_refresh_after_redirect_renders_view() {
        let mut redirecting = config();
        redirecting.execution.always_redirect_on_pause = true;
        let executor = executor_with(vec![booking()], Vec::new(), redirecting);

        let mut external = LocalExternalContext::new();
        let result = executor.launch_execution("booking", AttributeMap::new(), &mut external).unwrap();
        assert!(matches!(result, FlowExecutionResult::Paused { view: None, redirect: true, .. }));
        assert!(external.flow_execution_redirect_requested());

        let mut refresh = LocalExternalContext::new();
        let refreshed = executor.resume_execution("e1s1", &mut refresh).unwrap();
        assert_eq!(
            refreshed,
            FlowExecutionResult::Paused {
                flow_id: "booking".to_string(),
                key: FlowExecutionKey::new("1", 2),
                view: Some("enterData".to_string()),
                redirect: false,
            }
        );
        assert!(!refresh.flow_execution_redirect_requested());

        let invalid = executor.resume_execution("e1s2", &mut LocalExternalContext::with_event("submit")).unwrap();
        assert!(matches!(invalid, FlowExecutionResult::Paused { view: None, redirect: true, .. }));
    }

    #[test]
    fn test_flash_survives_redirect_until_rendered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let flow = FlowBuilder::new("notes")
            .state(
                StateBuilder::view("edit")
                    .redirect()
                    .render_action({
                        let seen = seen.clone();
                        FnAction::new("show", move |ctx| {
                            let message = ctx.flash_scope().get_string("message")?;
                            seen.lock().unwrap_or_else(PoisonError::into_inner).push(message);
                            Ok(Event::success("show"))
                        })
                    })
                    .transition(TransitionBuilder::on("save").execution_criteria(SetAction::new(
                        ScopeType::Flash,
                        "message",
                        Arc::new(LiteralExpression(json!("saved"))),
                    ))),
            )
            .build()
            .unwrap();
        let executor = executor(vec![flow]);

        let launched = executor.launch_execution("notes", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert!(matches!(launched, FlowExecutionResult::Paused { view: None, redirect: true, .. }));
        let saved = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("save")).unwrap();
        assert!(matches!(saved, FlowExecutionResult::Paused { view: None, redirect: true, .. }));
        assert!(seen.lock().unwrap().is_empty());

        let rendered = executor.resume_execution("e1s2", &mut LocalExternalContext::new()).unwrap();
        assert!(matches!(rendered, FlowExecutionResult::Paused { view: Some(ref v), redirect: false, .. } if v == "edit"));
        let stored = executor.repository().get_flow_execution(&FlowExecutionKey::new("1", 3)).unwrap();
        assert_eq!(stored.flash_scope().get_string("message").unwrap().as_deref(), Some("saved"));

        executor.resume_execution("e1s3", &mut LocalExternalContext::new()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some("saved".to_string()), None]);
    }

    #[test]
    fn test_completed_response_skips_render() {
        let renders = Arc::new(Mutex::new(0));
        let flow = FlowBuilder::new("export")
            .state(
                StateBuilder::view("choose")
                    .render_action({
                        let renders = renders.clone();
                        FnAction::new("count", move |_| {
                            *renders.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                            Ok(Event::success("count"))
                        })
                    })
                    .transition(TransitionBuilder::on("download").execution_criteria(FnAction::new("stream", |ctx| {
                        ctx.external_context_mut().record_response_complete();
                        Ok(Event::success("stream"))
                    }))),
            )
            .build()
            .unwrap();
        let executor = executor(vec![flow]);
        executor.launch_execution("export", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();
        assert_eq!(*renders.lock().unwrap(), 1);

        let mut external = LocalExternalContext::with_event("download");
        let result = executor.resume_execution("e1s1", &mut external).unwrap();
        assert!(matches!(result, FlowExecutionResult::Paused { view: None, redirect: false, .. }));
        assert!(external.is_response_complete());
        assert_eq!(*renders.lock().unwrap(), 1);

        let refreshed = executor.resume_execution("e1s2", &mut LocalExternalContext::new()).unwrap();
        assert!(matches!(refreshed, FlowExecutionResult::Paused { view: Some(ref v), .. } if v == "choose"));
        assert_eq!(*renders.lock().unwrap(), 2);
    }

    #[test]
    fn test_resume_waits_for_conversation_lock() {
        let executor = Arc::new(executor(vec![booking()]));
        executor.launch_execution("booking", AttributeMap::new(), &mut LocalExternalContext::new()).unwrap();

        let key = FlowExecutionKey::new("1", 1);
        let guard = LockGuard::acquire(executor.repository().get_lock(&key).unwrap()).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let executor = executor.clone();
            thread::spawn(move || {
                let result = executor.resume_execution("e1s1", &mut LocalExternalContext::with_event("submit").parameter("guests", 3));
                tx.send(result).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(executor.repository().get_flow_execution(&key).is_ok());
        drop(guard);

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(result.outcome().unwrap().id, "confirm");
        worker.join().unwrap();
    }
}
