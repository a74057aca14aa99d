use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::{
    AttributeMap, AttributeValue, Conversation, ConversationManager, ConversationParameters, ConvoflowError, FlowExecution, FlowExecutionKey, FlowExecutionLock,
    FlowExecutionSnapshotFactory, HistoryPolicy, KEY_FORMAT, LockGuard, ObjectRef, Result, SnapshotGroup, repository::snapshot::check_serializable,
};

/// Conversation attribute holding the snapshot group.
pub const SNAPSHOT_GROUP_ATTRIBUTE: &str = "flowExecutionSnapshotGroup";
/// Conversation attribute holding conversation scope.
pub const CONVERSATION_SCOPE_ATTRIBUTE: &str = "scope";

/// Stores, restores and locks flow executions.
pub trait FlowExecutionRepository: Send + Sync {
    /// Pure parse of an encoded key.
    fn parse_flow_execution_key(
        &self,
        encoded: &str,
    ) -> Result<FlowExecutionKey>;

    /// Lock on the conversation owning `key`.
    fn get_lock(
        &self,
        key: &FlowExecutionKey,
    ) -> Result<Arc<dyn FlowExecutionLock>>;

    fn get_flow_execution(
        &self,
        key: &FlowExecutionKey,
    ) -> Result<FlowExecution>;

    /// Stores a snapshot of `execution` and assigns its next key.
    fn put_flow_execution(
        &self,
        execution: &mut FlowExecution,
    ) -> Result<()>;

    /// Ends the conversation of `execution` with all of its snapshots.
    fn remove_flow_execution(
        &self,
        execution: &FlowExecution,
    ) -> Result<()>;
}

/// Lock that delegates to the conversation.
pub struct ConversationBackedLock {
    conversation: Arc<dyn Conversation>,
}

impl ConversationBackedLock {
    pub fn new(conversation: Arc<dyn Conversation>) -> Self {
        Self {
            conversation,
        }
    }
}

impl FlowExecutionLock for ConversationBackedLock {
    fn lock(&self) -> Result<()> {
        self.conversation.lock()
    }

    fn unlock(&self) {
        self.conversation.unlock()
    }
}

/// Keeps a bounded group of serialized snapshots per conversation.
pub struct DefaultFlowExecutionRepository {
    conversation_manager: Arc<dyn ConversationManager>,
    snapshot_factory: Arc<dyn FlowExecutionSnapshotFactory>,
    max_snapshots: usize,
    always_generate_new_next_key: bool,
}

impl DefaultFlowExecutionRepository {
    pub fn new(
        conversation_manager: Arc<dyn ConversationManager>,
        snapshot_factory: Arc<dyn FlowExecutionSnapshotFactory>,
    ) -> Self {
        Self {
            conversation_manager,
            snapshot_factory,
            max_snapshots: 30,
            always_generate_new_next_key: true,
        }
    }

    /// 0 keeps every snapshot.
    pub fn max_snapshots(
        mut self,
        max: usize,
    ) -> Self {
        self.max_snapshots = max;
        self
    }

    /// `true` mints a new snapshot id on every put, so older keys keep
    /// resolving to older states; `false` keeps one key for the execution's life.
    pub fn always_generate_new_next_key(
        mut self,
        always: bool,
    ) -> Self {
        self.always_generate_new_next_key = always;
        self
    }

    pub fn conversation_manager(&self) -> &Arc<dyn ConversationManager> {
        &self.conversation_manager
    }

    fn conversation(
        &self,
        key: &FlowExecutionKey,
    ) -> Result<Arc<dyn Conversation>> {
        self.conversation_manager.get_conversation(key.conversation_id()).map_err(|e| match e {
            ConvoflowError::NoSuchConversation { .. } => ConvoflowError::NoSuchFlowExecution {
                key: key.to_string(),
                reason: e.to_string(),
            },
            other => other,
        })
    }

    fn snapshot_group(
        &self,
        conversation: &dyn Conversation,
    ) -> Option<Arc<Mutex<SnapshotGroup>>> {
        match conversation.attribute(SNAPSHOT_GROUP_ATTRIBUTE) {
            Some(AttributeValue::Object(group)) => group.downcast::<Mutex<SnapshotGroup>>(),
            _ => None,
        }
    }

    fn conversation_scope(
        &self,
        conversation: &dyn Conversation,
    ) -> AttributeMap {
        match conversation.attribute(CONVERSATION_SCOPE_ATTRIBUTE) {
            Some(AttributeValue::Object(scope)) => scope.downcast::<AttributeMap>().map(|s| (*s).clone()).unwrap_or_default(),
            _ => AttributeMap::new(),
        }
    }
}

impl FlowExecutionRepository for DefaultFlowExecutionRepository {
    fn parse_flow_execution_key(
        &self,
        encoded: &str,
    ) -> Result<FlowExecutionKey> {
        let key = FlowExecutionKey::parse(encoded)?;
        self.conversation_manager.parse_conversation_id(key.conversation_id()).map_err(|_| ConvoflowError::BadlyFormattedKey {
            key: encoded.to_string(),
            format: KEY_FORMAT.to_string(),
        })?;
        Ok(key)
    }

    fn get_lock(
        &self,
        key: &FlowExecutionKey,
    ) -> Result<Arc<dyn FlowExecutionLock>> {
        Ok(Arc::new(ConversationBackedLock::new(self.conversation(key)?)))
    }

    fn get_flow_execution(
        &self,
        key: &FlowExecutionKey,
    ) -> Result<FlowExecution> {
        trace!("getting flow execution '{}'", key);
        let conversation = self.conversation(key)?;
        let not_found = |reason: &str| ConvoflowError::NoSuchFlowExecution {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let group = self.snapshot_group(conversation.as_ref()).ok_or_else(|| not_found("the conversation holds no snapshots"))?;
        let snapshot = group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.snapshot_id())
            .cloned()
            .ok_or_else(|| not_found("the snapshot no longer exists"))?;

        self.snapshot_factory
            .restore_execution(&snapshot, key.clone(), self.conversation_scope(conversation.as_ref()))
            .map_err(|e| ConvoflowError::FlowExecutionRestorationFailure {
                key: key.to_string(),
                source: Box::new(e),
            })
    }

    fn put_flow_execution(
        &self,
        execution: &mut FlowExecution,
    ) -> Result<()> {
        if !execution.is_active() {
            return Err(ConvoflowError::IllegalState(format!("cannot put flow execution of '{}': it is {}", execution.definition().id(), execution.status())));
        }
        check_serializable(execution.conversation_scope(), "conversation", execution.definition().id())?;
        let snapshot = self.snapshot_factory.create_snapshot(execution)?;

        let conversation = match execution.key() {
            Some(key) => self.conversation(key)?,
            None => self.conversation_manager.begin_conversation(ConversationParameters::new(execution.definition().id()))?,
        };
        let _guard = LockGuard::acquire(Arc::new(ConversationBackedLock::new(conversation.clone())))?;

        let group = match self.snapshot_group(conversation.as_ref()) {
            Some(group) => group,
            None => {
                let group = Arc::new(Mutex::new(SnapshotGroup::new(self.max_snapshots)));
                conversation.put_attribute(SNAPSHOT_GROUP_ATTRIBUTE, AttributeValue::Object(ObjectRef::from_arc(group.clone())))?;
                group
            }
        };

        let key = {
            let mut group = group.lock().unwrap_or_else(PoisonError::into_inner);
            match execution.take_history_policy() {
                HistoryPolicy::Preserve => {}
                HistoryPolicy::Discard => {
                    if let Some(previous) = execution.key() {
                        group.remove(previous.snapshot_id());
                    }
                }
                HistoryPolicy::Invalidate => group.remove_all(),
            }
            let key = match execution.key() {
                None => FlowExecutionKey::new(conversation.id(), group.next_snapshot_id()),
                Some(previous) if self.always_generate_new_next_key => FlowExecutionKey::new(previous.conversation_id(), group.next_snapshot_id()),
                Some(previous) => previous.clone(),
            };
            group.add(key.snapshot_id(), snapshot);
            key
        };
        conversation.put_attribute(CONVERSATION_SCOPE_ATTRIBUTE, AttributeValue::object(execution.conversation_scope().clone()))?;

        debug!("put flow execution of '{}' under key '{}'", execution.definition().id(), key);
        execution.set_key(key);
        Ok(())
    }

    fn remove_flow_execution(
        &self,
        execution: &FlowExecution,
    ) -> Result<()> {
        let Some(key) = execution.key() else {
            return Err(ConvoflowError::IllegalState(format!(
                "cannot remove flow execution of '{}': it has never been put and has no key",
                execution.definition().id()
            )));
        };
        let conversation = self.conversation(key)?;
        let _guard = LockGuard::acquire(Arc::new(ConversationBackedLock::new(conversation.clone())))?;
        debug!("removing flow execution '{}'", key);
        conversation.end();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        ConversationIdStrategy, Flow, FlowBuilder, FlowDefinitionLocator, FlowDefinitionRegistry, FlowExecutionFactory, FlowSessionStatus, InMemoryConversationManager,
        LocalExternalContext, SerializedFlowExecutionSnapshotFactory, StateBuilder, TransitionBuilder,
    };

    fn booking() -> Flow {
        FlowBuilder::new("booking")
            .state(StateBuilder::view("enterData").on("next", "review"))
            .state(
                StateBuilder::view("review")
                    .transition(TransitionBuilder::on("back").to("enterData").history(HistoryPolicy::Discard))
                    .transition(TransitionBuilder::on("reset").to("enterData").history(HistoryPolicy::Invalidate))
                    .on("confirm", "done"),
            )
            .state(StateBuilder::end("done"))
            .build()
            .unwrap()
    }

    fn checkout() -> Flow {
        FlowBuilder::new("checkout").state(StateBuilder::subflow("pay", "payment").on("paid", "finish")).state(StateBuilder::end("finish")).build().unwrap()
    }

    fn payment() -> Flow {
        FlowBuilder::new("payment").state(StateBuilder::view("card").on("submit", "paid")).state(StateBuilder::end("paid")).build().unwrap()
    }

    struct Fixture {
        registry: Arc<FlowDefinitionRegistry>,
        manager: Arc<InMemoryConversationManager>,
        factory: Arc<FlowExecutionFactory>,
        repository: DefaultFlowExecutionRepository,
    }

    impl Fixture {
        fn new(always_generate_new_next_key: bool) -> Self {
            let registry = Arc::new(FlowDefinitionRegistry::new());
            registry.register(booking());
            registry.register(checkout());
            registry.register(payment());
            let manager = Arc::new(InMemoryConversationManager::new(100, None, Duration::from_secs(1), ConversationIdStrategy::Sequential));
            let factory = Arc::new(FlowExecutionFactory::new(registry.clone()));
            let repository = DefaultFlowExecutionRepository::new(manager.clone(), Arc::new(SerializedFlowExecutionSnapshotFactory::new(factory.clone(), true)))
                .always_generate_new_next_key(always_generate_new_next_key);
            Self {
                registry,
                manager,
                factory,
                repository,
            }
        }

        fn start(
            &self,
            flow_id: &str,
        ) -> FlowExecution {
            let mut execution = self.factory.create_flow_execution(self.registry.get_flow_definition(flow_id).unwrap());
            execution.start(AttributeMap::new().with("hotel", 7), &mut LocalExternalContext::new()).unwrap();
            execution
        }

        fn signal(
            &self,
            execution: &mut FlowExecution,
            event_id: &str,
        ) {
            execution.resume(&mut LocalExternalContext::with_event(event_id)).unwrap();
            self.repository.put_flow_execution(execution).unwrap();
        }

        fn state_of(
            &self,
            key: &str,
        ) -> Result<String> {
            let execution = self.repository.get_flow_execution(&self.repository.parse_flow_execution_key(key)?)?;
            Ok(execution.active_session()?.state_id().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn test_put_then_get_restores_execution() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        execution.conversation_scope_mut().put("user", "ann").unwrap();
        execution.flash_scope_mut().put("message", "welcome").unwrap();
        execution.active_session_mut().unwrap().view_scope_mut().unwrap().put("page", 2).unwrap();

        fixture.repository.put_flow_execution(&mut execution).unwrap();
        let key = execution.key().unwrap().clone();
        assert_eq!(key.to_string(), "e1s1");

        let restored = fixture.repository.get_flow_execution(&key).unwrap();
        assert!(restored.is_active());
        assert_eq!(restored.key(), Some(&key));
        assert_eq!(restored.flash_scope(), execution.flash_scope());
        assert_eq!(restored.conversation_scope().get_string("user").unwrap().as_deref(), Some("ann"));

        let session = restored.active_session().unwrap();
        assert_eq!(session.state_id(), Some("enterData"));
        assert_eq!(session.status(), FlowSessionStatus::Paused);
        assert_eq!(session.scope().get_i64("hotel").unwrap(), Some(7));
        assert_eq!(session.view_scope().unwrap().get_i64("page").unwrap(), Some(2));
    }

    #[test]
    fn test_new_key_per_put_keeps_older_snapshots() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        fixture.repository.put_flow_execution(&mut execution).unwrap();
        fixture.signal(&mut execution, "next");

        assert_eq!(execution.key().unwrap().to_string(), "e1s2");
        assert_eq!(fixture.state_of("e1s1").unwrap(), "enterData");
        assert_eq!(fixture.state_of("e1s2").unwrap(), "review");
    }

    #[test]
    fn test_reused_key_points_at_latest_snapshot() {
        let fixture = Fixture::new(false);
        let mut execution = fixture.start("booking");
        fixture.repository.put_flow_execution(&mut execution).unwrap();
        fixture.signal(&mut execution, "next");

        assert_eq!(execution.key().unwrap().to_string(), "e1s1");
        assert_eq!(fixture.state_of("e1s1").unwrap(), "review");
    }

    #[test]
    fn test_history_discard_and_invalidate() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        fixture.repository.put_flow_execution(&mut execution).unwrap();
        fixture.signal(&mut execution, "next");
        fixture.signal(&mut execution, "back");

        assert_eq!(execution.key().unwrap().to_string(), "e1s3");
        assert!(fixture.state_of("e1s1").is_ok());
        assert!(matches!(fixture.state_of("e1s2"), Err(ConvoflowError::NoSuchFlowExecution { .. })));

        fixture.signal(&mut execution, "next");
        fixture.signal(&mut execution, "reset");
        assert_eq!(execution.key().unwrap().to_string(), "e1s5");
        for stale in ["e1s1", "e1s3", "e1s4"] {
            assert!(matches!(fixture.state_of(stale), Err(ConvoflowError::NoSuchFlowExecution { .. })));
        }
        assert_eq!(fixture.state_of("e1s5").unwrap(), "enterData");
    }

    #[test]
    fn test_subflow_sessions_restore_their_own_definitions() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("checkout");
        fixture.repository.put_flow_execution(&mut execution).unwrap();

        let restored = fixture.repository.get_flow_execution(execution.key().unwrap()).unwrap();
        let sessions = restored.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].status(), FlowSessionStatus::Suspended);
        assert_eq!(sessions[0].state_id(), Some("pay"));
        assert!(Arc::ptr_eq(sessions[1].definition(), &fixture.registry.get_flow_definition("payment").unwrap()));
        assert_eq!(sessions[1].state_id(), Some("card"));
    }

    #[test]
    fn test_missing_snapshot_and_conversation() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        fixture.repository.put_flow_execution(&mut execution).unwrap();

        assert!(matches!(fixture.state_of("e1s9"), Err(ConvoflowError::NoSuchFlowExecution { .. })));
        assert!(matches!(fixture.state_of("e42s1"), Err(ConvoflowError::NoSuchFlowExecution { .. })));
    }

    #[test]
    fn test_restoration_failure_wraps_cause() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        fixture.repository.put_flow_execution(&mut execution).unwrap();
        fixture.registry.unregister("booking");

        let err = fixture.repository.get_flow_execution(execution.key().unwrap()).unwrap_err();
        assert!(matches!(err, ConvoflowError::FlowExecutionRestorationFailure { .. }));
        assert!(matches!(err.root_cause(), ConvoflowError::NoSuchFlowDefinition { flow_id } if flow_id == "booking"));
    }

    #[test]
    fn test_remove_ends_conversation() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        assert!(matches!(fixture.repository.remove_flow_execution(&execution), Err(ConvoflowError::IllegalState(_))));

        fixture.repository.put_flow_execution(&mut execution).unwrap();
        assert_eq!(fixture.manager.conversation_count(), 1);
        fixture.repository.remove_flow_execution(&execution).unwrap();

        assert_eq!(fixture.manager.conversation_count(), 0);
        assert!(matches!(fixture.state_of("e1s1"), Err(ConvoflowError::NoSuchFlowExecution { .. })));
    }

    #[test]
    fn test_conversation_holds_scope_and_group() {
        let fixture = Fixture::new(true);
        let mut execution = fixture.start("booking");
        execution.conversation_scope_mut().put("cart", vec![1, 2]).unwrap();
        fixture.repository.put_flow_execution(&mut execution).unwrap();

        let conversation = fixture.manager.get_conversation("1").unwrap();
        assert_eq!(conversation.parameters().name, "booking");
        let scope = match conversation.attribute(CONVERSATION_SCOPE_ATTRIBUTE) {
            Some(AttributeValue::Object(scope)) => scope.downcast::<AttributeMap>().unwrap(),
            other => panic!("unexpected attribute: {:?}", other),
        };
        assert_eq!(scope.get_as::<Vec<i32>>("cart").unwrap(), Some(vec![1, 2]));
        assert!(matches!(conversation.attribute(SNAPSHOT_GROUP_ATTRIBUTE), Some(AttributeValue::Object(_))));
    }

    #[test]
    fn test_put_rejects_inactive_and_live_objects() {
        let fixture = Fixture::new(true);
        let mut not_started = fixture.factory.create_flow_execution(fixture.registry.get_flow_definition("booking").unwrap());
        assert!(matches!(fixture.repository.put_flow_execution(&mut not_started), Err(ConvoflowError::IllegalState(_))));

        let mut execution = fixture.start("booking");
        execution.conversation_scope_mut().put_object("socket", Mutex::new(1)).unwrap();
        assert!(matches!(fixture.repository.put_flow_execution(&mut execution), Err(ConvoflowError::SnapshotCreation { .. })));
        assert_eq!(fixture.manager.conversation_count(), 0);
        assert!(execution.key().is_none());
    }

    #[test]
    fn test_parse_validates_conversation_id() {
        let fixture = Fixture::new(true);
        assert_eq!(fixture.repository.parse_flow_execution_key("e3s4").unwrap(), FlowExecutionKey::new("3", 4));
        assert!(matches!(fixture.repository.parse_flow_execution_key("eabcs1"), Err(ConvoflowError::BadlyFormattedKey { .. })));
        assert!(matches!(fixture.repository.parse_flow_execution_key("3s4"), Err(ConvoflowError::BadlyFormattedKey { .. })));
    }
}
