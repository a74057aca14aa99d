use std::sync::Arc;

use crate::{
    ConditionalListenerLoader, Config, ConversationManager, DefaultFlowExecutionRepository, FlowDefinitionLocator, FlowExecutionFactory, FlowExecutionListener, FlowExecutor,
    InMemoryConversationManager, Result, SerializedFlowExecutionSnapshotFactory,
};

/// Wires a [`FlowExecutor`] from a definition locator and a [`Config`].
pub struct FlowExecutorBuilder {
    locator: Arc<dyn FlowDefinitionLocator>,
    config: Config,
    listeners: Vec<(Arc<dyn FlowExecutionListener>, String)>,
    conversation_manager: Option<Arc<dyn ConversationManager>>,
}

impl FlowExecutorBuilder {
    pub fn new(locator: Arc<dyn FlowDefinitionLocator>) -> Self {
        Self {
            locator,
            config: Config::default(),
            listeners: Vec::new(),
            conversation_manager: None,
        }
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = config;
        self
    }

    /// Attaches `listener` to flows whose id matches the comma separated globs in `criteria`.
    pub fn listener(
        mut self,
        listener: Arc<dyn FlowExecutionListener>,
        criteria: &str,
    ) -> Self {
        self.listeners.push((listener, criteria.to_string()));
        self
    }

    /// Replaces the in-memory conversation manager built from the config.
    pub fn conversation_manager(
        mut self,
        manager: Arc<dyn ConversationManager>,
    ) -> Self {
        self.conversation_manager = Some(manager);
        self
    }

    pub fn build(self) -> Result<FlowExecutor> {
        let mut loader = ConditionalListenerLoader::new();
        for (listener, criteria) in self.listeners {
            loader.add_listener(listener, &criteria)?;
        }

        let conversation = &self.config.conversation;
        let conversation_manager: Arc<dyn ConversationManager> = match self.conversation_manager {
            Some(manager) => manager,
            None => Arc::new(InMemoryConversationManager::new(
                conversation.max_conversations,
                conversation.idle_timeout(),
                conversation.lock_timeout(),
                conversation.id_strategy,
            )),
        };

        let execution_factory = Arc::new(
            FlowExecutionFactory::new(self.locator.clone()).listener_loader(Arc::new(loader)).always_redirect_on_pause(self.config.execution.always_redirect_on_pause),
        );
        let snapshot_factory = Arc::new(SerializedFlowExecutionSnapshotFactory::new(execution_factory.clone(), self.config.repository.compress_snapshots));
        let repository = DefaultFlowExecutionRepository::new(conversation_manager, snapshot_factory)
            .max_snapshots(self.config.repository.max_snapshots)
            .always_generate_new_next_key(self.config.repository.always_generate_new_next_key);

        Ok(FlowExecutor::new(self.locator, execution_factory, Arc::new(repository)))
    }
}
