//! Process-wide shared services.

use std::sync::Arc;

use mx_domain::config::Config;
use mx_domain::error::Result;
use mx_events::{metrics::spawn_collector, EventBus, MetricsCollector};
use mx_history::StorageManager;
use mx_mcp_client::McpManager;
use mx_memory::{
    DefaultKnowledgeTool, Embedder, EmbeddingManager, ExtractReasoningStepsTool, KnowledgeCore,
    KnowledgePipeline, ReflectionPipeline, StoreReasoningMemoryTool, VectorStore,
    WorkspaceMemoryTool,
};
use mx_tools::UnifiedToolManager;

use crate::registry::SessionRegistry;

/// Everything sessions share by reference. Sessions never mutate the
/// internals of these managers, they only invoke methods.
pub struct SharedServices {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsCollector>,
    pub tools: Arc<UnifiedToolManager>,
    pub embeddings: Arc<EmbeddingManager>,
    pub vector_store: Arc<dyn VectorStore>,
    pub knowledge: Arc<KnowledgePipeline>,
    pub reflection: Arc<ReflectionPipeline>,
    pub registry: Arc<SessionRegistry>,
    /// Storage injected at construction is *borrowed* by every session;
    /// absent, each session builds its own exclusively.
    pub shared_storage: Option<Arc<StorageManager>>,

    // Cores the sessions bind their decision LLM into once it exists.
    knowledge_core: Arc<KnowledgeCore>,
    workspace_core: Arc<KnowledgeCore>,
}

impl SharedServices {
    /// Wire the process-wide managers: bus, metrics, remote tool
    /// servers, the unified tool manager with the internal memory and
    /// reflection tools, and both memory pipelines.
    pub async fn initialize(
        mut config: Config,
        embedder: Option<Arc<dyn Embedder>>,
        vector_store: Arc<dyn VectorStore>,
        shared_storage: Option<Arc<StorageManager>>,
    ) -> Result<Arc<Self>> {
        config.apply_env();

        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsCollector::new());
        spawn_collector(&bus, metrics.clone());

        let remote = Arc::new(McpManager::from_config(&config.mcp).await);
        let tools = Arc::new(UnifiedToolManager::new(
            remote,
            config.tools.clone(),
            bus.clone(),
        ));

        let embeddings = Arc::new(EmbeddingManager::new(embedder, &config.memory));

        let knowledge_core = Arc::new(KnowledgeCore::new(
            embeddings.clone(),
            vector_store.clone(),
            bus.clone(),
            config.memory.knowledge_collection.clone(),
        ));
        let workspace_core = Arc::new(KnowledgeCore::new(
            embeddings.clone(),
            vector_store.clone(),
            bus.clone(),
            format!("{}_workspace", config.memory.knowledge_collection),
        ));
        tools.register(Arc::new(DefaultKnowledgeTool::new(knowledge_core.clone())));
        tools.register(Arc::new(WorkspaceMemoryTool::new(workspace_core.clone())));
        tools.register(Arc::new(ExtractReasoningStepsTool));
        tools.register(Arc::new(StoreReasoningMemoryTool::new(
            embeddings.clone(),
            vector_store.clone(),
            config.memory.reflection_collection.clone(),
        )));

        let knowledge = Arc::new(KnowledgePipeline::new(
            tools.clone(),
            embeddings.clone(),
            bus.clone(),
            config.memory.clone(),
        ));
        let reflection = Arc::new(ReflectionPipeline::new(
            tools.clone(),
            embeddings.clone(),
            bus.clone(),
            config.memory.clone(),
        ));

        let registry = Arc::new(SessionRegistry::new(&config.storage.sqlite_path)?);

        Ok(Arc::new(Self {
            config,
            bus,
            metrics,
            tools,
            embeddings,
            vector_store,
            knowledge,
            reflection,
            registry,
            shared_storage,
            knowledge_core,
            workspace_core,
        }))
    }

    /// Bind the decision LLM and reasoning evaluator once a session has
    /// built its LLM services. Later sessions replace earlier bindings.
    pub async fn bind_llm(
        &self,
        decision: Arc<dyn mx_providers::TextCompletion>,
        evaluator: Arc<dyn mx_providers::TextCompletion>,
    ) {
        self.knowledge_core
            .set_decision_llm(Some(decision.clone()))
            .await;
        self.workspace_core.set_decision_llm(Some(decision)).await;
        self.reflection.set_evaluator(Some(evaluator)).await;
    }
}
