//! The session: per-conversation lifecycle and turn orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use mx_context::{formatter_for, ContextManager};
use mx_domain::config::{environment_tag, LlmConfig};
use mx_domain::error::{Error, Result};
use mx_domain::message::Message;
use mx_domain::record::{HistoryRecord, RecordMetadata, RECORD_VERSION};
use mx_domain::trace::TraceEvent;
use mx_events::topics;
use mx_history::{
    DatabaseProvider, HistoryProvider, InMemoryProvider, MultiBackendProvider, StorageManager,
};
use mx_memory::{PipelineInput, RunOverrides, TurnRecord};
use mx_providers::{backend_for, ChatBackend, LlmService, TextCompletion};

use crate::services::SharedServices;

/// Cooperative backoff before the first exclusive storage construction,
/// spreading out sessions racing to build identical connections.
const STORAGE_BACKOFF: Duration = Duration::from_millis(25);

/// Messages handed to the memory pipelines as conversational context.
const RECENT_WINDOW: usize = 10;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options and outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who tears the storage connection down at disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOwnership {
    /// The session built the connection and closes it.
    Exclusive,
    /// The connection was injected; the session never closes it.
    Borrowed,
}

pub struct SessionOptions {
    /// Session id; a fresh UUID when absent.
    pub id: Option<String>,
    pub llm: LlmConfig,
    pub system_prompt: Option<String>,
    /// Metadata defaults merged into every memory-pipeline run.
    pub session_memory_metadata: Option<Value>,
    /// Injection seam for a pre-built wire adapter (tests, custom
    /// providers). `None` builds one from the LLM config.
    pub backend_override: Option<Arc<dyn ChatBackend>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            id: None,
            llm: LlmConfig::default(),
            system_prompt: None,
            session_memory_metadata: None,
            backend_override: None,
        }
    }
}

#[derive(Default)]
pub struct RunOptions {
    /// Per-run memory-pipeline overrides.
    pub overrides: Option<RunOverrides>,
}

/// What one turn hands back: the response, immediately, and a handle on
/// the background memory job. Await the handle before shutdown, or drop
/// it for fire-and-forget.
pub struct TurnOutput {
    pub response: String,
    pub background: JoinHandle<()>,
}

impl std::fmt::Debug for TurnOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOutput")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Session {
    id: String,
    services: Arc<SharedServices>,
    options: SessionOptions,
    created_at: DateTime<Utc>,
    memory_metadata: RwLock<Option<Value>>,

    // Lazy guards. Initialization errors never latch a guard, so a
    // failed first call is retried by the next one.
    context: OnceCell<Arc<ContextManager>>,
    llm: OnceCell<Arc<LlmService>>,
    storage: OnceCell<(Arc<StorageManager>, StorageOwnership)>,
    history: OnceCell<Option<Arc<dyn HistoryProvider>>>,
    restored: OnceCell<()>,

    /// At most one foreground `run` per session.
    turn_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(services: Arc<SharedServices>, options: SessionOptions) -> Self {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let memory_metadata = options.session_memory_metadata.clone();
        Self {
            id,
            services,
            options,
            created_at: Utc::now(),
            memory_metadata: RwLock::new(memory_metadata),
            context: OnceCell::new(),
            llm: OnceCell::new(),
            storage: OnceCell::new(),
            history: OnceCell::new(),
            restored: OnceCell::new(),
            turn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The transcript as currently held by the context manager.
    pub fn history(&self) -> Vec<Message> {
        self.context
            .get()
            .map(|ctx| ctx.raw_messages())
            .unwrap_or_default()
    }

    fn context(&self) -> Result<Arc<ContextManager>> {
        self.context
            .get()
            .cloned()
            .ok_or_else(|| Error::NotInitialized(self.id.clone()))
    }

    // ── init ──────────────────────────────────────────────────────

    /// Set up the context manager with the provider's formatter and, if
    /// shared storage was injected, bind a history provider right away.
    /// Idempotent.
    pub async fn init(&self) -> Result<()> {
        self.context
            .get_or_try_init(|| async {
                let formatter = formatter_for(&self.options.llm.provider)?;
                let ctx = Arc::new(ContextManager::new(
                    self.id.clone(),
                    formatter,
                    self.options
                        .system_prompt
                        .clone()
                        .or_else(|| self.services.config.system_prompt.clone()),
                ));

                let mut backend_name = "none".to_owned();
                if self.services.shared_storage.is_some() {
                    if let Some(provider) = self.history_provider_lazy().await? {
                        backend_name = provider.backend_name().to_owned();
                        ctx.bind_provider(Some(provider));
                    }
                }

                self.services.registry.register(&self.id, &backend_name);
                self.services.bus.emit_session(
                    &self.id,
                    topics::SESSION_CREATED,
                    json!({ "provider": self.options.llm.provider }),
                );
                TraceEvent::SessionInitialized {
                    session_id: self.id.clone(),
                    provider: self.options.llm.provider.clone(),
                    history_backend: backend_name,
                }
                .emit();
                Ok::<_, Error>(ctx)
            })
            .await
            .map(|_| ())
    }

    // ── lazy wiring ───────────────────────────────────────────────

    async fn storage_lazy(&self) -> Result<&(Arc<StorageManager>, StorageOwnership)> {
        self.storage
            .get_or_try_init(|| async {
                if let Some(shared) = &self.services.shared_storage {
                    return Ok((shared.clone(), StorageOwnership::Borrowed));
                }
                tokio::time::sleep(STORAGE_BACKOFF).await;
                let manager = StorageManager::connect(&self.services.config.storage).await?;
                Ok((Arc::new(manager), StorageOwnership::Exclusive))
            })
            .await
    }

    /// Selection policy: multi-backend when configured, else a single
    /// database provider, else disabled (`None` — ephemeral transcript).
    async fn history_provider_lazy(&self) -> Result<Option<Arc<dyn HistoryProvider>>> {
        self.history
            .get_or_try_init(|| async {
                let storage_config = &self.services.config.storage;
                if storage_config.history_disabled {
                    return Ok(None);
                }
                let (manager, _) = self.storage_lazy().await?;
                let primary: Arc<dyn HistoryProvider> =
                    Arc::new(DatabaseProvider::new(manager.clone()));
                let provider: Arc<dyn HistoryProvider> = if storage_config.multi_backend {
                    Arc::new(MultiBackendProvider::new(
                        primary,
                        Arc::new(InMemoryProvider::new()),
                        &storage_config.wal,
                    ))
                } else {
                    primary
                };
                Ok(Some(provider))
            })
            .await
            .cloned()
    }

    async fn llm_lazy(&self) -> Result<Arc<LlmService>> {
        let ctx = self.context()?;
        self.llm
            .get_or_try_init(|| async {
                let backend = match &self.options.backend_override {
                    Some(backend) => backend.clone(),
                    None => backend_for(&self.options.llm)?,
                };
                let service = Arc::new(LlmService::new(
                    self.id.clone(),
                    backend.clone(),
                    ctx.clone(),
                    self.services.tools.clone(),
                    self.services.bus.clone(),
                    self.options.llm.clone(),
                ));

                // Internal subsystems get their own service built from
                // the evaluation config (same backend when overridden).
                let eval_config = self
                    .services
                    .config
                    .memory
                    .evaluation
                    .resolve(&self.options.llm);
                let eval_backend = match &self.options.backend_override {
                    Some(backend) => backend.clone(),
                    None => backend_for(&eval_config)?,
                };
                let evaluator: Arc<dyn TextCompletion> = Arc::new(LlmService::new(
                    self.id.clone(),
                    eval_backend,
                    ctx.clone(),
                    self.services.tools.clone(),
                    self.services.bus.clone(),
                    eval_config,
                ));
                let decision: Arc<dyn TextCompletion> = service.clone();
                self.services.bind_llm(decision, evaluator).await;
                Ok::<_, Error>(service)
            })
            .await
            .cloned()
    }

    // ── run ───────────────────────────────────────────────────────

    /// Drive one turn. The response returns as soon as the LLM service
    /// finishes; memory and reflection work continues on the returned
    /// background handle, with all failures swallowed into logs.
    pub async fn run(
        &self,
        input: &str,
        image: Option<(&str, &str)>,
        options: Option<RunOptions>,
    ) -> Result<TurnOutput> {
        let ctx = self.context()?;

        if input.trim().is_empty() {
            return Err(Error::UserInputInvalid("input must be non-empty".into()));
        }
        if let Some((image_data, mime_type)) = image {
            if image_data.is_empty() || mime_type.is_empty() {
                return Err(Error::UserInputInvalid(
                    "image data requires both image and mimeType".into(),
                ));
            }
        }

        let _turn = self.turn_lock.lock().await;

        // Bind history lazily when init() could not (exclusive storage).
        if ctx.provider().is_none() {
            match self.history_provider_lazy().await {
                Ok(Some(provider)) => ctx.bind_provider(Some(provider)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.id,
                        error = %e,
                        "history storage unavailable, running ephemeral this turn"
                    );
                }
            }
        }

        // Restore the persisted transcript once per session.
        self.restored
            .get_or_init(|| async {
                if ctx.provider().is_none() || !ctx.is_empty() {
                    return;
                }
                match ctx.restore_via_provider().await {
                    Ok(count) if count > 0 => {
                        TraceEvent::SessionRestored {
                            session_id: self.id.clone(),
                            messages: count,
                            strategy: "provider".into(),
                        }
                        .emit();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, error = %e, "history restore failed");
                    }
                }
            })
            .await;

        self.services.bus.emit_session(
            &self.id,
            topics::LLM_THINKING,
            json!({ "stage": "processing" }),
        );

        let llm = self.llm_lazy().await?;
        let response = llm.generate(input, image).await?;

        self.services.registry.record_turn(&self.id);

        // The background job starts only after the response exists, so
        // the caller always receives the answer first.
        let background = self.spawn_background(&ctx, options);
        Ok(TurnOutput {
            response,
            background,
        })
    }

    fn spawn_background(
        &self,
        ctx: &Arc<ContextManager>,
        options: Option<RunOptions>,
    ) -> JoinHandle<()> {
        let session_id = self.id.clone();
        let knowledge = self.services.knowledge.clone();
        let reflection = self.services.reflection.clone();
        let metadata = self.memory_metadata.read().clone();
        let overrides = options.and_then(|o| o.overrides);
        let transcript = ctx.raw_messages();
        let recent: Vec<String> = ctx
            .recent_messages(RECENT_WINDOW)
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content.extract_all_text()))
            .collect();

        tokio::spawn(async move {
            let turn = TurnRecord::from_transcript_tail(&transcript);
            knowledge
                .run(PipelineInput {
                    session_id: &session_id,
                    turn: &turn,
                    recent_messages: recent,
                    session_metadata: metadata.as_ref(),
                    overrides: overrides.as_ref(),
                })
                .await;
            reflection.run(&session_id, &turn).await;
        })
    }

    // ── persistence ───────────────────────────────────────────────

    /// Capture the session as a version-stamped record, preferring the
    /// history provider's view and falling back to the context manager.
    pub async fn serialize(&self) -> Result<HistoryRecord> {
        let ctx = self.context.get().ok_or_else(|| {
            Error::persistence("serialize", self.id.as_str(), "session is not initialized")
        })?;

        let (messages, backend, history_enabled) = match ctx.provider() {
            Some(provider) => match provider.load_messages(&self.id).await {
                Ok(messages) => (messages, provider.backend_name().to_owned(), true),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.id,
                        error = %e,
                        "provider read failed during serialize, using context manager"
                    );
                    (ctx.raw_messages(), "context".to_owned(), true)
                }
            },
            None => (ctx.raw_messages(), "none".to_owned(), false),
        };

        Ok(HistoryRecord {
            session_id: self.id.clone(),
            messages,
            metadata: RecordMetadata {
                created_at: self.created_at,
                last_activity: Utc::now(),
                history_enabled,
                history_backend: backend,
                environment: environment_tag(),
                session_memory_metadata: self.memory_metadata.read().clone(),
            },
            options: None,
            version: RECORD_VERSION.to_owned(),
            serialized_at: Utc::now(),
        })
    }

    /// Rebuild a session from a record: clear any provider history,
    /// re-save every message in order, then restore into the context
    /// manager. Merge hooks and metadata schemas are never part of a
    /// record; callers re-supply them through the options.
    pub async fn deserialize(
        record: HistoryRecord,
        services: Arc<SharedServices>,
        mut options: SessionOptions,
    ) -> Result<Session> {
        if !record.version_matches() {
            tracing::warn!(
                session_id = %record.session_id,
                found = %record.version,
                expected = RECORD_VERSION,
                "record version mismatch, restoring best-effort"
            );
        }

        options.id = Some(record.session_id.clone());
        if options.session_memory_metadata.is_none() {
            options.session_memory_metadata = record.metadata.session_memory_metadata.clone();
        }

        let session = Session::new(services, options);
        session
            .init()
            .await
            .map_err(|e| Error::persistence("deserialize", record.session_id.as_str(), e))?;

        let ctx = session.context()?;
        if ctx.provider().is_none() && record.metadata.history_enabled {
            match session.history_provider_lazy().await {
                Ok(provider) => ctx.bind_provider(provider),
                Err(e) => {
                    tracing::warn!(
                        session_id = %record.session_id,
                        error = %e,
                        "history unavailable during deserialize, transcript stays in-memory"
                    );
                }
            }
        }

        if let Some(provider) = ctx.provider() {
            provider
                .clear_messages(&record.session_id)
                .await
                .map_err(|e| Error::persistence("deserialize", record.session_id.as_str(), e))?;
            for message in &record.messages {
                provider
                    .save_message(&record.session_id, message)
                    .await
                    .map_err(|e| Error::persistence("deserialize", record.session_id.as_str(), e))?;
            }
        }

        ctx.set_messages(record.messages);
        let _ = session.restored.set(());
        Ok(session)
    }

    /// Clear the context manager, re-bind the provider, and try the
    /// three restoration strategies in order: provider-driven restore,
    /// bulk set, per-message append.
    pub async fn refresh_conversation_history(&self) -> Result<usize> {
        let ctx = self.context()?;
        ctx.clear_messages();

        let provider = match self.history_provider_lazy().await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "history re-bind failed");
                None
            }
        };
        ctx.bind_provider(provider.clone());
        let Some(provider) = provider else {
            return Ok(0);
        };

        // (a) provider-driven restore.
        match ctx.restore_via_provider().await {
            Ok(count) => {
                self.trace_restored(count, "provider");
                return Ok(count);
            }
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "provider restore failed"),
        }

        // (b) bulk set.
        match provider.load_messages(&self.id).await {
            Ok(messages) => {
                let count = messages.len();
                ctx.set_messages(messages);
                self.trace_restored(count, "bulk");
                return Ok(count);
            }
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "bulk restore failed"),
        }

        // (c) manual append loop.
        let messages = provider
            .load_messages(&self.id)
            .await
            .map_err(|e| Error::HistoryProvider(e.to_string()))?;
        let count = messages.len();
        for message in messages {
            ctx.append_message(message);
        }
        self.trace_restored(count, "append");
        Ok(count)
    }

    fn trace_restored(&self, messages: usize, strategy: &str) {
        TraceEvent::SessionRestored {
            session_id: self.id.clone(),
            messages,
            strategy: strategy.to_owned(),
        }
        .emit();
    }

    // ── disconnect ────────────────────────────────────────────────

    /// Release the history provider. Only an exclusively-owned storage
    /// connection is closed; borrowed ones belong to the process.
    /// In-flight background jobs are not cancelled.
    pub async fn disconnect(&self) {
        if let Some(ctx) = self.context.get() {
            if let Some(provider) = ctx.provider() {
                let exclusive = matches!(
                    self.storage.get(),
                    Some((_, StorageOwnership::Exclusive))
                );
                if exclusive {
                    if let Err(e) = provider.close().await {
                        tracing::warn!(session_id = %self.id, error = %e, "history close failed");
                    }
                }
            }
            ctx.bind_provider(None);
        }
        self.services
            .bus
            .emit_session(&self.id, topics::SESSION_DISCONNECTED, json!({}));
        self.services.bus.drop_session(&self.id);
        tracing::info!(session_id = %self.id, "session disconnected");
    }
}
