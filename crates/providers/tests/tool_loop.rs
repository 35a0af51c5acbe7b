//! Tool-loop integration tests driven by a scripted backend — full
//! round-trips through the context manager, unified tool manager, and
//! event bus without any network.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use mx_context::{formatter_for, ContextManager};
use mx_domain::config::{LlmConfig, ToolsConfig};
use mx_domain::error::{Error, Result};
use mx_domain::message::{Role, ToolCall};
use mx_events::{topics, EventBus};
use mx_mcp_client::McpManager;
use mx_providers::{ChatBackend, LlmService, ProviderRequest, ProviderResponse, ToolChoice};
use mx_tools::{InternalTool, ToolInvocation, UnifiedToolManager};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScriptedBackend {
    script: Mutex<VecDeque<Result<ProviderResponse>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedBackend {
    fn new(script: Vec<Result<ProviderResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn request(&self, idx: usize) -> ProviderRequest {
        self.requests.lock()[idx].clone()
    }
}

#[async_trait::async_trait]
impl ChatBackend for ScriptedBackend {
    fn backend_id(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, req: &ProviderRequest) -> Result<ProviderResponse> {
        self.requests.lock().push(req.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Other("script exhausted".into())))
    }
}

fn text_response(text: &str) -> Result<ProviderResponse> {
    Ok(ProviderResponse {
        content: text.into(),
        ..ProviderResponse::default()
    })
}

fn tool_response(content: &str, calls: Vec<ToolCall>) -> Result<ProviderResponse> {
    Ok(ProviderResponse {
        content: content.into(),
        tool_calls: calls,
        ..ProviderResponse::default()
    })
}

fn transport_error() -> Result<ProviderResponse> {
    Err(Error::ProviderTransport {
        provider: "scripted".into(),
        message: "connection reset".into(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CountingTool;

#[async_trait::async_trait]
impl InternalTool for CountingTool {
    fn name(&self) -> &str {
        "count_lines"
    }
    fn description(&self) -> &str {
        "counts lines in a file"
    }
    async fn execute(&self, args: Value, _ctx: &ToolInvocation) -> Result<Value> {
        Ok(json!({ "path": args.get("path"), "lines": 42 }))
    }
}

struct Fixture {
    backend: Arc<ScriptedBackend>,
    context: Arc<ContextManager>,
    bus: Arc<EventBus>,
    service: LlmService,
}

fn fixture(script: Vec<Result<ProviderResponse>>) -> Fixture {
    let backend = ScriptedBackend::new(script);
    let context = Arc::new(ContextManager::new(
        "s1",
        formatter_for("openai").unwrap(),
        None,
    ));
    let bus = Arc::new(EventBus::new());
    let tools = Arc::new(UnifiedToolManager::new(
        Arc::new(McpManager::empty()),
        ToolsConfig::default(),
        bus.clone(),
    ));
    tools.register(Arc::new(CountingTool));

    let config = LlmConfig {
        provider: "openai".into(),
        model: "gpt-4o".into(),
        retry_backoff_ms: 1,
        ..LlmConfig::default()
    };
    let service = LlmService::new(
        "s1",
        backend.clone(),
        context.clone(),
        tools,
        bus.clone(),
        config,
    );
    Fixture {
        backend,
        context,
        bus,
        service,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn plain_text_turn_appends_user_then_assistant() {
    let f = fixture(vec![text_response("hello there")]);
    let out = f.service.generate("hi", None).await.unwrap();
    assert_eq!(out, "hello there");

    let raw = f.context.raw_messages();
    assert_eq!(raw.len(), 2);
    assert_eq!(raw[0].role, Role::User);
    assert_eq!(raw[1].role, Role::Assistant);
}

#[tokio::test]
async fn tool_round_trip_preserves_transcript_order() {
    let f = fixture(vec![
        tool_response(
            "let me check the file",
            vec![ToolCall::new("c1", "count_lines", r#"{"path":"a.rs"}"#)],
        ),
        text_response("a.rs has 42 lines"),
    ]);
    let mut events = f.bus.subscribe_session("s1");

    let out = f.service.generate("how long is a.rs?", None).await.unwrap();
    assert_eq!(out, "a.rs has 42 lines");

    let raw = f.context.raw_messages();
    let roles: Vec<Role> = raw.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(raw[1].tool_calls[0].id, "c1");
    assert_eq!(raw[2].tool_call_id.as_deref(), Some("c1"));
    let tool_payload: Value = serde_json::from_str(&raw[2].content.extract_all_text()).unwrap();
    assert_eq!(tool_payload["lines"], 42);

    // Thinking emitted at least once (the content before tool calls).
    let mut saw_thinking = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == topics::LLM_THINKING {
            saw_thinking = true;
        }
    }
    assert!(saw_thinking);
}

#[tokio::test]
async fn transport_error_retries_without_tools() {
    let f = fixture(vec![
        transport_error(),
        tool_response(
            "",
            vec![ToolCall::new("c1", "count_lines", r#"{"path":"b.rs"}"#)],
        ),
        text_response("done"),
    ]);

    let out = f.service.generate("go", None).await.unwrap();
    assert_eq!(out, "done");
    assert_eq!(f.backend.request_count(), 3);

    // First attempt carried tools; the retry dropped them and forced
    // tool choice off.
    let first = f.backend.request(0);
    assert!(!first.tools.is_empty());
    assert_eq!(first.tool_choice, ToolChoice::Auto);
    let retry = f.backend.request(1);
    assert!(retry.tools.is_empty());
    assert_eq!(retry.tool_choice, ToolChoice::None);
}

#[tokio::test]
async fn exhausted_retries_surface_transport_error() {
    let f = fixture(vec![transport_error(), transport_error(), transport_error()]);
    let err = f.service.generate("go", None).await.unwrap_err();
    assert!(matches!(err, Error::ProviderTransport { .. }));
    assert_eq!(f.backend.request_count(), 3);
}

#[tokio::test]
async fn malformed_tool_arguments_become_error_result() {
    let f = fixture(vec![
        tool_response(
            "",
            vec![ToolCall::new("c1", "count_lines", "{not json")],
        ),
        text_response("recovered"),
    ]);

    let out = f.service.generate("go", None).await.unwrap();
    assert_eq!(out, "recovered");

    let raw = f.context.raw_messages();
    let tool_msgs: Vec<_> = raw.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_msgs.len(), 1);
    let payload: Value = serde_json::from_str(&tool_msgs[0].content.extract_all_text()).unwrap();
    assert!(payload["error"]
        .as_str()
        .unwrap()
        .contains("invalid tool arguments"));
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model() {
    let f = fixture(vec![
        tool_response("", vec![ToolCall::new("c1", "no_such_tool", "{}")]),
        text_response("fell back"),
    ]);

    let out = f.service.generate("go", None).await.unwrap();
    assert_eq!(out, "fell back");

    let raw = f.context.raw_messages();
    let tool_msg = raw.iter().find(|m| m.role == Role::Tool).unwrap();
    let payload: Value = serde_json::from_str(&tool_msg.content.extract_all_text()).unwrap();
    assert!(payload["error"].as_str().unwrap().contains("no_such_tool"));
}

#[tokio::test]
async fn endless_tool_calls_hit_iteration_limit() {
    let script: Vec<Result<ProviderResponse>> = (0..6)
        .map(|i| {
            tool_response(
                "",
                vec![ToolCall::new(
                    format!("c{i}"),
                    "count_lines",
                    r#"{"path":"x.rs"}"#,
                )],
            )
        })
        .collect();
    let f = fixture(script);

    let err = f.service.generate("loop forever", None).await.unwrap_err();
    assert!(matches!(err, Error::IterationLimitExceeded(5)));
}

#[tokio::test]
async fn direct_generate_bypasses_transcript() {
    let f = fixture(vec![text_response("direct answer")]);
    let out = f
        .service
        .direct_generate("decide something", Some("you are a judge"))
        .await
        .unwrap();
    assert_eq!(out, "direct answer");
    assert!(f.context.raw_messages().is_empty());

    let req = f.backend.request(0);
    assert!(req.tools.is_empty());
    assert_eq!(req.messages[0]["role"], "system");
    assert_eq!(req.messages[1]["role"], "user");
}

#[tokio::test]
async fn response_lifecycle_events_are_emitted() {
    let f = fixture(vec![text_response("ok")]);
    let mut events = f.bus.subscribe_session("s1");

    f.service.generate("hi", None).await.unwrap();

    let mut types = Vec::new();
    while let Ok(event) = events.try_recv() {
        types.push(event.event_type);
    }
    assert!(types.contains(&topics::LLM_RESPONSE_STARTED.to_string()));
    assert!(types.contains(&topics::LLM_RESPONSE_COMPLETED.to_string()));
}
