/// Shared error type used across all Matrix crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid user input: {0}")]
    UserInputInvalid(String),

    #[error("session {0} is not initialized")]
    NotInitialized(String),

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("provider {provider}: {message}")]
    ProviderTransport { provider: String, message: String },

    #[error("tool loop did not converge after {0} iterations")]
    IterationLimitExceeded(usize),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool {tool} timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("tool {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("embeddings unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("history provider: {0}")]
    HistoryProvider(String),

    #[error("session persistence ({operation}) for {session_id}: {message}")]
    SessionPersistence {
        operation: String,
        session_id: String,
        message: String,
    },

    #[error("vector store: {0}")]
    VectorStore(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a serialize/deserialize failure with its operation and session.
    pub fn persistence(
        operation: impl Into<String>,
        session_id: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Error::SessionPersistence {
            operation: operation.into(),
            session_id: session_id.into(),
            message: message.to_string(),
        }
    }
}
