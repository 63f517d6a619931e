use async_trait::async_trait;

/// Common interface for remote completion backends.
///
/// One call per sealed batch: the aggregated text goes in, the reply text
/// comes out. The dispatcher owns the request timeout, so implementations
/// should not set their own deadline on the call.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logging and error messages.
    fn name(&self) -> &str;

    /// Send aggregated content, wait for the full reply.
    async fn complete(&self, content: &str) -> Result<String, BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}
