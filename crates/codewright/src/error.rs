use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error ({status}) from {provider} at {endpoint}: {message}")]
    Api {
        status: u16,
        message: String,
        provider: String,
        endpoint: String,
    },

    #[error("Malformed response stream: {0}")]
    MalformedStream(String),

    #[error("Response stream ended without usage data")]
    MissingUsage,

    #[error("Conversation desync: {0}. Reset the conversation before querying again.")]
    Desync(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session store error: {0}")]
    Store(String),
}
