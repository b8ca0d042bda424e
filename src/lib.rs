pub mod assistant;
pub mod config;
pub mod inference;
pub mod io;
pub mod model;
pub mod server;
pub mod session;
pub mod tokenizer;

pub use assistant::{Assistant, WritingAssistant};
pub use config::{AppConfig, DecodingStrategy, SuggestionSettings, Task, TransformSettings};
pub use model::gpt::{Gpt2, Gpt2Config};
pub use session::{SessionStore, SessionView};
pub use tokenizer::TextTokenizer;

/// Custom error type for the writing assistant
#[derive(thiserror::Error, Debug)]
pub enum AssistantError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Text transformation is not available on this device")]
    TransformUnavailable,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Nothing to accept: {0}")]
    NothingToAccept(String),
}

pub type Result<T> = std::result::Result<T, AssistantError>;
