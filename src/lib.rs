//! Inference-session core for a local Ollama backend.
//!
//! - [`ModelCatalog`] lists models (`GET /api/tags`).
//! - [`InferenceConnection`] selects a model and probes it.
//! - [`GenerationSession`] streams one `POST /api/generate` exchange,
//!   decoded by [`StreamDecoder`].
//! - [`ConversationState`] keeps a chat's messages and its single running
//!   generation.
//!
//! Everything talks HTTP through the [`Transport`] trait; [`HttpTransport`]
//! is the reqwest implementation.

pub mod api;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod session;
pub mod transport;

pub use api::{GenerateRequest, ModelInfo};
pub use catalog::{ModelCatalog, ModelId};
pub use config::{Config, ConfigError, ConfigLoader};
pub use connection::{ConnectionState, GenerationSettings, InferenceConnection};
pub use conversation::{
    ConversationBuilder, ConversationId, ConversationState, Message, MessageId, MessageStatus,
    MessageStore, Role,
};
pub use decoder::{decode_stream, Completion, StreamDecoder, StreamEvent};
pub use error::{ErrorKind, TransportError};
pub use session::{
    GenerationSession, SessionHandle, SessionId, SessionObserver, SessionSnapshot, SessionStatus,
};
pub use transport::{ByteStream, HttpTransport, StreamingReply, Transport};
