//! Wire types for the Ollama HTTP API.

use serde::{Deserialize, Serialize};

use crate::catalog::ModelId;
use crate::error::ErrorKind;

pub const TAGS_PATH: &str = "/api/tags";
pub const GENERATE_PATH: &str = "/api/generate";

// --- Ollama API Structures ---

/// Body of `POST /api/generate`.
///
/// Built through [`GenerateRequest::new`] (a real prompt) or
/// [`GenerateRequest::load`] (an empty prompt, used as a reachability probe:
/// the backend loads the model and answers without generating).
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    model: ModelId,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

impl GenerateRequest {
    pub fn new(model: ModelId, prompt: impl Into<String>) -> Result<Self, ErrorKind> {
        if model.is_empty() {
            return Err(ErrorKind::InvalidModel);
        }
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(ErrorKind::InvalidPrompt);
        }
        Ok(Self {
            model,
            prompt,
            stream: true,
            system: None,
            context: None,
            keep_alive: None,
        })
    }

    pub fn load(model: ModelId) -> Result<Self, ErrorKind> {
        if model.is_empty() {
            return Err(ErrorKind::InvalidModel);
        }
        Ok(Self {
            model,
            prompt: String::new(),
            stream: false,
            system: None,
            context: None,
            keep_alive: None,
        })
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_context(mut self, context: Option<Vec<i64>>) -> Self {
        self.context = context.filter(|c| !c.is_empty());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Option<String>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    pub fn to_body(&self) -> Result<Vec<u8>, ErrorKind> {
        serde_json::to_vec(self).map_err(|e| ErrorKind::MalformedResponse(e.to_string()))
    }
}

/// One line of a `/api/generate` response.
///
/// `done` is optional on the wire only so that `{"error": "..."}` frames
/// can be told apart from frames that are actually missing it.
#[derive(Deserialize, Debug)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    pub done: Option<bool>,
    pub error: Option<String>,
    #[serde(default)]
    pub context: Vec<i64>,
    pub done_reason: Option<String>,
    pub total_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct TagsResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: ModelId,
    pub modified_at: Option<String>,
    pub size: Option<u64>,
    pub digest: Option<String>,
}
