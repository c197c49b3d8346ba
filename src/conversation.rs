//! Per-conversation message history and the single in-flight generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::GenerateRequest;
use crate::catalog::ModelId;
use crate::connection::InferenceConnection;
use crate::decoder::Completion;
use crate::error::ErrorKind;
use crate::session::{
    GenerationSession, SessionHandle, SessionId, SessionObserver, SessionSnapshot, SessionStatus,
};

pub type ConversationId = u64;
pub type MessageId = u64;

static NEXT_CONVERSATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Where a message is in its life.
///
/// Only an Assistant message is ever `Provisional`, and only while its
/// generation is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Provisional,
    Complete,
    Cancelled,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Model that produced an Assistant message.
    pub model: Option<ModelId>,
}

impl Message {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at: Utc::now(),
            status: MessageStatus::Complete,
            model: None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.status == MessageStatus::Provisional
    }

    pub fn is_final(&self) -> bool {
        !self.is_provisional()
    }

    /// Content plus a marker for cancelled or failed replies.
    pub fn display_text(&self) -> String {
        match &self.status {
            MessageStatus::Provisional | MessageStatus::Complete => self.content.clone(),
            MessageStatus::Cancelled => format!("{} [cancelled]", self.content),
            MessageStatus::Failed(kind) if self.content.is_empty() => format!("[error: {}]", kind),
            MessageStatus::Failed(kind) => format!("{}\n[error: {}]", self.content, kind),
        }
    }
}

/// Receives every finalized message, e.g. to persist it.
pub trait MessageStore: Send + Sync {
    fn store(&self, conversation: ConversationId, message: &Message);
}

struct ActiveTurn {
    message_id: MessageId,
    session: SessionHandle,
}

struct ConversationData {
    messages: Vec<Message>,
    next_message_id: MessageId,
    model_override: Option<ModelId>,
    active: Option<ActiveTurn>,
    /// Token context returned by the last completed turn, and its model.
    context: Option<(ModelId, Vec<i64>)>,
}

impl ConversationData {
    fn push(&mut self, mut message: Message) -> &Message {
        message.id = self.next_message_id;
        self.next_message_id += 1;
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }
}

struct ConversationInner {
    id: ConversationId,
    connection: Arc<InferenceConnection>,
    store: Option<Arc<dyn MessageStore>>,
    data: Mutex<ConversationData>,
}

impl ConversationInner {
    fn store(&self, message: &Message) {
        if let Some(store) = &self.store {
            store.store(self.id, message);
        }
    }
}

impl SessionObserver for ConversationInner {
    fn session_finished(
        &self,
        session: SessionId,
        snapshot: &SessionSnapshot,
        completion: Option<&Completion>,
    ) {
        let finalized = {
            let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
            let message_id = match &data.active {
                Some(turn) if turn.session.id() == session => turn.message_id,
                _ => return,
            };
            let model = data.active.take().map(|turn| turn.session.model().clone());

            if let (Some(model), Some(completion)) = (model, completion) {
                if !completion.context.is_empty() {
                    data.context = Some((model, completion.context.clone()));
                }
            }

            let Some(message) = data.messages.iter_mut().find(|m| m.id == message_id) else {
                return;
            };
            message.content = snapshot.text.clone();
            message.status = match &snapshot.status {
                SessionStatus::Completed => MessageStatus::Complete,
                SessionStatus::Failed(kind) => MessageStatus::Failed(kind.clone()),
                _ => MessageStatus::Cancelled,
            };
            message.clone()
        };
        debug!(conversation = self.id, message = finalized.id, status = ?finalized.status, "turn finalized");
        self.store(&finalized);
    }
}

/// Builder for [`ConversationState`].
pub struct ConversationBuilder {
    connection: Arc<InferenceConnection>,
    store: Option<Arc<dyn MessageStore>>,
    history: Vec<Message>,
    model_override: Option<ModelId>,
}

impl ConversationBuilder {
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Seeds prior messages. Provisional ones cannot be resumed and are
    /// kept as cancelled.
    pub fn history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn model_override(mut self, model: ModelId) -> Self {
        self.model_override = Some(model);
        self
    }

    pub fn build(self) -> ConversationState {
        let mut messages = self.history;
        for message in &mut messages {
            if message.is_provisional() {
                message.status = MessageStatus::Cancelled;
            }
        }
        let next_message_id = messages.iter().map(|m| m.id + 1).max().unwrap_or(1);
        let data = ConversationData {
            messages,
            next_message_id,
            model_override: self.model_override.filter(|m| !m.is_empty()),
            active: None,
            context: None,
        };
        ConversationState {
            inner: Arc::new(ConversationInner {
                id: NEXT_CONVERSATION_ID.fetch_add(1, Ordering::Relaxed),
                connection: self.connection,
                store: self.store,
                data: Mutex::new(data),
            }),
        }
    }
}

/// One chat: ordered messages and at most one running generation.
///
/// Cloning gives another handle to the same conversation.
#[derive(Clone)]
pub struct ConversationState {
    inner: Arc<ConversationInner>,
}

impl ConversationState {
    pub fn new(connection: Arc<InferenceConnection>) -> Self {
        Self::builder(connection).build()
    }

    pub fn builder(connection: Arc<InferenceConnection>) -> ConversationBuilder {
        ConversationBuilder {
            connection,
            store: None,
            history: Vec::new(),
            model_override: None,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.inner.id
    }

    /// Starts a generation for `text`.
    ///
    /// Appends the User message and a provisional Assistant message, and
    /// returns the session; the caller drives it (see
    /// [`GenerationSession::wait`]). The Assistant message is finalized when
    /// the session ends, however it ends.
    pub fn submit(&self, text: &str) -> Result<GenerationSession, ErrorKind> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Err(ErrorKind::InvalidPrompt);
        }
        let connection = &self.inner.connection;
        let epoch = connection.epoch();
        let connected = connection.current_model().ok_or(ErrorKind::NotConnected)?;

        let (session, user_message) = {
            let mut data = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
            if data.active.is_some() {
                return Err(ErrorKind::GenerationInProgress);
            }

            let model = data.model_override.clone().unwrap_or(connected);
            let context = match &data.context {
                Some((context_model, tokens)) if *context_model == model => Some(tokens.clone()),
                _ => None,
            };
            let system = data
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.clone());
            let settings = connection.settings();
            let request = GenerateRequest::new(model.clone(), prompt)?
                .with_system(system)
                .with_context(context)
                .with_keep_alive(settings.keep_alive.clone());

            let inner: Arc<dyn SessionObserver> = self.inner.clone();
            let observer: Weak<dyn SessionObserver> = Arc::downgrade(&inner);
            let session = GenerationSession::start(
                connection.transport(),
                request,
                settings.first_byte_timeout,
                Some(observer),
            );

            let user_message = data.push(Message::new(0, Role::User, prompt)).clone();

            let mut reply = Message::new(0, Role::Assistant, String::new());
            reply.status = MessageStatus::Provisional;
            reply.model = Some(model.clone());
            let message_id = data.push(reply).id;
            data.active = Some(ActiveTurn {
                message_id,
                session: session.handle(),
            });
            info!(conversation = self.inner.id, session = session.id(), model = %model, "generation submitted");
            (session, user_message)
        };

        connection.register_session(session.handle(), epoch);
        self.inner.store(&user_message);
        Ok(session)
    }

    /// Cancels the running generation, if any. Its partial reply is kept.
    pub fn cancel(&self) -> bool {
        match self.active_session() {
            Some(session) => session.cancel(),
            None => false,
        }
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        let data = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
        data.active.as_ref().map(|turn| turn.session.clone())
    }

    pub fn is_generating(&self) -> bool {
        self.active_session().is_some()
    }

    /// Snapshot of the messages in order. The provisional message, if any,
    /// carries the text generated so far.
    pub fn history(&self) -> Vec<Message> {
        let data = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages = data.messages.clone();
        if let Some(turn) = &data.active {
            if let Some(message) = messages.iter_mut().find(|m| m.id == turn.message_id) {
                message.content = turn.session.text();
            }
        }
        messages
    }

    pub fn provisional_text(&self) -> Option<String> {
        self.active_session().map(|session| session.text())
    }

    /// Model used by the next submission instead of the connected one.
    /// The connection still has to be `Connected`.
    pub fn set_model_override(&self, model: Option<ModelId>) {
        let mut data = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
        data.model_override = model.filter(|m| !m.is_empty());
    }

    pub fn model_override(&self) -> Option<ModelId> {
        let data = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
        data.model_override.clone()
    }

    /// Drops all messages and token context. Refused while generating.
    pub fn clear(&self) -> Result<(), ErrorKind> {
        let mut data = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
        if data.active.is_some() {
            return Err(ErrorKind::GenerationInProgress);
        }
        data.messages.clear();
        data.context = None;
        Ok(())
    }
}
