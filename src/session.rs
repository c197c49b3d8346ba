//! One request/response generation exchange.
//!
//! [`GenerationSession`] is a pull-driven producer: the request goes out on
//! the first pull, and every pull advances the stream by one event. Dropping
//! the session (or cancelling it) drops the response body, which closes the
//! underlying connection.
//!
//! [`SessionHandle`] is the cloneable, read-mostly view used by everything
//! that is not driving the stream: the UI, the owning conversation, and
//! `InferenceConnection::eject`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{GenerateRequest, GENERATE_PATH};
use crate::catalog::ModelId;
use crate::decoder::{decode_stream, Completion, StreamEvent};
use crate::error::ErrorKind;
use crate::transport::Transport;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed(ErrorKind),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed(_)
        )
    }
}

/// Status and cumulative text, always published together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub text: String,
}

/// Notified exactly once when a session reaches a terminal status.
pub trait SessionObserver: Send + Sync {
    fn session_finished(
        &self,
        session: SessionId,
        snapshot: &SessionSnapshot,
        completion: Option<&Completion>,
    );
}

struct SessionShared {
    id: SessionId,
    model: ModelId,
    prompt: String,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    observer: Option<Weak<dyn SessionObserver>>,
}

impl SessionShared {
    /// Appends a delta unless the session already ended.
    fn append(&self, delta: &str) -> bool {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.status.is_terminal() {
                return false;
            }
            snapshot.status = SessionStatus::Streaming;
            snapshot.text.push_str(delta);
            true
        })
    }

    /// Moves to a terminal status. Only the first call wins.
    fn finish(&self, status: SessionStatus, completion: Option<&Completion>) -> bool {
        let mut finished = None;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.status.is_terminal() {
                return false;
            }
            snapshot.status = status;
            finished = Some(snapshot.clone());
            true
        });
        let Some(snapshot) = finished else {
            return false;
        };

        // wakes the driver if it is parked on the transport
        self.cancel.cancel();
        match &snapshot.status {
            SessionStatus::Failed(kind) => {
                warn!(session = self.id, model = %self.model, error = %kind, "generation failed")
            }
            status => info!(
                session = self.id,
                model = %self.model,
                ?status,
                chars = snapshot.text.len(),
                "generation finished"
            ),
        }

        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.session_finished(self.id, &snapshot, completion);
        }
        true
    }
}

/// Drives one generation request.
pub struct GenerationSession {
    shared: Arc<SessionShared>,
    events: Option<BoxStream<'static, StreamEvent>>,
}

impl GenerationSession {
    /// Prepares the exchange; nothing is sent until the first pull.
    ///
    /// `first_byte_timeout` bounds the wait for the response headers only.
    pub fn start(
        transport: Arc<dyn Transport>,
        request: GenerateRequest,
        first_byte_timeout: Option<Duration>,
        observer: Option<Weak<dyn SessionObserver>>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot {
            status: SessionStatus::Pending,
            text: String::new(),
        });
        let shared = Arc::new(SessionShared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            model: request.model().clone(),
            prompt: request.prompt().to_string(),
            snapshot,
            cancel: CancellationToken::new(),
            observer,
        });
        debug!(session = shared.id, model = %shared.model, "session created");

        let events = futures::stream::once(open_stream(transport, request, first_byte_timeout))
            .flatten()
            .boxed();
        Self {
            shared,
            events: Some(events),
        }
    }

    /// Validates `prompt` and prepares a standalone session for `model`.
    pub fn for_prompt(
        transport: Arc<dyn Transport>,
        model: ModelId,
        prompt: &str,
        first_byte_timeout: Option<Duration>,
    ) -> Result<Self, ErrorKind> {
        let request = GenerateRequest::new(model, prompt)?;
        Ok(Self::start(transport, request, first_byte_timeout, None))
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.snapshot.borrow().status.clone()
    }

    pub fn text(&self) -> String {
        self.shared.snapshot.borrow().text.clone()
    }

    pub fn cancel(&mut self) -> bool {
        self.events = None;
        self.shared.finish(SessionStatus::Cancelled, None)
    }

    /// Pulls until the next non-empty delta and returns it. `None` once the
    /// session is terminal.
    pub async fn next_delta(&mut self) -> Option<String> {
        loop {
            let events = self.events.as_mut()?;
            let event = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => None,
                event = events.next() => event,
            };

            match event {
                Some(StreamEvent::Delta(text)) => {
                    if !self.shared.append(&text) {
                        self.events = None;
                        return None;
                    }
                    if !text.is_empty() {
                        return Some(text);
                    }
                }
                Some(StreamEvent::Done(completion)) => {
                    self.events = None;
                    self.shared.finish(SessionStatus::Completed, Some(&completion));
                    return None;
                }
                Some(StreamEvent::Error(kind)) => {
                    self.events = None;
                    self.shared.finish(SessionStatus::Failed(kind), None);
                    return None;
                }
                None => {
                    // cancelled from another context
                    self.events = None;
                    self.shared.finish(SessionStatus::Cancelled, None);
                    return None;
                }
            }
        }
    }

    /// Drives the session to its terminal status.
    pub async fn wait(mut self) -> SessionSnapshot {
        while self.next_delta().await.is_some() {}
        self.handle().snapshot()
    }

    /// The deltas as a stream. Dropping the stream cancels the session.
    pub fn into_deltas(self) -> impl Stream<Item = String> + Send {
        futures::stream::unfold(self, |mut session| async move {
            session.next_delta().await.map(|delta| (delta, session))
        })
    }
}

impl Drop for GenerationSession {
    fn drop(&mut self) {
        if self.events.take().is_some() {
            debug!(session = self.shared.id, "session dropped mid-stream");
            self.shared.finish(SessionStatus::Cancelled, None);
        }
    }
}

async fn open_stream(
    transport: Arc<dyn Transport>,
    request: GenerateRequest,
    first_byte_timeout: Option<Duration>,
) -> BoxStream<'static, StreamEvent> {
    let failed = |kind: ErrorKind| futures::stream::iter([StreamEvent::Error(kind)]).boxed();

    let body = match request.to_body() {
        Ok(body) => body,
        Err(kind) => return failed(kind),
    };
    let reply = match transport
        .post_json(GENERATE_PATH, body, first_byte_timeout)
        .await
    {
        Ok(reply) => reply,
        Err(e) => return failed(e.into()),
    };

    if !reply.is_success() {
        let status = reply.status;
        let text = reply.error_text().await;
        return failed(ErrorKind::BackendRejected {
            status: Some(status),
            message: backend_message(text),
        });
    }
    decode_stream(reply.body)
}

/// Pulls `error` out of an `{"error": "..."}` body, else keeps the raw text.
fn backend_message(text: String) -> String {
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text)
}

/// Cloneable view of a session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn model(&self) -> &ModelId {
        &self.shared.model
    }

    pub fn prompt(&self) -> &str {
        &self.shared.prompt
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.snapshot.borrow().status.clone()
    }

    pub fn text(&self) -> String {
        self.shared.snapshot.borrow().text.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        !self.shared.snapshot.borrow().status.is_terminal()
    }

    /// Receives the snapshot every time status or text changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Ends the session as `Cancelled` with whatever text it has so far.
    /// Returns `false` (and does nothing) if it had already ended.
    pub fn cancel(&self) -> bool {
        self.shared.finish(SessionStatus::Cancelled, None)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("model", &self.shared.model)
            .field("status", &self.status())
            .finish()
    }
}
