//! Model selection and reachability.
//!
//! `Disconnected -> Connecting -> Connected | Failed`, driven by `connect`,
//! `disconnect` and `eject`. Each transition happens inside one critical
//! section so readers only ever see whole states.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{GenerateRequest, GENERATE_PATH};
use crate::catalog::ModelId;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::session::SessionHandle;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(ModelId),
    Connected(ModelId),
    Failed(ModelId, ErrorKind),
}

impl ConnectionState {
    pub fn model(&self) -> Option<&ModelId> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting(model)
            | ConnectionState::Connected(model)
            | ConnectionState::Failed(model, _) => Some(model),
        }
    }
}

/// Settings every generation issued through this connection shares.
#[derive(Debug, Clone, Default)]
pub struct GenerationSettings {
    pub first_byte_timeout: Option<Duration>,
    pub keep_alive: Option<String>,
}

#[derive(Default)]
struct ProbeSlot {
    attempt: u64,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct SessionRegistry {
    epoch: u64,
    sessions: Vec<SessionHandle>,
}

/// Resolves a `Connecting` state whose `connect` future was dropped before
/// the probe finished.
struct PendingProbe<'a> {
    connection: &'a InferenceConnection,
    attempt: u64,
    model: &'a ModelId,
    armed: bool,
}

impl Drop for PendingProbe<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let connection = self.connection;
        let mut probe = connection.probe.lock().unwrap_or_else(|e| e.into_inner());
        if probe.attempt != self.attempt {
            return;
        }
        if let Some(cancel) = probe.cancel.take() {
            cancel.cancel();
        }
        let kind = ErrorKind::unreachable("connect was abandoned before the probe finished");
        let model = self.model;
        let resolved = connection.state.send_if_modified(|state| {
            if *state != ConnectionState::Connecting(model.clone()) {
                return false;
            }
            *state = ConnectionState::Failed(model.clone(), kind);
            true
        });
        if resolved {
            warn!(model = %model, "connect dropped mid-probe");
        }
    }
}

/// The single live connection of an application session.
///
/// A second `connect` while one is still probing is rejected with
/// `AlreadyConnecting`; it never supersedes the first.
pub struct InferenceConnection {
    transport: Arc<dyn Transport>,
    probe_timeout: Duration,
    settings: GenerationSettings,
    state: watch::Sender<ConnectionState>,
    probe: Mutex<ProbeSlot>,
    registry: Mutex<SessionRegistry>,
}

impl InferenceConnection {
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let settings = GenerationSettings {
            first_byte_timeout: config.generation_first_byte_timeout(),
            keep_alive: config.keep_alive.clone(),
        };
        Self::with_settings(transport, config.probe_timeout(), settings)
    }

    pub fn with_settings(
        transport: Arc<dyn Transport>,
        probe_timeout: Duration,
        settings: GenerationSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            probe_timeout,
            settings,
            state,
            probe: Mutex::new(ProbeSlot::default()),
            registry: Mutex::new(SessionRegistry::default()),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receives every state change from now on.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The bound model, only while `Connected`.
    pub fn current_model(&self) -> Option<ModelId> {
        match &*self.state.borrow() {
            ConnectionState::Connected(model) => Some(model.clone()),
            _ => None,
        }
    }

    /// Selects `model` and probes the backend with a load-only generation
    /// request.
    ///
    /// Returns `NotConnected` when a `disconnect` or `eject` lands while the
    /// probe is in flight; the state then stays `Disconnected`.
    pub async fn connect(&self, model: impl Into<ModelId>) -> Result<(), ErrorKind> {
        let model = model.into();
        let body = GenerateRequest::load(model.clone())?
            .with_keep_alive(self.settings.keep_alive.clone())
            .to_body()?;

        let (attempt, cancel) = {
            let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
            let started = self.state.send_if_modified(|state| {
                if matches!(state, ConnectionState::Connecting(_)) {
                    return false;
                }
                *state = ConnectionState::Connecting(model.clone());
                true
            });
            if !started {
                debug!(model = %model, "connect rejected, another probe is running");
                return Err(ErrorKind::AlreadyConnecting);
            }
            let cancel = CancellationToken::new();
            probe.attempt += 1;
            probe.cancel = Some(cancel.clone());
            (probe.attempt, cancel)
        };
        info!(model = %model, "connecting");

        let mut pending = PendingProbe {
            connection: self,
            attempt,
            model: &model,
            armed: true,
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.probe(body) => Some(result),
        };
        pending.armed = false;

        let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        let result = match result {
            Some(result) if probe.attempt == attempt && probe.cancel.is_some() => result,
            _ => {
                debug!(model = %model, "probe abandoned by disconnect");
                return Err(ErrorKind::NotConnected);
            }
        };
        probe.cancel = None;

        match result {
            Ok(()) => {
                self.state.send_replace(ConnectionState::Connected(model.clone()));
                info!(model = %model, "connected");
                Ok(())
            }
            Err(kind) => {
                self.state
                    .send_replace(ConnectionState::Failed(model.clone(), kind.clone()));
                warn!(model = %model, error = %kind, "connect failed");
                Err(kind)
            }
        }
    }

    async fn probe(&self, body: Vec<u8>) -> Result<(), ErrorKind> {
        let reply = self
            .transport
            .post_json(GENERATE_PATH, body, Some(self.probe_timeout))
            .await?;
        if !reply.is_success() {
            let status = reply.status;
            return Err(ErrorKind::Unreachable {
                status: Some(status),
                reason: reply.error_text().await,
            });
        }
        // Dropping the reply closes the connection; the load response body
        // carries nothing we need.
        Ok(())
    }

    /// Back to `Disconnected` from any state. Aborts an in-flight probe.
    pub fn disconnect(&self) {
        let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cancel) = probe.cancel.take() {
            cancel.cancel();
        }
        probe.attempt += 1;
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
        if changed {
            info!("disconnected");
        }
    }

    /// `disconnect`, plus cancellation of every generation started through
    /// this connection. Does not wait for the backend.
    pub fn eject(&self) {
        self.disconnect();
        let sessions = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.epoch += 1;
            std::mem::take(&mut registry.sessions)
        };
        let cancelled = sessions.iter().filter(|session| session.cancel()).count();
        info!(cancelled, "ejected");
    }

    /// The eject epoch a new session is started under.
    pub(crate) fn epoch(&self) -> u64 {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).epoch
    }

    /// Tracks `session` so `eject` can cancel it. A session started before an
    /// eject that raced with it is cancelled right away.
    pub(crate) fn register_session(&self, session: SessionHandle, epoch: u64) {
        let stale = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.sessions.retain(SessionHandle::is_active);
            if registry.epoch == epoch {
                registry.sessions.push(session.clone());
                false
            } else {
                true
            }
        };
        if stale {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::decoder::Completion;
    use crate::session::{
        GenerationSession, SessionId, SessionObserver, SessionSnapshot, SessionStatus,
    };
    use crate::transport::testing::{Scripted, ScriptedTransport};
    use std::sync::Weak;

    #[derive(Default)]
    struct Recorder {
        finished: Mutex<Vec<SessionStatus>>,
    }

    impl SessionObserver for Recorder {
        fn session_finished(
            &self,
            _session: SessionId,
            snapshot: &SessionSnapshot,
            _completion: Option<&Completion>,
        ) {
            self.finished.lock().unwrap().push(snapshot.status.clone());
        }
    }

    fn connection(replies: Vec<Scripted>) -> (Arc<ScriptedTransport>, Arc<InferenceConnection>) {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let connection = InferenceConnection::with_settings(
            transport.clone(),
            Duration::from_secs(30),
            GenerationSettings::default(),
        );
        (transport, Arc::new(connection))
    }

    const LOADED: &str = r#"{"model":"llama3","response":"","done":true,"done_reason":"load"}"#;

    #[tokio::test]
    async fn empty_model_is_rejected_without_state_change() {
        let (transport, connection) = connection(vec![Scripted::Body(200, LOADED)]);
        assert_eq!(connection.connect("").await, Err(ErrorKind::InvalidModel));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.connect("llama3").await.unwrap();
        let before = connection.state();
        assert_eq!(connection.connect("  ").await, Err(ErrorKind::InvalidModel));
        assert_eq!(connection.state(), before);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn successful_probe_connects() {
        let (transport, connection) = connection(vec![Scripted::Body(200, LOADED)]);
        connection.connect("llama3").await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected("llama3".into()));
        assert_eq!(connection.current_model(), Some(ModelId::new("llama3")));

        let request = &transport.requests()[0];
        assert_eq!(request.path, GENERATE_PATH);
        let body = request.body.as_ref().unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["prompt"], "");
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn disconnect_and_eject_clear_the_model() {
        let (_, connection) = connection(vec![
            Scripted::Body(200, LOADED),
            Scripted::Body(200, LOADED),
        ]);
        connection.connect("llama3").await.unwrap();
        connection.disconnect();
        assert_eq!(connection.current_model(), None);
        connection.disconnect();
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.connect("llama3").await.unwrap();
        connection.eject();
        assert_eq!(connection.current_model(), None);
    }

    #[tokio::test]
    async fn rejected_probe_fails_with_status() {
        let (_, connection) = connection(vec![Scripted::Body(
            404,
            r#"{"error":"model 'nope' not found"}"#,
        )]);
        let err = connection.connect("nope").await.unwrap_err();
        assert!(matches!(err, ErrorKind::Unreachable { status: Some(404), .. }));
        assert_eq!(
            connection.state(),
            ConnectionState::Failed("nope".into(), err.clone())
        );
        assert_eq!(connection.current_model(), None);
    }

    #[tokio::test]
    async fn transport_failure_fails_connect() {
        let (_, connection) = connection(vec![Scripted::Fail(TransportError::Connect(
            "connection refused".into(),
        ))]);
        let err = connection.connect("llama3").await.unwrap_err();
        assert!(matches!(err, ErrorKind::Unreachable { status: None, .. }));
        assert!(matches!(connection.state(), ConnectionState::Failed(_, _)));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out() {
        let (_, connection) = connection(vec![Scripted::Hang]);
        let err = connection.connect("llama3").await.unwrap_err();
        assert!(matches!(err, ErrorKind::Unreachable { .. }));
        assert!(matches!(connection.state(), ConnectionState::Failed(_, _)));
    }

    #[tokio::test]
    async fn second_connect_while_probing_is_rejected() {
        let (_, connection) = connection(vec![Scripted::Hang]);
        let first = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.connect("llama3").await })
        };
        connection
            .subscribe()
            .wait_for(|s| matches!(s, ConnectionState::Connecting(_)))
            .await
            .unwrap();

        assert_eq!(
            connection.connect("phi3").await,
            Err(ErrorKind::AlreadyConnecting)
        );
        assert_eq!(connection.state(), ConnectionState::Connecting("llama3".into()));

        connection.disconnect();
        assert_eq!(first.await.unwrap(), Err(ErrorKind::NotConnected));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connect_does_not_leave_connecting() {
        let (_, connection) = connection(vec![Scripted::Hang, Scripted::Body(200, LOADED)]);
        let dropped =
            tokio::time::timeout(Duration::from_secs(1), connection.connect("llama3")).await;
        assert!(dropped.is_err());
        assert!(matches!(
            connection.state(),
            ConnectionState::Failed(_, ErrorKind::Unreachable { .. })
        ));

        connection.connect("llama3").await.unwrap();
        assert_eq!(connection.current_model(), Some(ModelId::new("llama3")));
    }

    #[tokio::test]
    async fn aborted_connect_task_resolves_state() {
        let (_, connection) = connection(vec![Scripted::Hang]);
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.connect("llama3").await })
        };
        connection
            .subscribe()
            .wait_for(|s| matches!(s, ConnectionState::Connecting(_)))
            .await
            .unwrap();

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(matches!(connection.state(), ConnectionState::Failed(_, _)));
    }

    #[tokio::test]
    async fn session_registered_under_a_stale_epoch_is_cancelled() {
        let (transport, connection) = connection(vec![Scripted::Body(200, LOADED)]);
        connection.connect("llama3").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let observer: Weak<dyn SessionObserver> = Arc::downgrade(&recorder) as Weak<dyn SessionObserver>;
        let request = GenerateRequest::new(ModelId::new("llama3"), "hello").unwrap();
        let session =
            GenerationSession::start(connection.transport(), request, None, Some(observer));
        let handle = session.handle();

        let epoch = connection.epoch();
        connection.eject();
        connection.register_session(handle.clone(), epoch);

        assert_eq!(handle.status(), SessionStatus::Cancelled);
        assert_eq!(
            recorder.finished.lock().unwrap().as_slice(),
            &[SessionStatus::Cancelled]
        );
        let snapshot = session.wait().await;
        assert_eq!(snapshot.status, SessionStatus::Cancelled);
        // only the connect probe went out
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn session_registered_under_the_current_epoch_is_kept() {
        let (_, connection) = connection(vec![Scripted::Body(200, LOADED)]);
        connection.connect("llama3").await.unwrap();
        let session =
            GenerationSession::for_prompt(connection.transport(), "llama3".into(), "hi", None)
                .unwrap();
        let handle = session.handle();

        connection.register_session(handle.clone(), connection.epoch());
        assert!(handle.is_active());
        connection.eject();
        assert_eq!(handle.status(), SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn connect_switches_models_from_connected_and_failed() {
        let (_, connection) = connection(vec![
            Scripted::Body(200, LOADED),
            Scripted::Body(500, "out of memory"),
            Scripted::Body(200, LOADED),
        ]);
        connection.connect("llama3").await.unwrap();
        assert!(connection.connect("mixtral").await.is_err());
        connection.connect("phi3").await.unwrap();
        assert_eq!(connection.current_model(), Some(ModelId::new("phi3")));
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let (_, connection) = connection(vec![Scripted::Body(200, LOADED)]);
        let mut rx = connection.subscribe();
        connection.connect("llama3").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected("llama3".into()));
    }
}
