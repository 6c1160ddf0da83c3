//! Live protocol sessions.
//!
//! A session is created by the handshake on the single-shot transport, or in
//! the `Uninitialized` phase when a stream opens. It is bound to exactly one
//! exchange and, once active, to that exchange's adapter instance.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{mpsc, MutexGuard},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{adapters::KnowledgeAdapter, config::SessionSettings, logging::token_hint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Active,
    Closed,
}

/// Which exchange a session talks to, and how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub exchange_id: Uuid,
    pub slug: String,
    /// Set when the session was opened through a packet key.
    pub packet_key_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Buffered,
    /// The session is closed; the message was discarded.
    Dropped,
}

struct SessionState {
    phase: SessionPhase,
    adapter: Option<Arc<dyn KnowledgeAdapter>>,
    protocol_version: Option<String>,
    client_info: Option<Value>,
    last_activity: Instant,
    transport: Option<mpsc::Sender<Value>>,
    buffer: VecDeque<Value>,
}

pub struct Session {
    token: String,
    binding: ExchangeBinding,
    created_at: DateTime<Utc>,
    buffer_capacity: usize,
    state: Mutex<SessionState>,
    requests: tokio::sync::Mutex<()>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &token_hint(&self.token))
            .field("binding", &self.binding)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Session {
    fn new(binding: ExchangeBinding, buffer_capacity: usize) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            binding,
            created_at: Utc::now(),
            buffer_capacity: buffer_capacity.max(1),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                adapter: None,
                protocol_version: None,
                client_info: None,
                last_activity: Instant::now(),
                transport: None,
                buffer: VecDeque::new(),
            }),
            requests: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn binding(&self) -> &ExchangeBinding {
        &self.binding
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn adapter(&self) -> Option<Arc<dyn KnowledgeAdapter>> {
        self.state.lock().adapter.clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.state.lock().protocol_version.clone()
    }

    pub fn client_info(&self) -> Option<Value> {
        self.state.lock().client_info.clone()
    }

    /// Completes the handshake. A repeated `initialize` rebinds the same
    /// adapter and version.
    pub fn activate(
        &self,
        adapter: Arc<dyn KnowledgeAdapter>,
        protocol_version: String,
        client_info: Option<Value>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Closed {
            return false;
        }
        state.phase = SessionPhase::Active;
        state.adapter = Some(adapter);
        state.protocol_version = Some(protocol_version);
        state.client_info = client_info;
        true
    }

    /// Fires once the session is closed. Streams end on it.
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_activity)
    }

    /// Held for the duration of one dispatch so requests within a session
    /// run in arrival order.
    pub async fn lock_requests(&self) -> MutexGuard<'_, ()> {
        self.requests.lock().await
    }

    /// Sends `message` on the live stream, or buffers it when no stream is
    /// attached. The buffer drops its oldest entry when full.
    pub fn deliver(&self, message: Value) -> Delivery {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Closed {
            return Delivery::Dropped;
        }

        flush(&mut state);
        let mut pending = message;
        if state.buffer.is_empty() {
            if let Some(sender) = state.transport.clone() {
                match sender.try_send(pending) {
                    Ok(()) => return Delivery::Sent,
                    Err(mpsc::error::TrySendError::Full(message)) => pending = message,
                    Err(mpsc::error::TrySendError::Closed(message)) => {
                        state.transport = None;
                        pending = message;
                    }
                }
            }
        }

        if state.buffer.len() >= self.buffer_capacity {
            state.buffer.pop_front();
            tracing::warn!(
                session = %token_hint(&self.token),
                capacity = self.buffer_capacity,
                "session buffer full, dropping oldest message"
            );
        }
        state.buffer.push_back(pending);
        Delivery::Buffered
    }

    /// Attaches a stream and drains buffered messages into it, oldest first.
    pub fn attach_transport(&self, sender: mpsc::Sender<Value>) {
        let mut state = self.state.lock();
        state.transport = Some(sender);
        flush(&mut state);
    }

    /// Detaches `sender` unless a newer stream has replaced it.
    pub fn detach_transport(&self, sender: &mpsc::Sender<Value>) {
        let mut state = self.state.lock();
        if state
            .transport
            .as_ref()
            .is_some_and(|current| current.same_channel(sender))
        {
            state.transport = None;
        }
    }

    pub fn has_transport(&self) -> bool {
        self.state
            .lock()
            .transport
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.phase = SessionPhase::Closed;
        state.adapter = None;
        state.transport = None;
        state.buffer.clear();
        drop(state);
        self.closed.cancel();
    }
}

fn flush(state: &mut SessionState) {
    let Some(sender) = state.transport.clone() else {
        return;
    };
    while let Some(message) = state.buffer.pop_front() {
        match sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                state.buffer.push_front(message);
                return;
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                state.buffer.push_front(message);
                state.transport = None;
                return;
            }
        }
    }
}

/// Owns every live session. Map locks are never held across an await.
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn create(&self, binding: ExchangeBinding) -> Arc<Session> {
        let session = Arc::new(Session::new(binding, self.settings.buffer_capacity));
        self.sessions
            .lock()
            .insert(session.token.clone(), Arc::clone(&session));
        tracing::info!(
            session = %token_hint(&session.token),
            exchange = %session.binding.slug,
            "session created"
        );
        session
    }

    /// Looks up a live session and refreshes its activity timestamp.
    pub fn resolve(&self, token: &str) -> Option<Arc<Session>> {
        let session = self.sessions.lock().get(token).cloned()?;
        session.touch();
        Some(session)
    }

    pub fn close(&self, token: &str) -> bool {
        let removed = self.sessions.lock().remove(token);
        match removed {
            Some(session) => {
                session.close();
                tracing::info!(session = %token_hint(token), "session closed");
                true
            }
            None => false,
        }
    }

    /// Closes every session bound to `exchange_id`.
    pub fn close_exchange(&self, exchange_id: Uuid) -> usize {
        let removed = self.remove_where(|session| session.binding.exchange_id == exchange_id);
        removed.len()
    }

    /// Evicts sessions idle for at least the configured timeout.
    pub fn sweep_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let idle_timeout = self.settings.idle_timeout;
        let removed = self.remove_where(|session| session.idle_for(now) >= idle_timeout);
        if !removed.is_empty() {
            tracing::info!(evicted = removed.len(), "idle sessions evicted");
        }
        removed
    }

    pub fn shutdown(&self) -> usize {
        let removed = self.remove_where(|_| true);
        tracing::info!(closed = removed.len(), "all sessions closed");
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, predicate: impl Fn(&Session) -> bool) -> Vec<String> {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            let tokens: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| predicate(session))
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| sessions.remove(token))
                .collect()
        };

        removed
            .into_iter()
            .map(|session| {
                session.close();
                session.token.clone()
            })
            .collect()
    }
}

pub fn spawn_idle_sweeper(
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(manager.settings.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    manager.sweep_idle();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adapters::filesystem::FilesystemAdapter;

    fn binding(slug: &str) -> ExchangeBinding {
        ExchangeBinding {
            exchange_id: Uuid::new_v4(),
            slug: slug.to_string(),
            packet_key_hint: None,
        }
    }

    fn settings(idle_secs: u64, buffer_capacity: usize) -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::from_secs(idle_secs),
            sweep_interval: Duration::from_secs(1),
            buffer_capacity,
        }
    }

    fn adapter(dir: &tempfile::TempDir) -> Arc<dyn KnowledgeAdapter> {
        Arc::new(
            FilesystemAdapter::from_config(&json!({ "root_path": dir.path() })).expect("adapter"),
        )
    }

    #[test]
    fn tokens_are_unique_and_sessions_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(settings(60, 4));
        let first = manager.create(binding("alpha"));
        let second = manager.create(binding("beta"));

        assert_ne!(first.token(), second.token());
        assert!(first.activate(adapter(&dir), "2025-03-26".to_string(), None));

        assert_eq!(first.phase(), SessionPhase::Active);
        assert_eq!(second.phase(), SessionPhase::Uninitialized);
        assert!(second.adapter().is_none());
        assert_eq!(
            manager.resolve(second.token()).expect("live").binding().slug,
            "beta"
        );
    }

    #[test]
    fn closed_session_cannot_be_resolved_or_activated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::new(settings(60, 4));
        let session = manager.create(binding("alpha"));
        let token = session.token().to_string();

        assert!(manager.close(&token));
        assert!(!manager.close(&token));
        assert!(manager.resolve(&token).is_none());
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!session.activate(adapter(&dir), "2025-03-26".to_string(), None));
        assert_eq!(session.deliver(json!({})), Delivery::Dropped);
        assert!(session.closed_signal().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted() {
        let manager = SessionManager::new(settings(30, 4));
        let idle = manager.create(binding("alpha"));
        let busy = manager.create(binding("beta"));

        tokio::time::advance(Duration::from_secs(20)).await;
        manager.resolve(busy.token()).expect("busy session");
        tokio::time::advance(Duration::from_secs(15)).await;

        let evicted = manager.sweep_idle();
        assert_eq!(evicted, vec![idle.token().to_string()]);
        assert_eq!(idle.phase(), SessionPhase::Closed);
        assert!(manager.resolve(busy.token()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_stops_on_cancellation() {
        let manager = Arc::new(SessionManager::new(settings(5, 4)));
        manager.create(binding("alpha"));
        let shutdown = CancellationToken::new();
        let handle = spawn_idle_sweeper(Arc::clone(&manager), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(manager.is_empty());

        shutdown.cancel();
        handle.await.expect("sweeper exits");
    }

    #[tokio::test]
    async fn buffered_messages_drain_on_reattach() {
        let manager = SessionManager::new(settings(60, 2));
        let session = manager.create(binding("alpha"));

        assert_eq!(session.deliver(json!({ "n": 1 })), Delivery::Buffered);
        assert_eq!(session.deliver(json!({ "n": 2 })), Delivery::Buffered);
        assert_eq!(session.deliver(json!({ "n": 3 })), Delivery::Buffered);
        assert_eq!(session.buffered(), 2);

        let (sender, mut receiver) = mpsc::channel(8);
        session.attach_transport(sender);
        assert_eq!(receiver.recv().await, Some(json!({ "n": 2 })));
        assert_eq!(receiver.recv().await, Some(json!({ "n": 3 })));

        assert_eq!(session.deliver(json!({ "n": 4 })), Delivery::Sent);
        assert_eq!(receiver.recv().await, Some(json!({ "n": 4 })));
    }

    #[tokio::test]
    async fn stale_stream_does_not_detach_its_replacement() {
        let manager = SessionManager::new(settings(60, 4));
        let session = manager.create(binding("alpha"));
        let (old_sender, _old_receiver) = mpsc::channel(8);
        let (new_sender, mut new_receiver) = mpsc::channel(8);

        session.attach_transport(old_sender.clone());
        session.attach_transport(new_sender);
        session.detach_transport(&old_sender);

        assert_eq!(session.deliver(json!({ "n": 1 })), Delivery::Sent);
        assert_eq!(new_receiver.recv().await, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn dropped_stream_falls_back_to_buffer() {
        let manager = SessionManager::new(settings(60, 4));
        let session = manager.create(binding("alpha"));
        let (sender, receiver) = mpsc::channel(8);
        session.attach_transport(sender);
        drop(receiver);

        assert_eq!(session.deliver(json!({ "n": 1 })), Delivery::Buffered);
        assert!(!session.has_transport());
    }

    #[test]
    fn shutdown_closes_everything() {
        let manager = SessionManager::new(settings(60, 4));
        let sessions: Vec<_> = (0..3).map(|_| manager.create(binding("alpha"))).collect();
        assert_eq!(manager.shutdown(), 3);
        assert!(sessions
            .iter()
            .all(|session| session.phase() == SessionPhase::Closed));
    }
}
