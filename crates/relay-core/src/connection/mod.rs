//! Messaging-network connection lifecycle.
//!
//! One [`ConnectionManager`] owns one [`MessagingClient`]. Client events are funnelled
//! through a channel into a single event-loop task, which is the only place that applies
//! [`state::transition`]. State is published on a `watch` channel so readers always get
//! a consistent snapshot without blocking the loop.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatAddress, ClientId, PairingCode, SessionBlob},
    errors::Error,
    store::SessionStore,
    Result,
};

pub mod client;
pub mod state;

pub use client::{BridgeInvocation, EventSender, MessagingClient};
pub use state::{ClientEvent, ConnectionState, DisconnectReason};

use state::{transition, Effect};

/// Per-call send failure; never retried internally.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("WhatsApp client is not ready")]
    NotReady,
    #[error("send timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
}

struct EventLoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ConnectionManager {
    client: Arc<dyn MessagingClient>,
    store: Option<Arc<dyn SessionStore>>,
    client_id: ClientId,
    state: Arc<watch::Sender<ConnectionState>>,
    event_loop: Mutex<Option<EventLoopHandle>>,
}

impl ConnectionManager {
    /// `store` is `None` when persistence is unavailable; the session then lives in
    /// memory only and is lost on restart.
    pub fn new(
        client: Arc<dyn MessagingClient>,
        store: Option<Arc<dyn SessionStore>>,
        client_id: ClientId,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            client,
            store,
            client_id,
            state: Arc::new(state),
            event_loop: Mutex::new(None),
        }
    }

    /// Start the client, resuming `existing_session` when given.
    ///
    /// Calling this again re-enters `Uninitialized` and restarts the client. An error
    /// means the client could not be started at all (fatal at process startup).
    pub async fn initialize(&self, existing_session: Option<SessionBlob>) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let resuming = existing_session.is_some();

        {
            let mut guard = self.event_loop.lock().await;
            if let Some(prev) = guard.take() {
                prev.cancel.cancel();
                let _ = prev.handle.await;
            }
            self.state.send_replace(ConnectionState::Uninitialized);

            let event_loop = EventLoop {
                client: self.client.clone(),
                store: self.store.clone(),
                client_id: self.client_id.clone(),
                state: self.state.clone(),
                events: tx.clone(),
                resuming,
                session: existing_session.clone(),
            };
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(event_loop.run(rx, cancel.clone()));
            *guard = Some(EventLoopHandle { cancel, handle });
        }

        if resuming {
            tracing::info!(client_id = %self.client_id, "starting WhatsApp client with saved session");
        } else {
            tracing::info!(client_id = %self.client_id, "starting WhatsApp client; pairing required");
        }

        if let Err(e) = self.client.start(existing_session, tx.clone()).await {
            let _ = tx.send(ClientEvent::Fatal(format!("failed to start client: {e}")));
            return Err(e);
        }
        Ok(())
    }

    /// Wait until the client has left `Uninitialized`.
    ///
    /// A pairing code or an authenticated session counts as started. A client that dies
    /// or disconnects first, or stays silent past `timeout`, is a startup failure.
    pub async fn wait_until_started(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = match tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != ConnectionState::Uninitialized),
        )
        .await
        {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => {
                return Err(Error::External("connection state channel closed".to_string()))
            }
            Err(_) => {
                return Err(Error::External(format!(
                    "client produced neither a pairing code nor a session within {timeout:?}"
                )))
            }
        };

        match state {
            ConnectionState::Disconnected(reason) => Err(Error::External(format!(
                "client failed during startup: {reason}"
            ))),
            _ => Ok(()),
        }
    }

    /// Non-blocking snapshot of the current state.
    pub fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    pub fn pairing_code(&self) -> Option<PairingCode> {
        self.state.borrow().pairing_code().cloned()
    }

    /// Watch state transitions (e.g. to wait for `Ready`).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Single send attempt. Fails fast with `NotReady` without touching the client
    /// unless the connection is `Ready`.
    pub async fn send(&self, to: &ChatAddress, text: &str) -> std::result::Result<(), SendError> {
        if !self.is_ready() {
            return Err(SendError::NotReady);
        }
        self.client
            .send_text(to, text)
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    /// Release the client (terminates the bridge subprocess) and stop the event loop.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.client.shutdown().await;
        if let Some(running) = self.event_loop.lock().await.take() {
            running.cancel.cancel();
            let _ = running.handle.await;
        }
        result
    }
}

struct EventLoop {
    client: Arc<dyn MessagingClient>,
    store: Option<Arc<dyn SessionStore>>,
    client_id: ClientId,
    state: Arc<watch::Sender<ConnectionState>>,
    events: EventSender,
    resuming: bool,
    session: Option<SessionBlob>,
}

impl EventLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ClientEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
              biased;
              _ = cancel.cancelled() => {
                self.state.send_replace(ConnectionState::Disconnected(DisconnectReason::Shutdown));
                break;
              }
              maybe = rx.recv() => {
                let Some(event) = maybe else { break; };
                self.handle(event).await;
              }
            }
        }
    }

    async fn handle(&mut self, event: ClientEvent) {
        let current = self.state.borrow().clone();
        let t = transition(&current, &event, self.resuming);

        match &event {
            ClientEvent::PairingCode(_) => {
                tracing::info!("pairing code received; open /qr and scan it from Linked Devices")
            }
            ClientEvent::AuthFailure(msg) => tracing::error!(%msg, "authentication failed"),
            ClientEvent::Disconnected(reason) => tracing::warn!(%reason, "client disconnected"),
            ClientEvent::Fatal(reason) => tracing::error!(%reason, "client failed"),
            ClientEvent::Authenticated(_) | ClientEvent::Ready => {}
        }
        if t.next != current {
            tracing::info!(
                from = current.label(),
                to = t.next.label(),
                event = event.name(),
                "connection state changed"
            );
        } else if t.effect.is_none() {
            tracing::debug!(state = current.label(), event = event.name(), "event ignored");
        }

        if matches!(
            event,
            ClientEvent::PairingCode(_) | ClientEvent::Authenticated(_)
        ) {
            self.resuming = false;
        }
        self.state.send_replace(t.next);

        match t.effect {
            Some(Effect::RememberSession(session)) => self.session = Some(session),
            Some(Effect::PersistSession) => self.persist_session(),
            Some(Effect::RestartWithoutSession) => self.restart_without_session().await,
            None => {}
        }
    }

    /// Runs in its own task so a slow backend never delays later events.
    fn persist_session(&self) {
        let Some(store) = self.store.clone() else {
            tracing::debug!("no session store; session kept in memory only");
            return;
        };
        let Some(session) = self.session.clone() else {
            tracing::debug!("client handed over no session blob; nothing to persist");
            return;
        };
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            match store.save(&client_id, &session).await {
                Ok(()) => tracing::info!(backend = store.backend().as_str(), "session saved"),
                Err(e) => tracing::warn!(error = %e, "failed to save session"),
            }
        });
    }

    async fn restart_without_session(&mut self) {
        tracing::warn!("saved session was refused; requesting a fresh pairing code");
        self.resuming = false;
        self.session = None;
        if let Some(store) = &self.store {
            match store.delete(&self.client_id).await {
                Ok(()) => tracing::info!("refused session removed from store"),
                Err(e) => tracing::warn!(error = %e, "failed to remove refused session"),
            }
        }
        if let Err(e) = self.client.start(None, self.events.clone()).await {
            tracing::error!(error = %e, "failed to restart client for pairing");
            self.state.send_replace(ConnectionState::Disconnected(DisconnectReason::Fatal(
                format!("failed to restart client: {e}"),
            )));
        }
    }
}
