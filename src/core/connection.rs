//! Per-target connection.
//!
//! A `RunspaceConnection` owns the session to one target and moves through
//! an explicit state machine:
//!
//! ```text
//! BeforeOpen -> Opening -> Opened | Broken
//! Opened -> Closing -> Closed
//! Opened -> Disconnecting -> Disconnected -> Reconnecting -> Opened | Broken
//! ```
//!
//! Every change goes through one transition function and is published on a
//! watch channel. Opening never returns an error: failures become `Broken`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::descriptor::ConnectionDescriptor;
use crate::transport::{RemoteSession, RetryNotification, Transport, TransportError};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    BeforeOpen,
    Opening,
    Opened,
    Closing,
    Closed,
    Disconnecting,
    Disconnected,
    Reconnecting,
    Broken,
}

impl ConnectionState {
    /// `Closed` and `Broken` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Broken)
    }

    /// Whether an open or reconnect attempt is in flight.
    pub fn is_connecting(self) -> bool {
        matches!(self, Self::Opening | Self::Reconnecting)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            BeforeOpen, Broken, Closed, Closing, Disconnected, Disconnecting, Opened, Opening, Reconnecting,
        };
        matches!(
            (self, next),
            (BeforeOpen, Opening | Closed)
                | (Opening, Opened | Broken | Closing)
                | (Opened, Closing | Disconnecting | Broken)
                | (Disconnecting, Disconnected | Broken)
                | (Disconnected, Reconnecting | Closing | Broken)
                | (Reconnecting, Opened | Broken | Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeOpen => "BeforeOpen",
            Self::Opening => "Opening",
            Self::Opened => "Opened",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Disconnecting => "Disconnecting",
            Self::Disconnected => "Disconnected",
            Self::Reconnecting => "Reconnecting",
            Self::Broken => "Broken",
        };
        f.write_str(name)
    }
}

/// Current state plus the reason for the last failure, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateInfo {
    pub state: ConnectionState,
    pub reason: Option<String>,
}

/// Errors from connection verbs.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("cannot move connection from {from} to {to}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },

    #[error("connection has no session")]
    NoSession,

    #[error("connection attempt was aborted")]
    Aborted,

    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A logical channel to one target.
pub struct RunspaceConnection {
    id: Uuid,
    descriptor: Arc<ConnectionDescriptor>,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionStateInfo>,
    session: Mutex<Option<Arc<dyn RemoteSession>>>,
    pending: Mutex<Option<CancellationToken>>,
    retry_tx: broadcast::Sender<RetryNotification>,
    relay_stop: CancellationToken,
    disposed: AtomicBool,
}

impl fmt::Debug for RunspaceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunspaceConnection")
            .field("id", &self.id)
            .field("target", &self.descriptor.target)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish()
    }
}

impl RunspaceConnection {
    /// Create a connection in `BeforeOpen`.
    pub fn new(descriptor: impl Into<Arc<ConnectionDescriptor>>, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionStateInfo { state: ConnectionState::BeforeOpen, reason: None });
        let (retry_tx, _) = broadcast::channel(64);
        Self {
            id: Uuid::new_v4(),
            descriptor: descriptor.into(),
            transport,
            state,
            session: Mutex::new(None),
            pending: Mutex::new(None),
            retry_tx,
            relay_stop: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().state
    }

    pub fn state_info(&self) -> ConnectionStateInfo {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStateInfo> {
        self.state.subscribe()
    }

    /// Retry notifications of the current session, re-broadcast.
    ///
    /// Available before the session exists, so observers can attach early.
    pub fn retry_notifications(&self) -> broadcast::Receiver<RetryNotification> {
        self.retry_tx.subscribe()
    }

    /// The open session, if any.
    pub fn session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.session.lock().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The single entry point for state changes.
    fn transition(&self, to: ConnectionState, reason: Option<String>) -> Result<(), ConnectionError> {
        let mut result = Ok(());
        self.state.send_if_modified(|info| {
            if !info.state.can_transition_to(to) {
                result = Err(ConnectionError::InvalidTransition { from: info.state, to });
                return false;
            }
            tracing::debug!(
                connection_id = %self.id,
                target = %self.descriptor.target,
                from = %info.state,
                to = %to,
                "Connection state changed"
            );
            *info = ConnectionStateInfo { state: to, reason };
            true
        });
        result
    }

    /// Open the connection.
    ///
    /// Resolves to `Opened` on success, `Broken` on transport failure or
    /// timeout, and `Closed` if the attempt was aborted.
    pub async fn open(&self) -> ConnectionState {
        let token = CancellationToken::new();
        *self.pending.lock() = Some(token.clone());
        if let Err(err) = self.transition(ConnectionState::Opening, None) {
            self.pending.lock().take();
            tracing::warn!(connection_id = %self.id, error = %err, "Open ignored");
            return self.state();
        }

        let timeout = self.descriptor.options.open_timeout();
        let result = tokio::select! {
            () = token.cancelled() => None,
            opened = tokio::time::timeout(timeout, self.transport.open(&self.descriptor)) => Some(opened),
        };
        self.pending.lock().take();

        match result {
            None => self.finish_aborted(),
            Some(Ok(Ok(session))) => {
                self.attach_session(session);
                if self.transition(ConnectionState::Opened, None).is_err() {
                    self.release_session().await;
                }
            }
            Some(Ok(Err(err))) => {
                tracing::warn!(connection_id = %self.id, target = %self.descriptor.target, error = %err, "Open failed");
                self.mark_broken(err.to_string());
            }
            Some(Err(_)) => {
                let reason = format!("open timed out after {}s", timeout.as_secs());
                tracing::warn!(connection_id = %self.id, target = %self.descriptor.target, "Open timed out");
                self.mark_broken(reason);
            }
        }
        self.state()
    }

    /// Close the connection. No-op once `Closed` or `Broken`.
    pub async fn close(&self) {
        loop {
            let state = self.state();
            match state {
                ConnectionState::Closed | ConnectionState::Broken => return,
                ConnectionState::BeforeOpen => {
                    if self.transition(ConnectionState::Closed, None).is_ok() {
                        return;
                    }
                }
                ConnectionState::Opening | ConnectionState::Reconnecting => {
                    self.abort_open();
                    self.wait_for_change(state).await;
                }
                ConnectionState::Closing => {
                    self.wait_for_terminal().await;
                    return;
                }
                ConnectionState::Disconnecting => self.wait_for_change(state).await,
                ConnectionState::Opened | ConnectionState::Disconnected => {
                    if self.transition(ConnectionState::Closing, None).is_err() {
                        continue;
                    }
                    self.release_session().await;
                    let _ = self.transition(ConnectionState::Closed, None);
                    return;
                }
            }
        }
    }

    /// Close a connection that was never opened. Returns false otherwise.
    pub fn close_unopened(&self) -> bool {
        self.transition(ConnectionState::Closed, None).is_ok()
    }

    /// Detach from the target. Only valid from `Opened`.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Disconnecting, None)?;
        let Some(session) = self.session() else {
            self.mark_broken("no session to disconnect");
            return Err(ConnectionError::NoSession);
        };
        match session.disconnect().await {
            Ok(()) => self.transition(ConnectionState::Disconnected, None),
            Err(err) => {
                self.mark_broken(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Record that the transport disconnected on its own.
    pub fn note_auto_disconnect(&self) {
        if self.state() == ConnectionState::Opened {
            let _ = self.transition(ConnectionState::Disconnecting, Some("retry budget exhausted".to_string()));
        }
        let _ = self.transition(ConnectionState::Disconnected, Some("retry budget exhausted".to_string()));
    }

    /// Re-attach a disconnected connection. Only valid from `Disconnected`.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let token = CancellationToken::new();
        *self.pending.lock() = Some(token.clone());
        if let Err(err) = self.transition(ConnectionState::Reconnecting, None) {
            self.pending.lock().take();
            return Err(err);
        }
        let Some(session) = self.session() else {
            self.pending.lock().take();
            self.mark_broken("no session to reconnect");
            return Err(ConnectionError::NoSession);
        };

        let timeout = self.descriptor.options.open_timeout();
        let result = tokio::select! {
            () = token.cancelled() => None,
            reconnected = tokio::time::timeout(timeout, session.reconnect()) => Some(reconnected),
        };
        self.pending.lock().take();

        match result {
            None => {
                self.finish_aborted();
                Err(ConnectionError::Aborted)
            }
            Some(Ok(Ok(()))) => self.transition(ConnectionState::Opened, None),
            Some(Ok(Err(err))) => {
                let reason = err.to_string();
                self.mark_broken(reason.clone());
                Err(ConnectionError::ReconnectFailed(reason))
            }
            Some(Err(_)) => {
                let reason = format!("reconnect timed out after {}s", timeout.as_secs());
                self.mark_broken(reason.clone());
                Err(ConnectionError::ReconnectFailed(reason))
            }
        }
    }

    /// Move to `Broken` from any state that allows it.
    pub fn mark_broken(&self, reason: impl Into<String>) -> bool {
        let broken = self.transition(ConnectionState::Broken, Some(reason.into())).is_ok();
        if broken {
            self.session.lock().take();
            self.relay_stop.cancel();
        }
        broken
    }

    /// Cancel an in-flight open or reconnect. Returns true if one was pending.
    pub fn abort_open(&self) -> bool {
        match self.pending.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the connection is `Closed` or `Broken`.
    pub async fn wait_for_terminal(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|info| info.state.is_terminal()).await.map(|info| info.state);
        result.unwrap_or_else(|_| self.state())
    }

    /// Drop the session and stop relaying. Returns false if already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.relay_stop.cancel();
        self.session.lock().take();
        tracing::debug!(connection_id = %self.id, state = %self.state(), "Connection disposed");
        true
    }

    async fn wait_for_change(&self, from: ConnectionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|info| info.state != from).await;
    }

    fn finish_aborted(&self) {
        let reason = Some("connection attempt aborted".to_string());
        let _ = self.transition(ConnectionState::Closing, reason.clone());
        let _ = self.transition(ConnectionState::Closed, reason);
        self.session.lock().take();
    }

    async fn release_session(&self) {
        let session = self.session.lock().take();
        self.relay_stop.cancel();
        if let Some(session) = session {
            if let Err(err) = session.close().await {
                tracing::warn!(connection_id = %self.id, error = %err, "Session close failed");
            }
        }
    }

    fn attach_session(&self, session: Arc<dyn RemoteSession>) {
        let mut notifications = session.retry_notifications();
        *self.session.lock() = Some(session);

        let relay = self.retry_tx.clone();
        let stop = self.relay_stop.clone();
        let id = self.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    received = notifications.recv() => match received {
                        Ok(notification) => {
                            tracing::debug!(connection_id = %id, ?notification, "Retry notification");
                            let _ = relay.send(notification);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(connection_id = %id, skipped, "Retry notifications lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }
}
