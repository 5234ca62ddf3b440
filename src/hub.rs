pub mod msg;
pub mod ws;

use crate::credential::{CredentialError, TokenSource};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Protocol(#[from] msg::Error),
    #[error("no message from the hub within {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("stopped before the handshake finished")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the transport reports after a successful start. Lifecycle variants
/// drive [`ConnectionState`]; invocations are only delivered for targets
/// registered with [`Transport::on`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Reconnecting(String),
    Reconnected,
    Closed(Option<String>),
    Invocation { target: String, arguments: Vec<Value> },
}

/// A connection attempt in flight. Dropping it abandons the attempt; the
/// transport still has to be stopped.
pub type Handshake = BoxFuture<'static, Result<Receiver<TransportEvent>>>;

pub trait Transport: Send {
    /// Begins connecting. Targets registered with [`Transport::on`] before
    /// this call are in force from the first delivered message.
    fn start(&mut self, tokens: Arc<dyn TokenSource>) -> Handshake;

    fn on(&mut self, target: &str);

    fn off_all(&mut self);

    fn stop(&mut self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    Connected,
    AlreadyActive(ConnectionState),
}

pub struct ConnectionManager<T> {
    transport: T,
    tokens: Arc<dyn TokenSource>,
    targets: Vec<String>,
    state: ConnectionState,
    subscribed: bool,
    events: Option<Receiver<TransportEvent>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new<I, S>(transport: T, tokens: Arc<dyn TokenSource>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transport,
            tokens,
            targets: targets.into_iter().map(Into::into).collect(),
            state: ConnectionState::Disconnected,
            subscribed: false,
            events: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn start(&mut self) -> Result<Started> {
        match self.begin_start() {
            Ok(handshake) => {
                let opened = handshake.await;
                self.finish_start(opened)
            }
            Err(active) => Ok(active),
        }
    }

    /// Moves to `Connecting` and hands back the handshake for the caller to
    /// drive. Handlers are registered before the transport starts so nothing
    /// delivered right after the handshake is missed.
    pub fn begin_start(&mut self) -> std::result::Result<Handshake, Started> {
        if self.state != ConnectionState::Disconnected {
            tracing::debug!(state = %self.state, "start ignored, connection already active");
            return Err(Started::AlreadyActive(self.state));
        }

        self.state = ConnectionState::Connecting;
        self.subscribe_once();
        Ok(self.transport.start(self.tokens.clone()))
    }

    /// Applies the outcome of a handshake from [`Self::begin_start`]. An
    /// outcome arriving after `stop()` is discarded.
    pub fn finish_start(&mut self, opened: Result<Receiver<TransportEvent>>) -> Result<Started> {
        if self.state != ConnectionState::Connecting {
            tracing::debug!(state = %self.state, "handshake finished after stop, discarding");
            return Err(Error::Stopped);
        }

        match opened {
            Ok(events) => {
                self.events = Some(events);
                self.state = ConnectionState::Connected;
                tracing::info!("connected to notification hub");
                Ok(Started::Connected)
            }
            Err(error) => {
                self.state = ConnectionState::Disconnected;
                tracing::warn!(%error, "could not connect to notification hub");
                Err(error)
            }
        }
    }

    fn subscribe_once(&mut self) {
        if self.subscribed {
            return;
        }
        for target in &self.targets {
            self.transport.on(target);
        }
        self.subscribed = true;
    }

    /// Waits for the next transport event and applies its lifecycle effect.
    /// Never resolves while no channel is open.
    pub async fn next_event(&mut self) -> TransportEvent {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        let event = events.recv().await.unwrap_or(TransportEvent::Closed(None));

        match &event {
            TransportEvent::Reconnecting(reason) => {
                tracing::warn!(%reason, "connection lost, reconnecting");
                self.state = ConnectionState::Reconnecting;
            }
            TransportEvent::Reconnected => {
                tracing::info!("reconnected to notification hub");
                self.state = ConnectionState::Connected;
            }
            TransportEvent::Closed(reason) => {
                tracing::warn!(reason = ?reason, "notification hub connection closed");
                self.state = ConnectionState::Disconnected;
                self.events = None;
            }
            TransportEvent::Invocation { .. } => {}
        }
        event
    }

    pub async fn stop(&mut self) {
        if self.state == ConnectionState::Disconnected && self.events.is_none() && !self.subscribed
        {
            return;
        }
        self.transport.off_all();
        self.transport.stop().await;
        self.subscribed = false;
        self.events = None;
        self.state = ConnectionState::Disconnected;
        tracing::info!("notification hub connection stopped");
    }
}
