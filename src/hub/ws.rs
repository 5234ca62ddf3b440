use super::msg::{self, HubMessage, Invocation};
use super::{Error, Handshake, Result, Transport, TransportEvent};
use crate::credential::TokenSource;
use async_stream::stream;
use futures::future::BoxFuture;
use futures::{SinkExt, Stream, StreamExt};
use reqwest::Url;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio::{pin, select};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Delays before each reconnect attempt. Once they are used up the
/// transport reports [`TransportEvent::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn disabled() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            [0, 2_000, 10_000, 30_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        )
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// WebSocket client for the JSON hub protocol.
pub struct WsTransport {
    url: Url,
    policy: ReconnectPolicy,
    keepalive: Duration,
    server_timeout: Duration,
    handlers: Arc<RwLock<HashSet<String>>>,
    running: Option<Running>,
}

impl WsTransport {
    pub fn new(url: &str, policy: ReconnectPolicy) -> Result<Self> {
        let mut url = Url::parse(url).map_err(|error| Error::InvalidUrl(error.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::InvalidUrl(url.to_string()))?;

        Ok(Self {
            url,
            policy,
            keepalive: DEFAULT_KEEPALIVE,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            handlers: Arc::new(RwLock::new(HashSet::new())),
            running: None,
        })
    }

    pub fn with_timeouts(mut self, keepalive: Duration, server_timeout: Duration) -> Self {
        self.keepalive = keepalive;
        self.server_timeout = server_timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for WsTransport {
    fn start(&mut self, tokens: Arc<dyn TokenSource>) -> Handshake {
        let (events, receiver) = channel(64);
        let (shutdown, shutdown_receiver) = oneshot::channel();
        let (opened, opened_receiver) = oneshot::channel();

        let session = Session {
            url: self.url.clone(),
            tokens,
            policy: self.policy.clone(),
            keepalive: self.keepalive,
            server_timeout: self.server_timeout,
            handlers: self.handlers.clone(),
            events,
        };
        let join_handle = tokio::spawn(session.run(shutdown_receiver, opened));
        if let Some(previous) = self.running.replace(Running {
            shutdown,
            join_handle,
        }) {
            previous.join_handle.abort();
        }

        Box::pin(async move {
            match opened_receiver.await {
                Ok(Ok(())) => Ok(receiver),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(Error::Stopped),
            }
        })
    }

    fn on(&mut self, target: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.to_string());
    }

    fn off_all(&mut self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(Running {
                shutdown,
                join_handle,
            }) = self.running.take()
            {
                let _ = shutdown.send(());
                if let Err(error) = join_handle.await {
                    tracing::warn!(%error, "hub session task failed");
                }
            }
        })
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.join_handle.abort()
        }
    }
}

/// An open socket plus any records that shared a frame with the handshake
/// response.
struct Opened {
    socket: Socket,
    backlog: Vec<String>,
}

async fn open(url: &Url, tokens: &dyn TokenSource, timeout: Duration) -> Result<Opened> {
    let token = tokens.access_token()?;
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("access_token", &token);

    time::timeout(timeout, handshake(url))
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

async fn handshake(url: Url) -> Result<Opened> {
    let (mut socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    socket
        .send(Message::Text(msg::handshake_request().into()))
        .await?;

    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                let mut records = msg::records(text.as_str());
                let record = records.next().ok_or(msg::Error::InvalidMessage)?;
                let backlog = records.map(str::to_string).collect();
                return match msg::parse_handshake(record)? {
                    Some(error) => Err(Error::Handshake(error)),
                    None => Ok(Opened { socket, backlog }),
                };
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|frame| frame.reason.as_str().to_string())
                    .unwrap_or_else(|| "closed during handshake".to_string());
                return Err(Error::Handshake(reason));
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => return Err(error.into()),
            None => return Err(Error::Closed),
        }
    }
}

fn messages<S>(mut frames: S) -> impl Stream<Item = Result<HubMessage>>
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    stream! {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    for record in msg::records(text.as_str()) {
                        yield msg::parse(record).map_err(Error::from);
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    yield Err(error.into());
                    break;
                }
            }
        }
    }
}

enum Pumped {
    Shutdown,
    Lost(String),
    Closed(Option<String>),
}

struct Session {
    url: Url,
    tokens: Arc<dyn TokenSource>,
    policy: ReconnectPolicy,
    keepalive: Duration,
    server_timeout: Duration,
    handlers: Arc<RwLock<HashSet<String>>>,
    events: Sender<TransportEvent>,
}

impl Session {
    async fn run(self, mut shutdown: oneshot::Receiver<()>, opened: oneshot::Sender<Result<()>>) {
        let first = select! {
            _ = &mut shutdown => return,
            first = open(&self.url, self.tokens.as_ref(), self.server_timeout) => first,
        };
        let Opened {
            mut socket,
            mut backlog,
        } = match first {
            Ok(first) => first,
            Err(error) => {
                let _ = opened.send(Err(error));
                return;
            }
        };
        if opened.send(Ok(())).is_err() {
            tracing::debug!("handshake abandoned by the caller");
            return;
        }

        loop {
            let pumped = self
                .pump(&mut socket, std::mem::take(&mut backlog), &mut shutdown)
                .await;
            let reason = match pumped {
                Pumped::Shutdown => return,
                Pumped::Closed(reason) => {
                    self.emit(TransportEvent::Closed(reason)).await;
                    return;
                }
                Pumped::Lost(reason) => reason,
            };

            if self.policy.delay(0).is_none() {
                self.emit(TransportEvent::Closed(Some(reason))).await;
                return;
            }
            self.emit(TransportEvent::Reconnecting(reason)).await;
            match self.reconnect(&mut shutdown).await {
                Some(Ok(reconnected)) => {
                    socket = reconnected.socket;
                    backlog = reconnected.backlog;
                    self.emit(TransportEvent::Reconnected).await;
                }
                Some(Err(error)) => {
                    self.emit(TransportEvent::Closed(Some(error.to_string())))
                        .await;
                    return;
                }
                None => return,
            }
        }
    }

    async fn pump(
        &self,
        socket: &mut Socket,
        backlog: Vec<String>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Pumped {
        let (mut sink, frames) = socket.split::<Message>();
        let backlog = futures::stream::iter(
            backlog
                .into_iter()
                .map(|record| msg::parse(&record).map_err(Error::from)),
        );
        let messages = backlog.chain(messages(frames));
        pin!(messages);

        let mut keepalive = time::interval(self.keepalive);
        keepalive.tick().await;
        let timeout = time::sleep(self.server_timeout);
        pin!(timeout);

        loop {
            select! {
                _ = &mut *shutdown => {
                    if let Err(error) = sink.close().await {
                        tracing::debug!(%error, "closing hub socket failed");
                    }
                    return Pumped::Shutdown;
                }
                _ = keepalive.tick() => {
                    if let Err(error) = sink.send(Message::Text(msg::ping().into())).await {
                        return Pumped::Lost(error.to_string());
                    }
                }
                _ = &mut timeout => {
                    return Pumped::Lost(Error::Timeout(self.server_timeout).to_string());
                }
                message = messages.next() => {
                    timeout.as_mut().reset(Instant::now() + self.server_timeout);
                    match message {
                        None => return Pumped::Lost(Error::Closed.to_string()),
                        Some(Err(Error::Protocol(error))) => {
                            tracing::warn!(%error, "dropping malformed hub message");
                        }
                        Some(Err(error)) => return Pumped::Lost(error.to_string()),
                        Some(Ok(HubMessage::Invocation(invocation))) => self.deliver(invocation).await,
                        Some(Ok(HubMessage::Ping)) => {}
                        Some(Ok(HubMessage::Close(close))) => {
                            let reason = close.error.unwrap_or_else(|| "closed by server".to_string());
                            return if close.allow_reconnect {
                                Pumped::Lost(reason)
                            } else {
                                Pumped::Closed(Some(reason))
                            };
                        }
                        Some(Ok(HubMessage::Other(kind))) => {
                            tracing::debug!(kind, "ignoring hub message");
                        }
                    }
                }
            }
        }
    }

    async fn reconnect(&self, shutdown: &mut oneshot::Receiver<()>) -> Option<Result<Opened>> {
        let mut last_error = Error::Closed;
        let mut attempt = 0;
        while let Some(delay) = self.policy.delay(attempt) {
            attempt += 1;
            select! {
                _ = &mut *shutdown => return None,
                _ = time::sleep(delay) => {}
            }
            let opened = select! {
                _ = &mut *shutdown => return None,
                opened = open(&self.url, self.tokens.as_ref(), self.server_timeout) => opened,
            };
            match opened {
                Ok(opened) => return Some(Ok(opened)),
                Err(error) => {
                    tracing::warn!(attempt, %error, "reconnect attempt failed");
                    last_error = error;
                }
            }
        }
        Some(Err(last_error))
    }

    async fn deliver(&self, invocation: Invocation) {
        let registered = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&invocation.target);
        if !registered {
            tracing::warn!(method = %invocation.target, "no handler registered, dropping invocation");
            return;
        }
        self.emit(TransportEvent::Invocation {
            target: invocation.target,
            arguments: invocation.arguments,
        })
        .await;
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("transport event receiver dropped");
        }
    }
}
