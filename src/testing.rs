//! Fakes shared by the unit tests.

use crate::credential::TokenSource;
use crate::dispatch::{PaymentApi, Ui};
use crate::hub::{self, Handshake, Transport, TransportEvent};
use crate::rest::{ApiError, PaymentLinkRequest};
use crate::ticket::TicketRefresh;
use futures::future::BoxFuture;
use reqwest::Url;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct FakeTransportState {
    starts: usize,
    stops: usize,
    handlers: Vec<String>,
    fail_next: Option<String>,
    hang_next: bool,
    sender: Option<Sender<TransportEvent>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FakeTransport {
    pub fn fail_next_start(&self, reason: &str) {
        self.state.lock().unwrap().fail_next = Some(reason.to_string());
    }

    /// The next start never finishes its handshake.
    pub fn hang_next_start(&self) {
        self.state.lock().unwrap().hang_next = true;
    }

    pub async fn push(&self, event: TransportEvent) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .sender
            .clone()
            .expect("transport not started");
        sender.send(event).await.unwrap();
    }

    pub fn drop_sender(&self) {
        self.state.lock().unwrap().sender = None;
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn handlers(&self) -> Vec<String> {
        self.state.lock().unwrap().handlers.clone()
    }
}

impl FakeTransport {
    fn open(&self, tokens: &dyn TokenSource) -> Option<hub::Result<Receiver<TransportEvent>>> {
        if let Err(error) = tokens.access_token() {
            return Some(Err(error.into()));
        }
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        if state.hang_next {
            state.hang_next = false;
            return None;
        }
        if let Some(reason) = state.fail_next.take() {
            return Some(Err(hub::Error::Handshake(reason)));
        }
        let (sender, receiver) = channel(16);
        state.sender = Some(sender);
        Some(Ok(receiver))
    }
}

impl Transport for FakeTransport {
    fn start(&mut self, tokens: Arc<dyn TokenSource>) -> Handshake {
        let outcome = self.open(tokens.as_ref());
        Box::pin(async move {
            match outcome {
                Some(opened) => opened,
                None => std::future::pending().await,
            }
        })
    }

    fn on(&mut self, target: &str) {
        self.state.lock().unwrap().handlers.push(target.to_string());
    }

    fn off_all(&mut self) {
        self.state.lock().unwrap().handlers.clear();
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.stops += 1;
            state.sender = None;
        })
    }
}

pub(crate) struct FakePayments {
    response: Mutex<Option<Result<Url, ApiError>>>,
    pub requests: Mutex<Vec<PaymentLinkRequest>>,
}

impl FakePayments {
    pub fn succeeding(url: &str) -> Self {
        Self {
            response: Mutex::new(Some(Ok(Url::parse(url).unwrap()))),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            response: Mutex::new(Some(Err(ApiError::MissingCheckoutUrl))),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl PaymentApi for FakePayments {
    fn over_station_payment_link<'a>(
        &'a self,
        request: &'a PaymentLinkRequest,
    ) -> BoxFuture<'a, Result<Url, ApiError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            self.response
                .lock()
                .unwrap()
                .take()
                .expect("payment link requested twice")
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UiAction {
    Navigate(String),
    Error(String),
}

pub(crate) struct RecordingUi {
    actions: UnboundedSender<UiAction>,
}

impl RecordingUi {
    pub fn new() -> (Self, UnboundedReceiver<UiAction>) {
        let (actions, receiver) = unbounded_channel();
        (Self { actions }, receiver)
    }
}

impl Ui for RecordingUi {
    fn navigate(&self, url: &Url) {
        let _ = self.actions.send(UiAction::Navigate(url.to_string()));
    }

    fn show_error(&self, message: &str) {
        let _ = self.actions.send(UiAction::Error(message.to_string()));
    }
}

#[derive(Default)]
pub(crate) struct CountingRefresh {
    count: AtomicUsize,
}

impl CountingRefresh {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl TicketRefresh for CountingRefresh {
    fn refetch(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.count.fetch_add(1, Ordering::SeqCst);
        })
    }
}
