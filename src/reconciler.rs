use crate::dispatch::ActionDispatcher;
use crate::hub::{
    self, ConnectionManager, ConnectionState, Handshake, Started, Transport, TransportEvent,
};
use crate::notice::{EventRouter, NoticeKind, Routed};
use crate::store::{PendingDecision, ReconciliationStore, Snapshot, StoreError};
use serde::Serialize;
use tokio::select;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reconciler is no longer running")]
    Gone,
    #[error(transparent)]
    Hub(#[from] hub::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a view renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub connection: ConnectionState,
    pub attached: bool,
    pub decisions: Snapshot,
}

enum Command {
    Start(oneshot::Sender<hub::Result<Started>>),
    Stop(oneshot::Sender<()>),
    AttachStore(oneshot::Sender<usize>),
    Confirm(
        NoticeKind,
        oneshot::Sender<std::result::Result<PendingDecision, StoreError>>,
    ),
    Dismiss(NoticeKind, oneshot::Sender<Option<PendingDecision>>),
}

#[derive(Clone)]
pub struct Handle {
    commands: Sender<Command>,
    view: watch::Receiver<View>,
}

impl Handle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::Gone)?;
        response.await.map_err(|_| Error::Gone)
    }

    pub async fn start(&self) -> Result<Started> {
        Ok(self.request(Command::Start).await??)
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    /// Attaches the store and returns how many held-back notices it received.
    pub async fn attach_store(&self) -> Result<usize> {
        self.request(Command::AttachStore).await
    }

    pub async fn confirm(&self, kind: NoticeKind) -> Result<PendingDecision> {
        Ok(self
            .request(|reply| Command::Confirm(kind, reply))
            .await??)
    }

    pub async fn dismiss(&self, kind: NoticeKind) -> Result<Option<PendingDecision>> {
        self.request(|reply| Command::Dismiss(kind, reply)).await
    }

    pub fn view(&self) -> View {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<View> {
        self.view.clone()
    }
}

/// Single loop that owns the connection, the router and the store. Transport
/// events and commands are handled one at a time, in arrival order. A
/// handshake in flight is polled by the loop, so commands keep being served
/// while it runs.
pub struct Reconciler<T> {
    connection: ConnectionManager<T>,
    router: EventRouter,
    store: Option<ReconciliationStore>,
    dispatcher: ActionDispatcher,
    view: watch::Sender<View>,
    actions: JoinSet<()>,
    handshake: Option<Handshake>,
    starter: Option<oneshot::Sender<hub::Result<Started>>>,
}

async fn handshake_outcome(
    handshake: &mut Option<Handshake>,
) -> hub::Result<Receiver<TransportEvent>> {
    match handshake {
        Some(handshake) => handshake.await,
        None => std::future::pending().await,
    }
}

impl<T: Transport + 'static> Reconciler<T> {
    pub fn new(
        connection: ConnectionManager<T>,
        router: EventRouter,
        dispatcher: ActionDispatcher,
    ) -> Self {
        let (view, _) = watch::channel(View::default());
        Self {
            connection,
            router,
            store: None,
            dispatcher,
            view,
            actions: JoinSet::new(),
            handshake: None,
            starter: None,
        }
    }

    pub fn spawn(self) -> (Handle, JoinHandle<()>) {
        let (commands, receiver) = channel(32);
        let handle = Handle {
            commands,
            view: self.view.subscribe(),
        };
        (handle, tokio::spawn(self.run(receiver)))
    }

    async fn run(mut self, mut commands: Receiver<Command>) {
        loop {
            select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                opened = handshake_outcome(&mut self.handshake) => {
                    self.handshake = None;
                    let started = self.connection.finish_start(opened);
                    self.publish();
                    if let Some(starter) = self.starter.take() {
                        let _ = starter.send(started);
                    }
                }
                event = self.connection.next_event() => self.handle_event(event),
                Some(finished) = self.actions.join_next() => {
                    if let Err(error) = finished {
                        tracing::warn!(%error, "decision action failed");
                    }
                }
            }
        }

        self.abandon_handshake();
        self.connection.stop().await;
        while self.actions.join_next().await.is_some() {}
        tracing::debug!("reconciler stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => match self.connection.begin_start() {
                Ok(handshake) => {
                    self.handshake = Some(handshake);
                    self.starter = Some(reply);
                    self.publish();
                }
                Err(active) => {
                    let _ = reply.send(Ok(active));
                }
            },
            Command::Stop(reply) => {
                self.abandon_handshake();
                self.connection.stop().await;
                self.publish();
                let _ = reply.send(());
            }
            Command::AttachStore(reply) => {
                let replayed = if self.store.is_some() {
                    0
                } else {
                    let mut store = ReconciliationStore::default();
                    let replayed = self.router.attach(&mut store);
                    self.store = Some(store);
                    tracing::debug!(replayed, "store attached");
                    replayed
                };
                self.publish();
                let _ = reply.send(replayed);
            }
            Command::Confirm(kind, reply) => {
                let confirmed = match self.store.as_mut() {
                    Some(store) => store.confirm(kind),
                    None => Err(StoreError::NothingPending(kind)),
                };
                match &confirmed {
                    Ok(decision) => {
                        self.publish();
                        let dispatcher = self.dispatcher.clone();
                        let decision = decision.clone();
                        self.actions
                            .spawn(async move { dispatcher.dispatch(decision).await });
                    }
                    Err(error) => tracing::error!(%error, "confirm without a pending decision"),
                }
                let _ = reply.send(confirmed);
            }
            Command::Dismiss(kind, reply) => {
                let dismissed = self.store.as_mut().and_then(|store| store.dismiss(kind));
                self.publish();
                let _ = reply.send(dismissed);
            }
        }
    }

    fn abandon_handshake(&mut self) {
        if self.handshake.take().is_some() {
            tracing::debug!("handshake abandoned");
        }
        if let Some(starter) = self.starter.take() {
            let _ = starter.send(Err(hub::Error::Stopped));
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if let TransportEvent::Invocation { target, arguments } = event {
            if let Ok(routed @ Routed::Queued(_)) =
                self.router.route(&target, &arguments, self.store.as_mut())
            {
                tracing::debug!(?routed, "no store attached, notice held back");
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let next = View {
            connection: self.connection.state(),
            attached: self.store.is_some(),
            decisions: self
                .store
                .as_ref()
                .map(ReconciliationStore::snapshot)
                .unwrap_or_default(),
        };
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Handle, Reconciler, View};
    use crate::credential::{StaticToken, TokenSource};
    use crate::dispatch::{ActionDispatcher, PAYMENT_LINK_FAILED};
    use crate::hub::{self, ConnectionManager, ConnectionState, Started, TransportEvent};
    use crate::notice::{EventRouter, NoticeKind, OverStationNotice, CHECK_IN_OUT_METHOD, OVER_STATION_METHOD};
    use crate::store::{PendingDecision, StoreError};
    use crate::testing::{CountingRefresh, FakePayments, FakeTransport, RecordingUi, UiAction};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;
    use tokio::time;

    struct Fixture {
        transport: FakeTransport,
        handle: Handle,
        join_handle: JoinHandle<()>,
        actions: UnboundedReceiver<UiAction>,
        refresh: Arc<CountingRefresh>,
    }

    fn setup(payments: FakePayments) -> Fixture {
        let transport = FakeTransport::default();
        let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::new("token"));
        let router = EventRouter::default();
        let connection = ConnectionManager::new(transport.clone(), tokens, router.methods());
        let refresh = Arc::new(CountingRefresh::default());
        let (ui, actions) = RecordingUi::new();
        let dispatcher = ActionDispatcher::new(Arc::new(payments), refresh.clone(), Arc::new(ui));
        let (handle, join_handle) = Reconciler::new(connection, router, dispatcher).spawn();
        Fixture {
            transport,
            handle,
            join_handle,
            actions,
            refresh,
        }
    }

    fn over_station(station_id: &str) -> TransportEvent {
        TransportEvent::Invocation {
            target: OVER_STATION_METHOD.to_string(),
            arguments: vec![json!({"ticketId": "T1", "stationId": station_id, "message": "Bạn đã đi quá trạm"})],
        }
    }

    async fn wait_for(handle: &Handle, predicate: impl FnMut(&View) -> bool) -> View {
        let mut view = handle.subscribe();
        let current = time::timeout(Duration::from_secs(5), view.wait_for(predicate))
            .await
            .expect("view did not change in time")
            .expect("reconciler gone")
            .clone();
        current
    }

    fn pending_station(view: &View) -> Option<&str> {
        match view.decisions.pending(NoticeKind::OverStation) {
            Some(PendingDecision::OverStation(notice)) => Some(notice.station_id.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn over_station_notice_confirm_and_failed_payment() {
        let mut fixture = setup(FakePayments::failing());
        fixture.handle.attach_store().await.unwrap();
        assert_eq!(fixture.handle.start().await.unwrap(), Started::Connected);

        fixture.transport.push(over_station("S1")).await;
        let view = wait_for(&fixture.handle, |view| pending_station(view).is_some()).await;
        assert_eq!(pending_station(&view), Some("S1"));

        let confirmed = fixture.handle.confirm(NoticeKind::OverStation).await.unwrap();
        assert_eq!(
            confirmed,
            PendingDecision::OverStation(OverStationNotice {
                ticket_id: "T1".to_string(),
                station_id: "S1".to_string(),
                message: "Bạn đã đi quá trạm".to_string(),
            })
        );

        assert_eq!(
            fixture.actions.recv().await,
            Some(UiAction::Error(PAYMENT_LINK_FAILED.to_string()))
        );
        assert_eq!(fixture.handle.view().decisions.over_station, None);
        assert!(matches!(
            fixture.handle.confirm(NoticeKind::OverStation).await,
            Err(Error::Store(StoreError::NothingPending(NoticeKind::OverStation)))
        ));
    }

    #[tokio::test]
    async fn back_to_back_notices_keep_latest() {
        let mut fixture = setup(FakePayments::succeeding("https://pay.example/c/1"));
        fixture.handle.attach_store().await.unwrap();
        fixture.handle.start().await.unwrap();

        fixture.transport.push(over_station("S1")).await;
        fixture.transport.push(over_station("S2")).await;
        wait_for(&fixture.handle, |view| pending_station(view) == Some("S2")).await;

        match fixture.handle.confirm(NoticeKind::OverStation).await.unwrap() {
            PendingDecision::OverStation(notice) => assert_eq!(notice.station_id, "S2"),
            other => panic!("unexpected decision: {other:?}"),
        }
        assert_eq!(
            fixture.actions.recv().await,
            Some(UiAction::Navigate("https://pay.example/c/1".to_string()))
        );
        assert_eq!(fixture.refresh.count(), 1);
    }

    #[tokio::test]
    async fn confirm_other_kind_leaves_over_station() {
        let fixture = setup(FakePayments::failing());
        fixture.handle.attach_store().await.unwrap();
        fixture.handle.start().await.unwrap();
        fixture.transport.push(over_station("S1")).await;
        wait_for(&fixture.handle, |view| pending_station(view).is_some()).await;

        assert!(matches!(
            fixture.handle.confirm(NoticeKind::CheckInCheckOut).await,
            Err(Error::Store(StoreError::NothingPending(NoticeKind::CheckInCheckOut)))
        ));
        assert_eq!(pending_station(&fixture.handle.view()), Some("S1"));
    }

    #[tokio::test]
    async fn notices_before_attach_are_replayed() {
        let fixture = setup(FakePayments::failing());
        fixture.handle.start().await.unwrap();

        fixture.transport.push(over_station("S1")).await;
        fixture.transport.push(over_station("S2")).await;
        fixture
            .transport
            .push(TransportEvent::Invocation {
                target: CHECK_IN_OUT_METHOD.to_string(),
                arguments: vec![json!("Check-in thành công")],
            })
            .await;

        time::sleep(Duration::from_millis(50)).await;
        assert!(!fixture.handle.view().attached);
        assert_eq!(fixture.handle.view().decisions, Default::default());

        assert_eq!(fixture.handle.attach_store().await.unwrap(), 2);
        assert_eq!(fixture.handle.attach_store().await.unwrap(), 0);
        let view = fixture.handle.view();
        assert!(view.attached);
        assert_eq!(pending_station(&view), Some("S2"));
        assert!(view.decisions.check_in_out.is_some());
    }

    #[tokio::test]
    async fn check_in_out_confirm_refreshes_tickets() {
        let fixture = setup(FakePayments::failing());
        fixture.handle.attach_store().await.unwrap();
        fixture.handle.start().await.unwrap();
        fixture
            .transport
            .push(TransportEvent::Invocation {
                target: CHECK_IN_OUT_METHOD.to_string(),
                arguments: vec![json!({"message": "Check-out thành công"})],
            })
            .await;
        wait_for(&fixture.handle, |view| view.decisions.check_in_out.is_some()).await;

        fixture
            .handle
            .confirm(NoticeKind::CheckInCheckOut)
            .await
            .unwrap();
        fixture.handle.stop().await.unwrap();
        drop(fixture.handle);
        fixture.join_handle.await.unwrap();
        assert_eq!(fixture.refresh.count(), 1);
    }

    #[tokio::test]
    async fn dismiss_twice_is_safe() {
        let fixture = setup(FakePayments::failing());
        fixture.handle.attach_store().await.unwrap();
        fixture.handle.start().await.unwrap();
        fixture.transport.push(over_station("S1")).await;
        wait_for(&fixture.handle, |view| pending_station(view).is_some()).await;

        assert!(fixture
            .handle
            .dismiss(NoticeKind::OverStation)
            .await
            .unwrap()
            .is_some());
        assert!(fixture
            .handle
            .dismiss(NoticeKind::OverStation)
            .await
            .unwrap()
            .is_none());
        assert_eq!(fixture.handle.view().decisions, Default::default());
    }

    #[tokio::test]
    async fn connection_state_follows_transport() {
        let fixture = setup(FakePayments::failing());
        fixture.handle.start().await.unwrap();
        assert_eq!(fixture.handle.view().connection, ConnectionState::Connected);

        fixture
            .transport
            .push(TransportEvent::Reconnecting("reset".to_string()))
            .await;
        wait_for(&fixture.handle, |view| view.connection == ConnectionState::Reconnecting).await;
        assert_eq!(
            fixture.handle.start().await.unwrap(),
            Started::AlreadyActive(ConnectionState::Reconnecting)
        );

        fixture.transport.push(TransportEvent::Reconnected).await;
        wait_for(&fixture.handle, |view| view.connection == ConnectionState::Connected).await;
        assert_eq!(fixture.transport.starts(), 1);
        assert_eq!(fixture.transport.handlers().len(), 2);

        fixture.handle.stop().await.unwrap();
        assert_eq!(fixture.handle.view().connection, ConnectionState::Disconnected);
        assert!(fixture.transport.handlers().is_empty());
    }

    #[tokio::test]
    async fn failed_start_is_reported() {
        let fixture = setup(FakePayments::failing());
        fixture.transport.fail_next_start("unauthorized");

        assert!(matches!(fixture.handle.start().await, Err(Error::Hub(_))));
        assert_eq!(fixture.handle.view().connection, ConnectionState::Disconnected);
        assert_eq!(fixture.handle.start().await.unwrap(), Started::Connected);
    }

    #[tokio::test]
    async fn commands_are_served_while_the_handshake_hangs() {
        let fixture = setup(FakePayments::failing());
        fixture.transport.hang_next_start();
        let starting = tokio::spawn({
            let handle = fixture.handle.clone();
            async move { handle.start().await }
        });
        wait_for(&fixture.handle, |view| view.connection == ConnectionState::Connecting).await;

        let served = time::timeout(Duration::from_secs(2), async {
            fixture.handle.attach_store().await.unwrap();
            fixture.handle.dismiss(NoticeKind::OverStation).await.unwrap();
            assert_eq!(
                fixture.handle.start().await.unwrap(),
                Started::AlreadyActive(ConnectionState::Connecting)
            );
        })
        .await;
        assert!(served.is_ok());
        assert!(fixture.handle.view().attached);

        time::timeout(Duration::from_secs(2), fixture.handle.stop())
            .await
            .expect("stop waited for the handshake")
            .unwrap();
        assert!(matches!(
            starting.await.unwrap(),
            Err(Error::Hub(hub::Error::Stopped))
        ));
        assert_eq!(fixture.handle.view().connection, ConnectionState::Disconnected);
        assert_eq!(fixture.transport.stops(), 1);

        assert_eq!(fixture.handle.start().await.unwrap(), Started::Connected);
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_loop() {
        let fixture = setup(FakePayments::failing());
        fixture.handle.start().await.unwrap();
        drop(fixture.handle);

        time::timeout(Duration::from_secs(5), fixture.join_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fixture.transport.stops(), 1);
    }
}
