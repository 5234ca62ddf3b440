use anyhow::Context;
use metro_realtime::dispatch::{ActionDispatcher, Ui};
use metro_realtime::hub::ws::WsTransport;
use metro_realtime::hub::{ConnectionManager, Started};
use metro_realtime::notice::{EventRouter, NoticeKind};
use metro_realtime::reconciler::{Handle, Reconciler, View};
use metro_realtime::rest::RestClient;
use metro_realtime::ticket::TicketBoard;
use metro_realtime::{CliArgs, Parser};
use reqwest::Url;
use std::sync::Arc;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::{watch, Notify};
use tracing_subscriber::EnvFilter;

const HELP: &str = "commands: confirm <kind> | dismiss <kind> | connect | disconnect | tickets | quit
kinds: over-station, check-in-out";

/// Prints checkout links and errors. Navigating away ends the session.
struct TerminalUi {
    left: Arc<Notify>,
}

impl Ui for TerminalUi {
    fn navigate(&self, url: &Url) {
        println!("continue the payment at {url}");
        self.left.notify_one();
    }

    fn show_error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("metro_realtime=info".parse()?))
        .init();

    let args = CliArgs::parse();
    let tokens = args.token_source().context("an access token is required")?;

    let client = RestClient::new(&args.api_url, tokens.clone())?;
    let board = Arc::new(TicketBoard::new(client.clone(), args.ticket_query()));
    let left = Arc::new(Notify::new());
    let dispatcher = ActionDispatcher::new(
        Arc::new(client),
        board.clone(),
        Arc::new(TerminalUi { left: left.clone() }),
    );

    let router = EventRouter::new(&args.over_station_method, &args.check_in_out_method);
    let transport = WsTransport::new(&args.hub_url, args.reconnect_policy())?
        .with_timeouts(args.keepalive(), args.server_timeout());
    tracing::info!(url = %transport.url(), "notification hub");
    let connection = ConnectionManager::new(transport, tokens, router.methods());
    let (handle, join_handle) = Reconciler::new(connection, router, dispatcher).spawn();

    handle.attach_store().await?;
    connect(handle.clone());
    if let Err(error) = board.refresh().await {
        tracing::warn!(%error, "initial ticket load failed");
    }
    tokio::spawn(print_views(handle.subscribe()));

    println!("{HELP}");
    let mut lines = BufReader::new(stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&handle, &board, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            _ = left.notified() => break,
        }
    }

    handle.stop().await?;
    drop(handle);
    join_handle.await?;
    Ok(())
}

/// Returns false once the session should end.
async fn run_command(handle: &Handle, board: &TicketBoard<RestClient>, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("confirm"), Some(kind)) => match kind.parse::<NoticeKind>() {
            Ok(kind) => match handle.confirm(kind).await {
                Ok(decision) => println!("confirmed: {}", decision.message()),
                Err(error) => eprintln!("{error}"),
            },
            Err(error) => eprintln!("{error}"),
        },
        (Some("dismiss"), Some(kind)) => match kind.parse::<NoticeKind>() {
            Ok(kind) => match handle.dismiss(kind).await {
                Ok(Some(_)) => println!("dismissed"),
                Ok(None) => println!("nothing to dismiss"),
                Err(error) => eprintln!("{error}"),
            },
            Err(error) => eprintln!("{error}"),
        },
        (Some("connect"), None) => connect(handle.clone()),
        (Some("disconnect"), None) => {
            if let Err(error) = handle.stop().await {
                eprintln!("{error}");
            }
        }
        (Some("tickets"), None) => {
            if let Err(error) = board.refresh().await {
                eprintln!("could not load tickets: {error}");
            }
            let page = board.current();
            println!("{} ticket(s)", page.total_count);
            for ticket in &page.items {
                println!("  {ticket}");
            }
        }
        (Some("quit"), None) => return false,
        (None, _) => {}
        _ => println!("{HELP}"),
    }
    true
}

/// Connects in the background so commands keep working during the handshake.
fn connect(handle: Handle) {
    tokio::spawn(async move {
        match handle.start().await {
            Ok(Started::Connected) => {}
            Ok(Started::AlreadyActive(state)) => println!("already {state}"),
            Err(error) => eprintln!("could not connect: {error}"),
        }
    });
}

async fn print_views(mut views: watch::Receiver<View>) {
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        println!("[{}]", view.connection);
        for kind in NoticeKind::ALL {
            if let Some(decision) = view.decisions.pending(kind) {
                println!("  {kind}: {} (confirm {kind} / dismiss {kind})", decision.message());
            }
        }
    }
}
