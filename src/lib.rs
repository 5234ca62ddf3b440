pub mod credential;
pub mod dispatch;
pub mod hub;
pub mod notice;
pub mod reconciler;
pub mod rest;
pub mod store;
pub mod ticket;

#[cfg(test)]
mod testing;

pub use clap::Parser;
use credential::{CredentialError, StaticToken, TokenFile, TokenSource};
use hub::ws::ReconnectPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use ticket::{TicketQuery, TicketStatus};

/// Listens for metro ticket notifications and walks the rider through them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[arg(
        long,
        env = "METRO_HUB_URL",
        help = "Notification hub endpoint",
        default_value = "ws://localhost:5000/hubs/notification"
    )]
    pub hub_url: String,

    #[arg(
        long,
        env = "METRO_API_URL",
        help = "Base url of the ticketing REST api",
        default_value = "http://localhost:5000/"
    )]
    pub api_url: String,

    #[arg(
        short,
        long,
        env = "METRO_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Bearer token used for the hub and the api"
    )]
    pub token: Option<String>,

    #[arg(
        long,
        env = "METRO_TOKEN_FILE",
        conflicts_with = "token",
        help = "File holding the bearer token, re-read on every use"
    )]
    pub token_file: Option<PathBuf>,

    #[arg(long, default_value = notice::OVER_STATION_METHOD)]
    pub over_station_method: String,

    #[arg(long, default_value = notice::CHECK_IN_OUT_METHOD)]
    pub check_in_out_method: String,

    #[arg(long, value_enum, default_value_t = TicketStatus::Unused)]
    pub ticket_status: TicketStatus,

    #[arg(long, default_value_t = 10)]
    pub page_size: u32,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "0,2000,10000,30000",
        help = "Delays before each reconnect attempt, in milliseconds"
    )]
    pub reconnect_delays_ms: Vec<u64>,

    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub keepalive_secs: u64,

    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub server_timeout_secs: u64,
}

impl CliArgs {
    pub fn token_source(&self) -> Result<Arc<dyn TokenSource>, CredentialError> {
        match (&self.token, &self.token_file) {
            (_, Some(path)) => Ok(Arc::new(TokenFile::new(path))),
            (Some(token), None) if !token.is_empty() => Ok(Arc::new(StaticToken::new(token))),
            _ => Err(CredentialError::Missing),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        )
    }

    pub fn ticket_query(&self) -> TicketQuery {
        TicketQuery {
            status: self.ticket_status,
            page_size: self.page_size,
            ..TicketQuery::default()
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }
}
