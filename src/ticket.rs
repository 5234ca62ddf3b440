use crate::rest::ApiError;
use clap::ValueEnum;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(try_from = "u8", into = "u8")]
pub enum TicketStatus {
    Unused,
    Active,
    Used,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown ticket status {0}")]
pub struct UnknownStatus(u8);

impl TryFrom<u8> for TicketStatus {
    type Error = UnknownStatus;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TicketStatus::Unused),
            1 => Ok(TicketStatus::Active),
            2 => Ok(TicketStatus::Used),
            other => Err(UnknownStatus(other)),
        }
    }
}

impl From<TicketStatus> for u8 {
    fn from(status: TicketStatus) -> Self {
        match status {
            TicketStatus::Unused => 0,
            TicketStatus::Active => 1,
            TicketStatus::Used => 2,
        }
    }
}

impl Display for TicketStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketStatus::Unused => write!(f, "unused"),
            TicketStatus::Active => write!(f, "active"),
            TicketStatus::Used => write!(f, "used"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketSummary {
    pub id: String,
    pub start_station_name: String,
    pub end_station_name: String,
    pub valid_from: String,
    pub valid_to: String,
    pub price: f64,
    pub ticket_serial: String,
    pub status: TicketStatus,
}

impl Display for TicketSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {} ({}) valid {} .. {} [{}]",
            self.ticket_serial,
            self.start_station_name,
            self.end_station_name,
            self.price,
            self.valid_from,
            self.valid_to,
            self.status
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketPage {
    #[serde(default)]
    pub items: Vec<TicketSummary>,
    #[serde(default)]
    pub total_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketQuery {
    pub status: TicketStatus,
    pub page_number: u32,
    pub page_size: u32,
}

impl Default for TicketQuery {
    fn default() -> Self {
        Self {
            status: TicketStatus::Unused,
            page_number: 1,
            page_size: 10,
        }
    }
}

pub trait TicketSource: Send + Sync {
    fn tickets<'a>(&'a self, query: &'a TicketQuery) -> BoxFuture<'a, Result<TicketPage, ApiError>>;
}

/// Something the dispatcher can ask to reload the rider's ticket list.
pub trait TicketRefresh: Send + Sync {
    fn refetch(&self) -> BoxFuture<'_, ()>;
}

/// The page-owned ticket list: one query, refetched on demand and published
/// to whoever renders it.
pub struct TicketBoard<S> {
    source: S,
    query: TicketQuery,
    page: watch::Sender<TicketPage>,
}

impl<S: TicketSource> TicketBoard<S> {
    pub fn new(source: S, query: TicketQuery) -> Self {
        let (page, _) = watch::channel(TicketPage::default());
        Self {
            source,
            query,
            page,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TicketPage> {
        self.page.subscribe()
    }

    pub fn current(&self) -> TicketPage {
        self.page.borrow().clone()
    }

    pub async fn refresh(&self) -> Result<usize, ApiError> {
        let page = self.source.tickets(&self.query).await?;
        let fetched = page.items.len();
        tracing::debug!(status = %self.query.status, fetched, total = page.total_count, "ticket list refreshed");
        self.page.send_replace(page);
        Ok(fetched)
    }
}

impl<S: TicketSource> TicketRefresh for TicketBoard<S> {
    fn refetch(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(error) = self.refresh().await {
                tracing::warn!(%error, "could not refresh ticket list");
            }
        })
    }
}
