use crate::notice::{CheckInOutNotice, OverStationNotice};
use crate::rest::{ApiError, PaymentLinkRequest};
use crate::store::PendingDecision;
use crate::ticket::TicketRefresh;
use futures::future::BoxFuture;
use reqwest::Url;
use std::sync::Arc;

pub const PAYMENT_LINK_FAILED: &str = "Could not create the payment link. Please try again.";

pub trait PaymentApi: Send + Sync {
    fn over_station_payment_link<'a>(
        &'a self,
        request: &'a PaymentLinkRequest,
    ) -> BoxFuture<'a, Result<Url, ApiError>>;
}

/// The presentation side the dispatcher reports to.
pub trait Ui: Send + Sync {
    /// Leaves the current page for `url`. Nothing in-app matters afterwards.
    fn navigate(&self, url: &Url);

    fn show_error(&self, message: &str);
}

#[derive(Clone)]
pub struct ActionDispatcher {
    payments: Arc<dyn PaymentApi>,
    tickets: Arc<dyn TicketRefresh>,
    ui: Arc<dyn Ui>,
}

impl ActionDispatcher {
    pub fn new(
        payments: Arc<dyn PaymentApi>,
        tickets: Arc<dyn TicketRefresh>,
        ui: Arc<dyn Ui>,
    ) -> Self {
        Self {
            payments,
            tickets,
            ui,
        }
    }

    pub async fn dispatch(&self, decision: PendingDecision) {
        match decision {
            PendingDecision::OverStation(notice) => {
                if let Err(error) = self.confirm_over_station(&notice).await {
                    tracing::debug!(%error, "over-station decision ended without a checkout");
                }
            }
            PendingDecision::CheckInCheckOut(notice) => {
                self.acknowledge_check_in_out(&notice).await
            }
        }
    }

    /// Requests a checkout link for the extra fare and sends the rider there.
    /// One attempt only; a failure is shown and the prompt stays cleared.
    pub async fn confirm_over_station(&self, notice: &OverStationNotice) -> Result<Url, ApiError> {
        let request = PaymentLinkRequest::from(notice);
        match self.payments.over_station_payment_link(&request).await {
            Ok(url) => {
                tracing::info!(ticket_id = %request.ticket_id, station_id = %request.station_id, %url, "navigating to checkout");
                self.tickets.refetch().await;
                self.ui.navigate(&url);
                Ok(url)
            }
            Err(error) => {
                tracing::warn!(ticket_id = %request.ticket_id, %error, "payment link request failed");
                self.ui.show_error(PAYMENT_LINK_FAILED);
                Err(error)
            }
        }
    }

    pub async fn acknowledge_check_in_out(&self, notice: &CheckInOutNotice) {
        tracing::debug!(message = %notice.message, "check-in/out acknowledged, refreshing tickets");
        self.tickets.refetch().await;
    }
}
