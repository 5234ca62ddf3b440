use crate::credential::{CredentialError, TokenSource};
use crate::dispatch::PaymentApi;
use crate::notice::OverStationNotice;
use crate::ticket::{TicketPage, TicketQuery, TicketSource};
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const OVER_STATION_PAYMENT_PATH: &str = "api/Payment/over-station";
pub const TICKETS_PATH: &str = "api/Ticket/me";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("response carried no checkout url")]
    MissingCheckoutUrl,
    #[error("response carried an invalid checkout url: {0}")]
    InvalidCheckoutUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkRequest {
    pub ticket_id: String,
    pub station_id: String,
}

impl From<&OverStationNotice> for PaymentLinkRequest {
    fn from(notice: &OverStationNotice) -> Self {
        Self {
            ticket_id: notice.ticket_id.clone(),
            station_id: notice.station_id.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Pulls `data.checkoutUrl` out of a payment-link response. Any other shape
/// is a failure.
pub fn checkout_url(body: &Value) -> Result<Url, ApiError> {
    let url = body
        .pointer("/data/checkoutUrl")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .ok_or(ApiError::MissingCheckoutUrl)?;
    Url::parse(url).map_err(|error| ApiError::InvalidCheckoutUrl(format!("{url}: {error}")))
}

/// Bearer-authenticated client for the ticketing REST API.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base: Url,
    tokens: Arc<dyn TokenSource>,
}

impl RestClient {
    pub fn new(base: &str, tokens: Arc<dyn TokenSource>) -> Result<Self, ApiError> {
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base = Url::parse(&base).map_err(|error| ApiError::InvalidUrl(error.to_string()))?;
        Ok(Self {
            client: Client::new(),
            base,
            tokens,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|error| ApiError::InvalidUrl(error.to_string()))
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status));
        }
        Ok(response.json().await?)
    }
}

impl PaymentApi for RestClient {
    fn over_station_payment_link<'a>(
        &'a self,
        request: &'a PaymentLinkRequest,
    ) -> BoxFuture<'a, Result<Url, ApiError>> {
        Box::pin(async move {
            let token = self.tokens.access_token()?;
            let response = self
                .client
                .post(self.endpoint(OVER_STATION_PAYMENT_PATH)?)
                .bearer_auth(token)
                .json(request)
                .send()
                .await?;
            let body: Value = Self::read_json(response).await?;
            checkout_url(&body)
        })
    }
}

impl TicketSource for RestClient {
    fn tickets<'a>(&'a self, query: &'a TicketQuery) -> BoxFuture<'a, Result<TicketPage, ApiError>> {
        Box::pin(async move {
            let token = self.tokens.access_token()?;
            let response = self
                .client
                .get(self.endpoint(TICKETS_PATH)?)
                .bearer_auth(token)
                .query(&[
                    ("status", u32::from(u8::from(query.status))),
                    ("pageNumber", query.page_number),
                    ("pageSize", query.page_size),
                ])
                .send()
                .await?;
            let envelope: Envelope<TicketPage> = Self::read_json(response).await?;
            Ok(envelope.data)
        })
    }
}
