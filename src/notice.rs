use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{from_value, Map, Value};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const OVER_STATION_METHOD: &str = "ReceiveOverStationNotification";
pub const CHECK_IN_OUT_METHOD: &str = "ReceiveCheckInCheckOutNotification";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeKind {
    OverStation,
    CheckInCheckOut,
}

impl NoticeKind {
    pub const ALL: [NoticeKind; 2] = [NoticeKind::OverStation, NoticeKind::CheckInCheckOut];
}

impl Display for NoticeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NoticeKind::OverStation => write!(f, "over-station"),
            NoticeKind::CheckInCheckOut => write!(f, "check-in-out"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown notice kind: {0}")]
pub struct UnknownKind(String);

impl FromStr for NoticeKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overStation" | "over-station" => Ok(NoticeKind::OverStation),
            "checkinCheckout" | "check-in-out" => Ok(NoticeKind::CheckInCheckOut),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverStationNotice {
    pub ticket_id: String,
    pub station_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInOutNotice {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    OverStation(OverStationNotice),
    CheckInOut(CheckInOutNotice),
}

impl InboundEvent {
    pub fn kind(&self) -> NoticeKind {
        match self {
            InboundEvent::OverStation(_) => NoticeKind::OverStation,
            InboundEvent::CheckInOut(_) => NoticeKind::CheckInCheckOut,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route for hub method {0}")]
    UnknownMethod(String),
    #[error("{kind} notice carried no arguments")]
    MissingArgument { kind: NoticeKind },
    #[error("malformed {kind} notice: {source}")]
    Malformed {
        kind: NoticeKind,
        source: serde_json::Error,
    },
}

/// Receives decoded notices.
pub trait EventSink {
    fn apply(&mut self, event: InboundEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Applied(NoticeKind),
    Queued(NoticeKind),
}

/// Maps hub method names onto [`InboundEvent`]s. While no sink is attached
/// the newest event of each kind is held back and replayed on attach.
pub struct EventRouter {
    over_station_method: String,
    check_in_out_method: String,
    queued: HashMap<NoticeKind, InboundEvent>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(OVER_STATION_METHOD, CHECK_IN_OUT_METHOD)
    }
}

impl EventRouter {
    pub fn new(over_station_method: impl Into<String>, check_in_out_method: impl Into<String>) -> Self {
        Self {
            over_station_method: over_station_method.into(),
            check_in_out_method: check_in_out_method.into(),
            queued: HashMap::new(),
        }
    }

    pub fn methods(&self) -> [&str; 2] {
        [
            self.over_station_method.as_str(),
            self.check_in_out_method.as_str(),
        ]
    }

    pub fn decode(&self, method: &str, arguments: &[Value]) -> Result<InboundEvent, RouteError> {
        if method == self.over_station_method {
            decode_arguments(
                NoticeKind::OverStation,
                arguments,
                &["ticketId", "stationId", "message"],
            )
            .map(InboundEvent::OverStation)
        } else if method == self.check_in_out_method {
            decode_arguments(NoticeKind::CheckInCheckOut, arguments, &["message"])
                .map(InboundEvent::CheckInOut)
        } else {
            Err(RouteError::UnknownMethod(method.to_string()))
        }
    }

    pub fn route<S: EventSink>(
        &mut self,
        method: &str,
        arguments: &[Value],
        sink: Option<&mut S>,
    ) -> Result<Routed, RouteError> {
        let event = self
            .decode(method, arguments)
            .inspect_err(|error| tracing::warn!(%error, "dropping inbound notice"))?;
        let kind = event.kind();

        match sink {
            Some(sink) => {
                sink.apply(event);
                Ok(Routed::Applied(kind))
            }
            None => {
                if self.queued.insert(kind, event).is_some() {
                    tracing::debug!(%kind, "queued notice replaced by a newer one");
                }
                Ok(Routed::Queued(kind))
            }
        }
    }

    /// Replays queued notices into a newly attached sink, over-station first.
    pub fn attach<S: EventSink>(&mut self, sink: &mut S) -> usize {
        let mut replayed = 0;
        for kind in NoticeKind::ALL {
            if let Some(event) = self.queued.remove(&kind) {
                sink.apply(event);
                replayed += 1;
            }
        }
        replayed
    }

    pub fn queued(&self, kind: NoticeKind) -> Option<&InboundEvent> {
        self.queued.get(&kind)
    }
}

/// Accepts a single object argument or positional arguments in `fields` order.
fn decode_arguments<T: DeserializeOwned>(
    kind: NoticeKind,
    arguments: &[Value],
    fields: &[&str],
) -> Result<T, RouteError> {
    let value = match arguments {
        [] => return Err(RouteError::MissingArgument { kind }),
        [object @ Value::Object(_)] => object.clone(),
        positional => Value::Object(
            fields
                .iter()
                .zip(positional)
                .map(|(field, value)| (field.to_string(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
    };
    from_value(value).map_err(|source| RouteError::Malformed { kind, source })
}
