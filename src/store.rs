use crate::notice::{CheckInOutNotice, EventSink, InboundEvent, NoticeKind, OverStationNotice};
use serde::Serialize;

/// A prompt waiting for the rider to confirm or dismiss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PendingDecision {
    OverStation(OverStationNotice),
    CheckInCheckOut(CheckInOutNotice),
}

impl PendingDecision {
    pub fn kind(&self) -> NoticeKind {
        match self {
            PendingDecision::OverStation(_) => NoticeKind::OverStation,
            PendingDecision::CheckInCheckOut(_) => NoticeKind::CheckInCheckOut,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PendingDecision::OverStation(notice) => &notice.message,
            PendingDecision::CheckInCheckOut(notice) => &notice.message,
        }
    }
}

impl From<InboundEvent> for PendingDecision {
    fn from(event: InboundEvent) -> Self {
        match event {
            InboundEvent::OverStation(notice) => PendingDecision::OverStation(notice),
            InboundEvent::CheckInOut(notice) => PendingDecision::CheckInCheckOut(notice),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no {0} decision is pending")]
    NothingPending(NoticeKind),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub over_station: Option<PendingDecision>,
    pub check_in_out: Option<PendingDecision>,
}

impl Snapshot {
    pub fn pending(&self, kind: NoticeKind) -> Option<&PendingDecision> {
        match kind {
            NoticeKind::OverStation => self.over_station.as_ref(),
            NoticeKind::CheckInCheckOut => self.check_in_out.as_ref(),
        }
    }
}

/// One slot per notice kind, last write wins. Plain data: every mutation
/// comes from the reconciler's single loop.
#[derive(Debug, Default)]
pub struct ReconciliationStore {
    over_station: Option<PendingDecision>,
    check_in_out: Option<PendingDecision>,
}

impl ReconciliationStore {
    fn slot(&mut self, kind: NoticeKind) -> &mut Option<PendingDecision> {
        match kind {
            NoticeKind::OverStation => &mut self.over_station,
            NoticeKind::CheckInCheckOut => &mut self.check_in_out,
        }
    }

    /// Replaces the slot of the event's kind and returns the decision it
    /// superseded.
    pub fn apply(&mut self, event: InboundEvent) -> Option<PendingDecision> {
        let decision = PendingDecision::from(event);
        let kind = decision.kind();
        let superseded = self.slot(kind).replace(decision);
        if superseded.is_some() {
            tracing::debug!(%kind, "pending decision superseded");
        }
        superseded
    }

    /// Takes the pending decision out of its slot. The slot is empty
    /// afterwards whatever the caller does with the decision.
    pub fn confirm(&mut self, kind: NoticeKind) -> Result<PendingDecision, StoreError> {
        self.slot(kind).take().ok_or(StoreError::NothingPending(kind))
    }

    pub fn dismiss(&mut self, kind: NoticeKind) -> Option<PendingDecision> {
        self.slot(kind).take()
    }

    pub fn pending(&self, kind: NoticeKind) -> Option<&PendingDecision> {
        match kind {
            NoticeKind::OverStation => self.over_station.as_ref(),
            NoticeKind::CheckInCheckOut => self.check_in_out.as_ref(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            over_station: self.over_station.clone(),
            check_in_out: self.check_in_out.clone(),
        }
    }
}

impl EventSink for ReconciliationStore {
    fn apply(&mut self, event: InboundEvent) {
        ReconciliationStore::apply(self, event);
    }
}
