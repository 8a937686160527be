//! Outcome notices and the dispatcher seam
//!
//! Notices are built from committed records only and are handed to the
//! dispatcher after the ledger write returns. Delivery is best effort; its
//! result is reported next to the state transition, never instead of it.

use crate::{ActorId, DispatchError, PairingRequest, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Why an actor is being told something
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    /// A new request is waiting for the recipient's answer
    Received,
    /// The counterpart resolved the request
    Resolved,
    /// The request timed out
    Expired,
}

/// Notification for one recipient about one request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingNotice {
    /// Request the notice is about
    pub request_id: RequestId,
    /// Actor to notify
    pub recipient: ActorId,
    /// What happened
    pub kind: NoticeKind,
    /// Request status when sent
    pub status: RequestStatus,
    /// Record version when sent
    pub version: u64,
    /// Actor whose action caused the notice, if any
    pub actor: Option<ActorId>,
}

impl PairingNotice {
    /// Notices owed for a committed version of `record`.
    ///
    /// A new request tells the target; a resolution tells the other party;
    /// an expiry tells both.
    pub fn for_record(record: &PairingRequest) -> Vec<PairingNotice> {
        let notice = |recipient: &ActorId, kind| PairingNotice {
            request_id: record.id,
            recipient: recipient.clone(),
            kind,
            status: record.status,
            version: record.version,
            actor: record.resolved_by.clone(),
        };
        match (record.status, &record.resolved_by) {
            (RequestStatus::Pending, _) => {
                let mut n = notice(&record.target_id, NoticeKind::Received);
                n.actor = Some(record.requester_id.clone());
                vec![n]
            }
            (RequestStatus::Expired, _) | (_, None) => vec![
                notice(&record.requester_id, NoticeKind::Expired),
                notice(&record.target_id, NoticeKind::Expired),
            ],
            (_, Some(resolver)) => record
                .counterpart(resolver)
                .map(|other| vec![notice(other, NoticeKind::Resolved)])
                .unwrap_or_default(),
        }
    }
}

/// Transport that informs actors of outcomes
pub trait NotificationDispatcher: Send + Sync + 'static {
    /// Deliver one notice
    fn dispatch(&self, notice: PairingNotice) -> Result<(), DispatchError>;
}

/// Dispatcher that drops every notice
pub struct NoOpDispatcher;

impl NotificationDispatcher for NoOpDispatcher {
    fn dispatch(&self, _notice: PairingNotice) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Dispatcher that forwards notices into a tokio channel
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<PairingNotice>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiving end the transport drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PairingNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationDispatcher for ChannelDispatcher {
    fn dispatch(&self, notice: PairingNotice) -> Result<(), DispatchError> {
        self.tx.send(notice).map_err(|_| DispatchError::Closed)
    }
}

/// What happened to the notices for a call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// Every notice was handed to the dispatcher
    Sent,
    /// At least one notice failed; the transition itself stands
    Failed(DispatchError),
    /// Nothing was sent (replay, or no new commit)
    Skipped,
}
