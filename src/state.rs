//! Pairing request record and its state machine
//!
//! `pending` is the only live state. Every transition moves a pending record
//! into exactly one terminal state and bumps `version` by one. The functions
//! here are pure: they decide what the next record should be, and the
//! [`ConcurrencyController`](crate::ConcurrencyController) decides whether it
//! gets written.

use crate::{ActorId, PairingError, RequestId, ResourceRef};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pairing request
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub enum RequestStatus {
    /// Waiting for the target to answer
    Pending,
    /// Target accepted
    Accepted,
    /// Target declined
    Declined,
    /// Either party withdrew
    Cancelled,
    /// Deadline passed without an answer
    Expired,
}

impl RequestStatus {
    /// Check if no further transition is permitted
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action a participant takes on a pending request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveAction {
    /// Target consents
    Accept,
    /// Target refuses
    Decline,
    /// Either party withdraws
    Cancel {
        /// Free-form reason stored on the record
        reason: Option<String>,
    },
}

impl ResolveAction {
    /// Stable lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Cancel { .. } => "cancel",
        }
    }

    /// Status this action produces when it commits
    pub fn target_status(&self) -> RequestStatus {
        match self {
            Self::Accept => RequestStatus::Accepted,
            Self::Decline => RequestStatus::Declined,
            Self::Cancel { .. } => RequestStatus::Cancelled,
        }
    }
}

/// Input for a new pending request; the store assigns the ID
#[derive(Clone, Debug)]
pub struct RequestDraft {
    /// Actor asking for the interaction
    pub requester_id: ActorId,
    /// Actor being asked
    pub target_id: ActorId,
    /// What the interaction is about
    pub resource_ref: ResourceRef,
    /// Creation instant
    pub created_at_millis: u64,
    /// Deadline for an answer
    pub expires_at_millis: u64,
    /// Idempotency key of the create call, indexed by the store
    pub creation_key: Option<String>,
}

impl RequestDraft {
    /// Check the record invariants before anything is written
    pub fn validate(&self) -> Result<(), PairingError> {
        if self.requester_id == self.target_id {
            return Err(PairingError::validation("requester and target must differ"));
        }
        if self.requester_id.as_str().is_empty() || self.target_id.as_str().is_empty() {
            return Err(PairingError::validation("actor ids must not be empty"));
        }
        if self.resource_ref.as_str().is_empty() {
            return Err(PairingError::validation("resource_ref must not be empty"));
        }
        if self.expires_at_millis <= self.created_at_millis {
            return Err(PairingError::validation("expires_at must be after created_at"));
        }
        Ok(())
    }

    /// Materialize the first version of the record
    pub fn into_request(self, id: RequestId) -> PairingRequest {
        PairingRequest {
            id,
            requester_id: self.requester_id,
            target_id: self.target_id,
            resource_ref: self.resource_ref,
            status: RequestStatus::Pending,
            version: 1,
            created_at_millis: self.created_at_millis,
            expires_at_millis: self.expires_at_millis,
            resolved_by: None,
            resolved_at_millis: None,
            cancel_reason: None,
            creation_key: self.creation_key,
        }
    }
}

/// One consent negotiation between two actors
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct PairingRequest {
    /// Store-assigned ID
    pub id: RequestId,
    /// Actor asking for the interaction
    pub requester_id: ActorId,
    /// Actor being asked
    pub target_id: ActorId,
    /// What the interaction is about
    pub resource_ref: ResourceRef,
    /// Current lifecycle status
    pub status: RequestStatus,
    /// Starts at 1, +1 per committed mutation
    pub version: u64,
    /// Creation instant
    pub created_at_millis: u64,
    /// Deadline for an answer
    pub expires_at_millis: u64,
    /// Actor whose action made the record terminal; `None` for expiry
    pub resolved_by: Option<ActorId>,
    /// When the record became terminal
    pub resolved_at_millis: Option<u64>,
    /// Reason given with a cancel
    pub cancel_reason: Option<String>,
    /// Idempotency key the record was created under
    pub creation_key: Option<String>,
}

/// What the controller should do with a validated action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Write this next version and report success
    Apply(PairingRequest),
    /// Nothing to write; the record already reflects the action
    Settled,
    /// Write the expired version, then report `Expired`
    ExpireAndReject(PairingRequest),
}

impl PairingRequest {
    /// Check if the record is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the deadline has passed
    pub fn is_past_deadline(&self, now_millis: u64) -> bool {
        self.expires_at_millis <= now_millis
    }

    /// Check if the actor is one of the two parties
    pub fn involves(&self, actor: &ActorId) -> bool {
        &self.requester_id == actor || &self.target_id == actor
    }

    /// The other party, if `actor` is one of them
    pub fn counterpart(&self, actor: &ActorId) -> Option<&ActorId> {
        if &self.requester_id == actor {
            Some(&self.target_id)
        } else if &self.target_id == actor {
            Some(&self.requester_id)
        } else {
            None
        }
    }

    /// Decide the effect of `action` by `actor` at `now_millis`
    pub fn plan(
        &self,
        action: &ResolveAction,
        actor: &ActorId,
        now_millis: u64,
    ) -> Result<Plan, PairingError> {
        let authorized = match action {
            ResolveAction::Accept | ResolveAction::Decline => &self.target_id == actor,
            ResolveAction::Cancel { .. } => self.involves(actor),
        };
        if !authorized {
            return Err(PairingError::Unauthorized {
                request_id: self.id,
                actor: actor.clone(),
                action: action.name().into(),
            });
        }

        if self.is_terminal() {
            // Repeated cancel by either party is a replay, not an error
            if matches!(action, ResolveAction::Cancel { .. })
                && self.status == RequestStatus::Cancelled
            {
                return Ok(Plan::Settled);
            }
            return Err(self.already_resolved());
        }

        if self.is_past_deadline(now_millis) {
            return Ok(Plan::ExpireAndReject(self.expired(now_millis)));
        }

        let mut next = self.clone();
        next.status = action.target_status();
        next.version = self.version + 1;
        next.resolved_by = Some(actor.clone());
        next.resolved_at_millis = Some(now_millis);
        if let ResolveAction::Cancel { reason } = action {
            next.cancel_reason = reason.clone();
        }
        Ok(Plan::Apply(next))
    }

    /// Next version of a pending record after its deadline passed
    pub fn expired(&self, now_millis: u64) -> PairingRequest {
        let mut next = self.clone();
        next.status = RequestStatus::Expired;
        next.version = self.version + 1;
        next.resolved_by = None;
        next.resolved_at_millis = Some(now_millis);
        next
    }

    /// The error a late caller gets once the record is terminal
    pub fn already_resolved(&self) -> PairingError {
        PairingError::AlreadyResolved {
            request_id: self.id,
            status: self.status,
            resolved_by: self.resolved_by.clone(),
            resolved_at_millis: self.resolved_at_millis,
        }
    }

    /// The error for a caller that hit the deadline
    pub fn expired_error(&self) -> PairingError {
        PairingError::Expired {
            request_id: self.id,
            expired_at_millis: self.expires_at_millis,
        }
    }

    /// Summary returned to callers
    pub fn outcome(&self) -> ResolveOutcome {
        ResolveOutcome {
            request_id: self.id,
            status: self.status,
            resolved_by: self.resolved_by.clone(),
            resolved_at_millis: self.resolved_at_millis,
            version: self.version,
        }
    }
}

/// Result of a successful resolve call
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct ResolveOutcome {
    /// Request ID
    pub request_id: RequestId,
    /// Status after the call
    pub status: RequestStatus,
    /// Actor that resolved it (`None` for expiry)
    pub resolved_by: Option<ActorId>,
    /// When it was resolved
    pub resolved_at_millis: Option<u64>,
    /// Record version after the call
    pub version: u64,
}
