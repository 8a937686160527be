//! Which pairing flow currently owns an actor's next input
//!
//! The messaging layer asks this registry where an actor's next message
//! belongs instead of keeping string-keyed flags. State changes follow
//! committed ledger records; untyped input from outside is validated through
//! [`RawSessionState`] before it can become a [`SessionState`].

use crate::{ActorId, PairingError, PairingRequest, RequestId, RequestStatus, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-actor pairing session state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing in flight
    #[default]
    Idle,
    /// The actor asked and is waiting for an answer
    AwaitingResponse {
        /// Outgoing request
        request_id: RequestId,
        /// Actor asked
        target: ActorId,
    },
    /// The actor has an incoming request to answer
    Deciding {
        /// Incoming request
        request_id: RequestId,
        /// Actor asking
        requester: ActorId,
    },
    /// The actor is in an accepted pairing
    Paired {
        /// Accepted request
        request_id: RequestId,
        /// The other party
        partner: ActorId,
    },
}

impl SessionState {
    /// Request this state is tied to, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Idle => None,
            Self::AwaitingResponse { request_id, .. }
            | Self::Deciding { request_id, .. }
            | Self::Paired { request_id, .. } => Some(*request_id),
        }
    }

    /// Stable lowercase name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingResponse { .. } => "awaiting_response",
            Self::Deciding { .. } => "deciding",
            Self::Paired { .. } => "paired",
        }
    }
}

/// Session state as it arrives from an untyped source
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSessionState {
    /// One of `idle`, `awaiting_response`, `deciding`, `paired`
    pub kind: String,
    /// Request the state is tied to
    pub request_id: Option<u64>,
    /// The other party
    pub counterpart: Option<String>,
}

impl TryFrom<RawSessionState> for SessionState {
    type Error = PairingError;

    fn try_from(raw: RawSessionState) -> Result<Self, Self::Error> {
        let linked = |raw: RawSessionState| -> Result<(RequestId, ActorId), PairingError> {
            let request_id = raw
                .request_id
                .ok_or_else(|| PairingError::validation(format!("{} session needs request_id", raw.kind)))?;
            let counterpart = raw
                .counterpart
                .filter(|c| !c.is_empty())
                .ok_or_else(|| PairingError::validation(format!("{} session needs counterpart", raw.kind)))?;
            Ok((RequestId(request_id), ActorId::new(counterpart)))
        };

        match raw.kind.as_str() {
            "idle" => {
                if raw.request_id.is_some() || raw.counterpart.is_some() {
                    return Err(PairingError::validation("idle session carries no request"));
                }
                Ok(Self::Idle)
            }
            "awaiting_response" => {
                let (request_id, target) = linked(raw)?;
                Ok(Self::AwaitingResponse { request_id, target })
            }
            "deciding" => {
                let (request_id, requester) = linked(raw)?;
                Ok(Self::Deciding { request_id, requester })
            }
            "paired" => {
                let (request_id, partner) = linked(raw)?;
                Ok(Self::Paired { request_id, partner })
            }
            other => Err(PairingError::validation(format!("unknown session kind {other:?}"))),
        }
    }
}

impl From<&SessionState> for RawSessionState {
    fn from(state: &SessionState) -> Self {
        let counterpart = match state {
            SessionState::Idle => None,
            SessionState::AwaitingResponse { target, .. } => Some(target),
            SessionState::Deciding { requester, .. } => Some(requester),
            SessionState::Paired { partner, .. } => Some(partner),
        };
        Self {
            kind: state.kind().to_owned(),
            request_id: state.request_id().map(|id| id.get()),
            counterpart: counterpart.map(|c| c.as_str().to_owned()),
        }
    }
}

#[derive(Debug, Default)]
struct Tracked {
    state: SessionState,
    /// Newest record version folded in for this actor
    last_applied: Option<(RequestId, u64)>,
}

impl Tracked {
    fn has_seen(&self, record: &PairingRequest) -> bool {
        matches!(self.last_applied, Some((id, version)) if id == record.id && version >= record.version)
    }
}

/// Session state for every actor with something in flight
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ActorId, Tracked>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Current state of `actor`; unknown actors are idle
    pub fn get(&self, actor: &ActorId) -> Result<SessionState, StoreError> {
        let sessions = self.sessions.read().map_err(StoreError::poisoned)?;
        Ok(sessions.get(actor).map(|t| t.state.clone()).unwrap_or_default())
    }

    /// Fold a committed record into both parties' sessions.
    ///
    /// Updates run after the ledger write and may arrive out of order; a
    /// record no newer than the last one applied for the same request is
    /// ignored.
    pub fn apply(&self, record: &PairingRequest) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(StoreError::poisoned)?;
        let requester = &record.requester_id;
        let target = &record.target_id;

        for (actor, counterpart, asked) in [(requester, target, true), (target, requester, false)] {
            let tracked = sessions.entry(actor.clone()).or_default();
            if tracked.has_seen(record) {
                tracing::debug!(
                    actor = %actor,
                    request_id = %record.id,
                    version = record.version,
                    "Stale session update ignored"
                );
                continue;
            }
            tracked.last_applied = Some((record.id, record.version));

            match record.status {
                RequestStatus::Pending if asked => {
                    tracked.state = SessionState::AwaitingResponse {
                        request_id: record.id,
                        target: counterpart.clone(),
                    };
                }
                RequestStatus::Pending => {
                    // An actor already answering or paired keeps that focus
                    if tracked.state == SessionState::Idle {
                        tracked.state = SessionState::Deciding {
                            request_id: record.id,
                            requester: counterpart.clone(),
                        };
                    }
                }
                RequestStatus::Accepted => {
                    tracked.state = SessionState::Paired {
                        request_id: record.id,
                        partner: counterpart.clone(),
                    };
                }
                RequestStatus::Declined | RequestStatus::Cancelled | RequestStatus::Expired => {
                    if tracked.state.request_id() == Some(record.id) {
                        tracked.state = SessionState::Idle;
                    }
                }
            }
        }
        Ok(())
    }

    /// Install a state received from outside after validating it
    pub fn restore(&self, actor: ActorId, raw: RawSessionState) -> Result<SessionState, PairingError> {
        let state = SessionState::try_from(raw)?;
        let mut sessions = self.sessions.write().map_err(StoreError::poisoned)?;
        sessions.entry(actor).or_default().state = state.clone();
        Ok(state)
    }

    /// Return the actor to idle, e.g. when a paired interaction ends
    pub fn reset(&self, actor: &ActorId) -> Result<(), StoreError> {
        if let Some(tracked) = self.sessions.write().map_err(StoreError::poisoned)?.get_mut(actor) {
            tracked.state = SessionState::Idle;
        }
        Ok(())
    }

    /// Teardown: forget every session
    pub fn clear(&self) -> Result<(), StoreError> {
        self.sessions.write().map_err(StoreError::poisoned)?.clear();
        Ok(())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
