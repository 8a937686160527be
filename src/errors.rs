//! Error types for pairing, storage, configuration and dispatch

use crate::{ActorId, RateScope, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};

/// Storage backend failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation
    #[error("Storage error: {0}")]
    Backend(Box<str>),
    /// A stored record could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(Box<str>),
    /// A lock guarding in-memory state was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    Poisoned(Box<str>),
}

impl StoreError {
    pub(crate) fn poisoned(err: impl std::fmt::Display) -> Self {
        Self::Poisoned(err.to_string().into())
    }
}

/// Error surfaced by the pairing core.
///
/// Every mutating call resolves to success, to `AlreadyResolved` carrying the
/// real terminal state, or to one of the rejections below.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PairingError {
    /// Malformed input
    #[error("Validation failed: {0}")]
    Validation(Box<str>),
    /// No request with this ID
    #[error("Request {0} not found")]
    NotFound(RequestId),
    /// The actor is not allowed to perform this action on the request
    #[error("Actor {actor} may not {action} request {request_id}")]
    Unauthorized {
        /// Request the action targeted
        request_id: RequestId,
        /// Offending actor
        actor: ActorId,
        /// Attempted action
        action: Box<str>,
    },
    /// The request already reached a terminal state
    #[error("Request {request_id} already {status}")]
    AlreadyResolved {
        /// Request ID
        request_id: RequestId,
        /// The terminal status that won
        status: RequestStatus,
        /// Actor that resolved it (`None` for expiry)
        resolved_by: Option<ActorId>,
        /// When it was resolved
        resolved_at_millis: Option<u64>,
    },
    /// The request passed its `expires_at`
    #[error("Request {request_id} expired at {expired_at_millis}")]
    Expired {
        /// Request ID
        request_id: RequestId,
        /// The request's deadline
        expired_at_millis: u64,
    },
    /// The requester already has a pending request for this target and resource
    #[error("Request {existing} is already pending for this target and resource")]
    DuplicateActiveRequest {
        /// The live request blocking the new one
        existing: RequestId,
    },
    /// Admission control denied the call
    #[error("Rate limited on {scope} bucket, retry after {retry_after_secs}s")]
    RateLimited {
        /// Which bucket denied
        scope: RateScope,
        /// Seconds until enough tokens are available
        retry_after_secs: u64,
    },
    /// The actor is muted
    #[error("Actor {actor} muted until {muted_until_millis}")]
    Muted {
        /// Muted actor
        actor: ActorId,
        /// End of the mute
        muted_until_millis: u64,
    },
    /// Optimistic concurrency retries were exhausted
    #[error("Request {request_id} still contended after {attempts} attempts")]
    Conflict {
        /// Contended request
        request_id: RequestId,
        /// Attempts made
        attempts: u32,
    },
    /// Another caller is executing the same idempotent operation
    #[error("Operation {key} is already being processed")]
    InProgress {
        /// Idempotency key in flight
        key: Box<str>,
    },
    /// Backend failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PairingError {
    pub(crate) fn validation(reason: impl Into<Box<str>>) -> Self {
        Self::Validation(reason.into())
    }

    /// Check if the caller may retry the same call unchanged later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Conflict { .. } | Self::InProgress { .. }
        )
    }

    /// Check if this is a business rejection rather than an infrastructure failure
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Conflict { .. })
    }
}

/// Invalid configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Dotted field path
        field: &'static str,
        /// What is wrong with it
        reason: Box<str>,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<Box<str>>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Notification delivery failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DispatchError {
    /// The transport is gone
    #[error("Dispatcher closed")]
    Closed,
    /// The transport refused the notice
    #[error("Delivery failed: {0}")]
    Failed(Box<str>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        let limited = PairingError::RateLimited {
            scope: RateScope::Global,
            retry_after_secs: 1,
        };
        assert!(limited.is_retriable());
        assert!(limited.is_rejection());

        let conflict = PairingError::Conflict {
            request_id: RequestId(1),
            attempts: 3,
        };
        assert!(conflict.is_retriable());
        assert!(!conflict.is_rejection());

        let resolved = PairingError::AlreadyResolved {
            request_id: RequestId(1),
            status: RequestStatus::Accepted,
            resolved_by: Some(ActorId::new("b")),
            resolved_at_millis: Some(5),
        };
        assert!(!resolved.is_retriable());
        assert!(resolved.is_rejection());
    }

    #[test]
    fn store_error_converts() {
        let err: PairingError = StoreError::Backend("disk full".into()).into();
        assert_eq!(err.to_string(), "Storage error: disk full");
    }
}
