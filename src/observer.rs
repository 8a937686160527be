//! Pairing observer trait

use crate::{ActorId, DispatchError, PairingRequest, RateScope, RequestId};

/// Observer trait for external observability
pub trait PairingObserver: Send + Sync + 'static {
    /// A request was stored
    fn on_request_created(&self, request: &PairingRequest);
    /// A participant resolved a request
    fn on_request_resolved(&self, request: &PairingRequest);
    /// A request passed its deadline
    fn on_request_expired(&self, request: &PairingRequest);
    /// A conditional write lost and will be retried
    fn on_conflict_retry(&self, request_id: RequestId, attempt: u32);
    /// Retries ran out
    fn on_conflict_exhausted(&self, request_id: RequestId, attempts: u32);
    /// A bucket denied a call
    fn on_rate_limited(&self, actor: &ActorId, scope: RateScope, retry_after_secs: u64);
    /// An actor was muted
    fn on_muted(&self, actor: &ActorId, muted_until_millis: u64);
    /// A notice could not be delivered
    fn on_dispatch_failed(&self, request_id: RequestId, recipient: &ActorId, error: &DispatchError);
}

/// No-op observer
pub struct NoOpObserver;

impl PairingObserver for NoOpObserver {
    fn on_request_created(&self, _request: &PairingRequest) {}
    fn on_request_resolved(&self, _request: &PairingRequest) {}
    fn on_request_expired(&self, _request: &PairingRequest) {}
    fn on_conflict_retry(&self, _request_id: RequestId, _attempt: u32) {}
    fn on_conflict_exhausted(&self, _request_id: RequestId, _attempts: u32) {}
    fn on_rate_limited(&self, _actor: &ActorId, _scope: RateScope, _retry_after_secs: u64) {}
    fn on_muted(&self, _actor: &ActorId, _muted_until_millis: u64) {}
    fn on_dispatch_failed(&self, _request_id: RequestId, _recipient: &ActorId, _error: &DispatchError) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl PairingObserver for TracingObserver {
    fn on_request_created(&self, request: &PairingRequest) {
        tracing::info!(
            request_id = %request.id,
            requester = %request.requester_id,
            target = %request.target_id,
            resource = %request.resource_ref,
            expires_at = request.expires_at_millis,
            "Pairing request created"
        );
    }

    fn on_request_resolved(&self, request: &PairingRequest) {
        tracing::info!(
            request_id = %request.id,
            status = %request.status,
            resolved_by = ?request.resolved_by,
            version = request.version,
            "Pairing request resolved"
        );
    }

    fn on_request_expired(&self, request: &PairingRequest) {
        tracing::info!(request_id = %request.id, version = request.version, "Pairing request expired");
    }

    fn on_conflict_retry(&self, request_id: RequestId, attempt: u32) {
        tracing::warn!(request_id = %request_id, attempt, "Version conflict, retrying");
    }

    fn on_conflict_exhausted(&self, request_id: RequestId, attempts: u32) {
        tracing::error!(request_id = %request_id, attempts, "Version conflict retries exhausted");
    }

    fn on_rate_limited(&self, actor: &ActorId, scope: RateScope, retry_after_secs: u64) {
        tracing::debug!(actor = %actor, %scope, retry_after_secs, "Call rate limited");
    }

    fn on_muted(&self, actor: &ActorId, muted_until_millis: u64) {
        tracing::info!(actor = %actor, muted_until = muted_until_millis, "Actor muted");
    }

    fn on_dispatch_failed(&self, request_id: RequestId, recipient: &ActorId, error: &DispatchError) {
        tracing::warn!(request_id = %request_id, recipient = %recipient, error = %error, "Notification dispatch failed");
    }
}
