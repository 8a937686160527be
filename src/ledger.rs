//! Request ledger: owns pairing requests and their lifecycle

use crate::{
    ActorId, Clock, ConcurrencyController, CoreStats, IdempotencyKey, InsertOutcome, LedgerConfig, Mutation,
    PairingError, PairingObserver, PairingRequest, RequestDraft, RequestId, RequestStatus,
    RequestStore, ResolveAction, ResourceRef, RetryPolicy,
};
use std::sync::Arc;

/// Pairing request state machine over a [`RequestStore`]
pub struct RequestLedger {
    controller: ConcurrencyController,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn PairingObserver>,
    stats: Arc<CoreStats>,
}

impl RequestLedger {
    /// Create a ledger over `store`
    pub fn new(
        store: Arc<dyn RequestStore>,
        config: LedgerConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn PairingObserver>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            controller: ConcurrencyController::new(store, retry, observer.clone(), stats.clone()),
            config,
            clock,
            observer,
            stats,
        }
    }

    fn store(&self) -> &Arc<dyn RequestStore> {
        self.controller.store()
    }

    /// Open a pending request from `requester` to `target`.
    ///
    /// `ttl_secs` falls back to the configured default and must lie within
    /// the configured bounds.
    pub fn create(
        &self,
        requester: ActorId,
        target: ActorId,
        resource_ref: ResourceRef,
        ttl_secs: Option<u64>,
    ) -> Result<PairingRequest, PairingError> {
        self.create_keyed(requester, target, resource_ref, ttl_secs, None)
            .map(Mutation::into_record)
    }

    /// Open a request under an idempotency key.
    ///
    /// If a record was already created under `creation_key` it comes back as
    /// `Mutation::Settled` and nothing is inserted, even when that record has
    /// since left `pending`.
    pub fn create_keyed(
        &self,
        requester: ActorId,
        target: ActorId,
        resource_ref: ResourceRef,
        ttl_secs: Option<u64>,
        creation_key: Option<&IdempotencyKey>,
    ) -> Result<Mutation, PairingError> {
        let ttl_secs = ttl_secs.unwrap_or(self.config.default_ttl_secs);
        if !(self.config.min_ttl_secs..=self.config.max_ttl_secs).contains(&ttl_secs) {
            return Err(PairingError::validation(format!(
                "ttl must lie within [{}, {}] seconds",
                self.config.min_ttl_secs, self.config.max_ttl_secs
            )));
        }

        let now = self.clock.now_millis();
        let draft = RequestDraft {
            requester_id: requester,
            target_id: target,
            resource_ref,
            created_at_millis: now,
            expires_at_millis: now.saturating_add(ttl_secs.saturating_mul(1000)),
            creation_key: creation_key.map(|key| key.as_str().to_owned()),
        };
        draft.validate()?;

        match self.store().insert_pending(draft)? {
            InsertOutcome::Inserted(record) => {
                CoreStats::bump(&self.stats.requests_created);
                self.observer.on_request_created(&record);
                Ok(Mutation::Applied(record))
            }
            InsertOutcome::Existing(record) => {
                tracing::debug!(request_id = %record.id, "Create key already has a record");
                Ok(Mutation::Settled(record))
            }
            InsertOutcome::Duplicate(existing) => Err(PairingError::DuplicateActiveRequest { existing }),
        }
    }

    /// Apply `action` by `actor`, reporting expiry-on-access as a mutation.
    ///
    /// This is the form the service uses: it needs the expired record to
    /// notify both parties. [`accept`](Self::accept) and friends fold the
    /// expiry into `PairingError::Expired`.
    pub async fn resolve(
        &self,
        id: RequestId,
        actor: &ActorId,
        action: &ResolveAction,
    ) -> Result<Mutation, PairingError> {
        let mutation = self
            .controller
            .mutate(id, |current| current.plan(action, actor, self.clock.now_millis()))
            .await?;

        match &mutation {
            Mutation::Applied(record) => self.observer.on_request_resolved(record),
            Mutation::ExpiredOnAccess(record) => {
                CoreStats::bump(&self.stats.requests_expired);
                self.observer.on_request_expired(record);
            }
            Mutation::Settled(_) => {}
        }
        Ok(mutation)
    }

    async fn resolve_strict(
        &self,
        id: RequestId,
        actor: &ActorId,
        action: ResolveAction,
    ) -> Result<PairingRequest, PairingError> {
        match self.resolve(id, actor, &action).await? {
            Mutation::ExpiredOnAccess(record) => Err(record.expired_error()),
            other => Ok(other.into_record()),
        }
    }

    /// Target consents
    pub async fn accept(&self, id: RequestId, actor: &ActorId) -> Result<PairingRequest, PairingError> {
        self.resolve_strict(id, actor, ResolveAction::Accept).await
    }

    /// Target refuses
    pub async fn decline(&self, id: RequestId, actor: &ActorId) -> Result<PairingRequest, PairingError> {
        self.resolve_strict(id, actor, ResolveAction::Decline).await
    }

    /// Either party withdraws; repeating it returns the stored resolution
    pub async fn cancel(
        &self,
        id: RequestId,
        actor: &ActorId,
        reason: Option<String>,
    ) -> Result<PairingRequest, PairingError> {
        self.resolve_strict(id, actor, ResolveAction::Cancel { reason }).await
    }

    /// Expire every pending request whose deadline is at or before `now_millis`.
    ///
    /// Safe to run from several workers at once: the store claims each row
    /// for exactly one caller.
    pub fn expire_sweep(&self, now_millis: u64) -> Result<Vec<PairingRequest>, PairingError> {
        let mut expired = Vec::new();
        loop {
            let claimed = self.store().claim_expired(now_millis, self.config.sweep_batch)?;
            let full_batch = claimed.len() == self.config.sweep_batch;
            for record in &claimed {
                CoreStats::bump(&self.stats.requests_expired);
                CoreStats::bump(&self.stats.transitions_committed);
                self.observer.on_request_expired(record);
            }
            expired.extend(claimed);
            if !full_batch {
                break;
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), now = now_millis, "Expiry sweep claimed requests");
        }
        Ok(expired)
    }

    /// Fetch one request
    pub fn get(&self, id: RequestId) -> Result<PairingRequest, PairingError> {
        self.store().get(id)?.ok_or(PairingError::NotFound(id))
    }

    /// Pending requests waiting on `target`
    pub fn list_incoming(&self, target: &ActorId) -> Result<Vec<PairingRequest>, PairingError> {
        Ok(self.store().list_by_target(target, RequestStatus::Pending)?)
    }

    /// Delete terminal requests resolved before `cutoff_millis`
    pub fn purge_resolved_before(&self, cutoff_millis: u64) -> Result<usize, PairingError> {
        Ok(self.store().purge_resolved_before(cutoff_millis)?)
    }

    /// Forget per-request locks nobody holds
    pub fn prune_locks(&self) -> Result<usize, PairingError> {
        Ok(self.controller.prune_locks()?)
    }
}
