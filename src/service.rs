//! Service contract consumed by the messaging layer
//!
//! Every mutating call runs the same pipeline: idempotency reservation, mute
//! check, rate admission, the guarded ledger write, and only then, with no
//! lock held, notification dispatch. A call resolves to a committed state, to
//! `AlreadyResolved` with the real state, or to a rejection. Delivery problems
//! are reported beside the outcome and never replace it.

use crate::codec::{decode, encode};
use crate::{
    AbuseMonitor, ActorId, Clock, ConfigError, CoreStats, CoreStatsSnapshot, Delivery,
    IdempotencyKey, IdempotencyManager, IdempotencyStore, InMemoryIdempotencyStore,
    InMemoryRequestStore, Mutation, NotificationDispatcher, OperationClass, PairingConfig,
    PairingError, PairingNotice, PairingObserver, PairingRequest, RateDecision, RateLimiter,
    ReportOutcome, RequestId, RequestLedger, RequestStore, Reservation, ResolveAction,
    ResolveOutcome, ResourceRef, SessionRegistry, SessionState, StoreError, ViolationAction,
    ViolationCounter, ViolationOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CREATE_OPERATION: &str = "create_request";
const RESOLVE_OPERATION: &str = "resolve_request";

/// Reply to `create_request`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateResponse {
    /// The request as created
    pub request: PairingRequest,
    /// Served from a completed idempotency record
    pub replayed: bool,
    /// How notifying the target went
    pub delivery: Delivery,
}

/// Reply to `resolve_request`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveResponse {
    /// Resulting state
    pub outcome: ResolveOutcome,
    /// Served from a completed idempotency record
    pub replayed: bool,
    /// How notifying both parties went
    pub delivery: Delivery,
}

/// What one maintenance pass did
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Requests the sweep expired
    pub expired: usize,
    /// Idempotency records past retention
    pub idempotency_purged: usize,
    /// Idle per-request locks dropped
    pub locks_pruned: usize,
    /// Full actor buckets dropped
    pub buckets_pruned: usize,
    /// Clean abuse standings dropped
    pub standings_pruned: usize,
    /// Expiry notices that failed
    pub notifications_failed: usize,
}

/// The pairing core behind one façade
pub struct PairingService {
    config: PairingConfig,
    clock: Arc<dyn Clock>,
    ledger: RequestLedger,
    limiter: RateLimiter,
    idempotency: IdempotencyManager,
    abuse: AbuseMonitor,
    sessions: SessionRegistry,
    dispatcher: Arc<dyn NotificationDispatcher>,
    observer: Arc<dyn PairingObserver>,
    stats: Arc<CoreStats>,
}

impl PairingService {
    /// Build a service over the given stores, validating `config`
    pub fn new(
        config: PairingConfig,
        clock: Arc<dyn Clock>,
        requests: Arc<dyn RequestStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        observer: Arc<dyn PairingObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let stats = Arc::new(CoreStats::new());
        Ok(Self {
            ledger: RequestLedger::new(
                requests,
                config.ledger.clone(),
                config.retry.clone(),
                clock.clone(),
                observer.clone(),
                stats.clone(),
            ),
            limiter: RateLimiter::new(config.rate_limit.clone(), clock.clone()),
            idempotency: IdempotencyManager::new(idempotency, config.idempotency.clone(), clock.clone()),
            abuse: AbuseMonitor::new(config.abuse.clone(), clock.clone()),
            sessions: SessionRegistry::new(),
            config,
            clock,
            dispatcher,
            observer,
            stats,
        })
    }

    /// Single-instance service over the in-memory stores
    pub fn in_memory(
        config: PairingConfig,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        observer: Arc<dyn PairingObserver>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            config,
            clock,
            Arc::new(InMemoryRequestStore::new()),
            Arc::new(InMemoryIdempotencyStore::new()),
            dispatcher,
            observer,
        )
    }

    // === Contract ===

    /// Open a pending request from `requester` to `target`.
    ///
    /// Without a key, a retried create is caught by the duplicate-active check.
    /// With one, the key is stored on the record, so a retry that reclaims the
    /// key from a crashed worker gets that worker's request back.
    pub async fn create_request(
        &self,
        requester: &ActorId,
        target: &ActorId,
        resource_ref: ResourceRef,
        ttl_secs: Option<u64>,
        key: Option<&IdempotencyKey>,
    ) -> Result<CreateResponse, PairingError> {
        if let Some(key) = key {
            if let Some(bytes) = self.reserve_for(key, CREATE_OPERATION)? {
                let request = decode::<PairingRequest>(&bytes)?;
                return Ok(CreateResponse {
                    request,
                    replayed: true,
                    delivery: Delivery::Skipped,
                });
            }
        }

        let created = self.admit_mutation(requester).and_then(|()| {
            self.ledger
                .create_keyed(requester.clone(), target.clone(), resource_ref, ttl_secs, key)
        });
        let mutation = self.settle_reservation(key, created, |m: &Mutation| encode(m.record()))?;

        let delivery = match &mutation {
            Mutation::Settled(request) => {
                tracing::info!(request_id = %request.id, "Recovered outcome of abandoned create");
                Delivery::Skipped
            }
            _ => {
                self.track_session(mutation.record());
                self.notify(mutation.record())
            }
        };
        Ok(CreateResponse {
            request: mutation.into_record(),
            replayed: false,
            delivery,
        })
    }

    /// Accept, decline or cancel a request.
    ///
    /// With a key, a second call returns the first call's outcome decoded from
    /// the same stored bytes and dispatches nothing.
    pub async fn resolve_request(
        &self,
        request_id: RequestId,
        actor: &ActorId,
        action: ResolveAction,
        key: Option<&IdempotencyKey>,
    ) -> Result<ResolveResponse, PairingError> {
        let mut reclaimed = false;
        if let Some(key) = key {
            match self.idempotency.reserve(key, RESOLVE_OPERATION)? {
                Reservation::Acquired { reclaimed: r } => reclaimed = r,
                Reservation::Completed { result } => {
                    CoreStats::bump(&self.stats.idempotent_replays);
                    let bytes = result.ok_or_else(|| missing_result(key))?;
                    return Ok(ResolveResponse {
                        outcome: decode::<ResolveOutcome>(&bytes)?,
                        replayed: true,
                        delivery: Delivery::Skipped,
                    });
                }
                Reservation::InProgress => return Err(in_progress(key)),
            }
        }

        let resolved = match self.admit_mutation(actor) {
            Ok(()) => self.ledger.resolve(request_id, actor, &action).await,
            Err(err) => Err(err),
        };

        // A reclaimed key may belong to a worker that committed and then died
        let resolved = match resolved {
            Err(PairingError::AlreadyResolved { status, resolved_by, .. })
                if reclaimed
                    && status == action.target_status()
                    && resolved_by.as_ref() == Some(actor) =>
            {
                tracing::info!(request_id = %request_id, actor = %actor, "Recovered outcome of abandoned resolve");
                self.ledger.get(request_id).map(Mutation::Settled)
            }
            other => other,
        };

        let mutation = match resolved {
            Ok(Mutation::ExpiredOnAccess(record)) => {
                self.track_session(&record);
                self.notify(&record);
                Err(record.expired_error())
            }
            other => other,
        };

        let mutation = self.settle_reservation(key, mutation, |m: &Mutation| encode(&m.record().outcome()))?;
        let delivery = if mutation.committed() {
            self.track_session(mutation.record());
            self.notify(mutation.record())
        } else {
            Delivery::Skipped
        };
        Ok(ResolveResponse {
            outcome: mutation.record().outcome(),
            replayed: false,
            delivery,
        })
    }

    /// Check and debit the caller's rate budget for `class`
    pub fn check_rate(&self, actor: &ActorId, class: OperationClass) -> Result<RateDecision, PairingError> {
        let decision = self.limiter.check(actor, class)?;
        if let Some(scope) = decision.denied_by {
            CoreStats::bump(&self.stats.rate_limited);
            self.observer.on_rate_limited(actor, scope, decision.retry_after_secs);
        }
        Ok(decision)
    }

    /// Reserve `key` for a side effect the caller runs itself
    pub fn reserve_idempotent(&self, key: &IdempotencyKey, operation: &str) -> Result<Reservation, PairingError> {
        let reservation = self.idempotency.reserve(key, operation)?;
        if reservation.is_duplicate() {
            CoreStats::bump(&self.stats.idempotent_replays);
        }
        Ok(reservation)
    }

    /// Record the result of a side effect reserved with `reserve_idempotent`
    pub fn complete_idempotent(&self, key: &IdempotencyKey, result: Vec<u8>) -> Result<bool, PairingError> {
        Ok(self.idempotency.complete(key, result)?)
    }

    /// Give up on a reserved side effect so a retry may run it
    pub fn fail_idempotent(&self, key: &IdempotencyKey) -> Result<bool, PairingError> {
        Ok(self.idempotency.fail(key)?)
    }

    /// Derive a key for `operation` in the current time window
    pub fn derive_key(&self, operation: &str, actor: &ActorId, params: &[&str]) -> IdempotencyKey {
        self.idempotency.derive_key(operation, actor, params)
    }

    /// `reporter` flags `target`; reporters are rate limited but never muted out
    pub fn report_actor(&self, reporter: &ActorId, target: &ActorId) -> Result<ReportOutcome, PairingError> {
        self.check_rate(reporter, OperationClass::Mutation)?.into_result()?;
        let was_muted = self.abuse.check_muted(target).is_err();
        let outcome = self.abuse.report(reporter, target)?;
        if let (false, Some(until)) = (was_muted, outcome.muted_until_millis) {
            self.observer.on_muted(target, until);
        }
        Ok(outcome)
    }

    /// Count a rule violation against `actor`
    pub fn record_violation(&self, actor: &ActorId) -> Result<ViolationOutcome, PairingError> {
        let outcome = self.abuse.record_violation(actor)?;
        if let ViolationAction::Muted { until_millis } = outcome.action {
            self.observer.on_muted(actor, until_millis);
        }
        Ok(outcome)
    }

    /// Violation count and mute end for `actor`
    pub fn violation_counter(&self, actor: &ActorId) -> Result<ViolationCounter, PairingError> {
        self.abuse.counter(actor)
    }

    /// Forget `actor`'s violations; a running mute stays
    pub fn reset_violations(&self, actor: &ActorId) -> Result<(), PairingError> {
        self.abuse.reset_violations(actor)
    }

    /// Lift a mute and drop pending reports
    pub fn unmute(&self, actor: &ActorId) -> Result<(), PairingError> {
        self.abuse.unmute(actor)
    }

    // === Reads ===

    /// Fetch a request; only its two parties may see it
    pub fn get_request(&self, actor: &ActorId, request_id: RequestId) -> Result<PairingRequest, PairingError> {
        self.check_rate(actor, OperationClass::Read)?.into_result()?;
        let record = self.ledger.get(request_id)?;
        if !record.involves(actor) {
            return Err(PairingError::Unauthorized {
                request_id,
                actor: actor.clone(),
                action: "view".into(),
            });
        }
        Ok(record)
    }

    /// Pending requests waiting on `actor`
    pub fn list_incoming(&self, actor: &ActorId) -> Result<Vec<PairingRequest>, PairingError> {
        self.check_rate(actor, OperationClass::FanOut)?.into_result()?;
        self.ledger.list_incoming(actor)
    }

    /// Where `actor`'s next input belongs
    pub fn session_state(&self, actor: &ActorId) -> Result<SessionState, PairingError> {
        Ok(self.sessions.get(actor)?)
    }

    /// The session registry, for the messaging layer to restore or reset state
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Counters since construction
    pub fn stats(&self) -> CoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Active configuration
    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    // === Upkeep ===

    /// Expire overdue requests, notify both parties and trim every registry
    pub fn run_maintenance(&self) -> Result<MaintenanceReport, PairingError> {
        let mut report = MaintenanceReport::default();

        let expired = self.ledger.expire_sweep(self.clock.now_millis())?;
        report.expired = expired.len();
        for record in &expired {
            self.track_session(record);
            if let Delivery::Failed(_) = self.notify(record) {
                report.notifications_failed += 1;
            }
        }

        report.idempotency_purged = self.idempotency.collect_garbage()?;
        report.locks_pruned = self.ledger.prune_locks()?;
        report.buckets_pruned = self.limiter.prune_idle()?;
        report.standings_pruned = self.abuse.prune()?;

        if report.expired > 0 || report.idempotency_purged > 0 {
            tracing::debug!(?report, "Maintenance pass finished");
        }
        Ok(report)
    }

    /// Delete terminal requests resolved before `cutoff_millis` (archival hook)
    pub fn purge_resolved_before(&self, cutoff_millis: u64) -> Result<usize, PairingError> {
        self.ledger.purge_resolved_before(cutoff_millis)
    }

    /// Teardown of process-local registries; stored requests are untouched
    pub fn clear_registries(&self) -> Result<(), PairingError> {
        self.limiter.reset()?;
        self.abuse.clear()?;
        self.sessions.clear()?;
        self.ledger.prune_locks()?;
        Ok(())
    }

    // === Pipeline steps ===

    /// Reserve `key`; `Some(bytes)` is a completed replay
    fn reserve_for(&self, key: &IdempotencyKey, operation: &str) -> Result<Option<Vec<u8>>, PairingError> {
        match self.idempotency.reserve(key, operation)? {
            Reservation::Acquired { .. } => Ok(None),
            Reservation::Completed { result } => {
                CoreStats::bump(&self.stats.idempotent_replays);
                result.map(Some).ok_or_else(|| missing_result(key))
            }
            Reservation::InProgress => Err(in_progress(key)),
        }
    }

    /// Mute check, then rate admission, for a mutating call
    fn admit_mutation(&self, actor: &ActorId) -> Result<(), PairingError> {
        if let Err(err) = self.abuse.check_muted(actor) {
            CoreStats::bump(&self.stats.muted_rejections);
            tracing::debug!(actor = %actor, "Muted actor rejected");
            return Err(err);
        }
        self.check_rate(actor, OperationClass::Mutation)?.into_result()
    }

    /// Finish the reservation for `key` according to how the call went.
    ///
    /// Success stores the encoded result. A definite rejection marks the key
    /// failed so a retry may run again. A store failure leaves it in progress:
    /// the write may have landed, and the key becomes reclaimable once stale.
    fn settle_reservation<T>(
        &self,
        key: Option<&IdempotencyKey>,
        result: Result<T, PairingError>,
        encode_result: impl FnOnce(&T) -> Result<Vec<u8>, StoreError>,
    ) -> Result<T, PairingError> {
        let Some(key) = key else {
            return result;
        };
        match &result {
            Ok(value) => {
                self.idempotency.complete(key, encode_result(value)?)?;
            }
            Err(PairingError::Store(err)) => {
                tracing::error!(key = %key, error = %err, "Store failure under idempotency key");
            }
            Err(_) => {
                self.idempotency.fail(key)?;
            }
        }
        result
    }

    fn track_session(&self, record: &PairingRequest) {
        if let Err(err) = self.sessions.apply(record) {
            tracing::error!(request_id = %record.id, error = %err, "Session update failed");
        }
    }

    /// Hand every notice for `record` to the dispatcher; no lock is held here
    fn notify(&self, record: &PairingRequest) -> Delivery {
        let mut delivery = Delivery::Sent;
        for notice in PairingNotice::for_record(record) {
            let recipient = notice.recipient.clone();
            match self.dispatcher.dispatch(notice) {
                Ok(()) => CoreStats::bump(&self.stats.notifications_sent),
                Err(err) => {
                    CoreStats::bump(&self.stats.notifications_failed);
                    self.observer.on_dispatch_failed(record.id, &recipient, &err);
                    if delivery == Delivery::Sent {
                        delivery = Delivery::Failed(err);
                    }
                }
            }
        }
        delivery
    }
}

fn in_progress(key: &IdempotencyKey) -> PairingError {
    PairingError::InProgress {
        key: key.as_str().into(),
    }
}

fn missing_result(key: &IdempotencyKey) -> PairingError {
    StoreError::Codec(format!("completed idempotency record {key} has no result").into()).into()
}
