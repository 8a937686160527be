//! Consent-based pairing requests between two actors
//!
//! One actor asks another for a timed interaction; the other accepts or
//! declines, either side may cancel, and unanswered requests expire. The
//! core guarantees that concurrent callers racing on one request see a single
//! terminal outcome, that retried operations run their side effects once, and
//! that admission is fair per actor and bounded globally.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let (dispatcher, notices) = ChannelDispatcher::new();
//! let service = PairingService::in_memory(
//!     PairingConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(dispatcher),
//!     Arc::new(TracingObserver),
//! )?;
//!
//! let created = service
//!     .create_request(&alice, &bob, ResourceRef::new("chat"), Some(60), None)
//!     .await?;
//! let key = service.derive_key("resolve_request", &bob, &[&created.request.id.to_string()]);
//! let accepted = service
//!     .resolve_request(created.request.id, &bob, ResolveAction::Accept, Some(&key))
//!     .await?;
//!
//! // Keep expiring overdue requests in the background
//! let maintenance = spawn_maintenance(service.clone(), Duration::from_secs(5));
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod clock;
mod context;
mod errors;
mod events;
mod idempotency;
mod state;

// === Configuration ===
mod config;

// === Storage ===
mod codec;
mod dedupe;
mod registry;
mod store;
#[cfg(feature = "lmdb")]
mod lmdb;

// === Components ===
mod abuse;
mod controller;
mod ledger;
mod rate_limit;
mod session;

// === Observability ===
mod observer;
mod stats;

// === Service ===
mod maintenance;
mod service;

#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

// === Re-exports ===

// Types
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ActorId, RequestId, ResourceRef};
pub use idempotency::{IdempotencyKey, IdempotencyManager, Reservation};

// State machine
pub use state::{PairingRequest, Plan, RequestDraft, RequestStatus, ResolveAction, ResolveOutcome};

// Events
pub use events::{
    ChannelDispatcher, Delivery, NoOpDispatcher, NoticeKind, NotificationDispatcher, PairingNotice,
};

// Errors
pub use errors::{ConfigError, DispatchError, PairingError, StoreError};

// Configuration
pub use config::{
    AbuseConfig, BucketConfig, IdempotencyConfig, LedgerConfig, MutedReportPolicy, OperationCosts,
    PairingConfig, RateLimitConfig, RetryPolicy,
};

// Storage
pub use dedupe::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InMemoryIdempotencyStore};
pub use registry::Registry;
pub use store::{InMemoryRequestStore, InsertOutcome, RequestStore};
#[cfg(feature = "lmdb")]
pub use lmdb::{open_env, LmdbIdempotencyStore, LmdbRequestStore};

// Components
pub use abuse::{AbuseMonitor, ReportOutcome, ViolationAction, ViolationCounter, ViolationOutcome};
pub use controller::{ConcurrencyController, Mutation};
pub use ledger::RequestLedger;
pub use rate_limit::{OperationClass, RateDecision, RateLimiter, RateScope, TokenBucket};
pub use session::{RawSessionState, SessionRegistry, SessionState};

// Observability
pub use observer::{NoOpObserver, PairingObserver, TracingObserver};
pub use stats::{CoreStats, CoreStatsSnapshot};

// Service
pub use maintenance::{spawn_maintenance, MaintenanceHandle};
pub use service::{CreateResponse, MaintenanceReport, PairingService, ResolveResponse};
