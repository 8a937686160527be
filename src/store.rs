//! Request ledger storage
//!
//! The store is the only source of truth for mutual exclusion on a request:
//! `compare_and_swap` and `claim_expired` must be atomic conditional writes,
//! whatever locking the caller does in front of them.

use crate::{ActorId, PairingRequest, RequestDraft, RequestId, RequestStatus, StoreError};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Result of inserting a new pending request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored with a freshly allocated ID
    Inserted(PairingRequest),
    /// The requester already has a live pending request for the same target and resource
    Duplicate(RequestId),
    /// A record was already created under the draft's creation key
    Existing(PairingRequest),
}

/// Durable storage for pairing requests
pub trait RequestStore: Send + Sync + 'static {
    /// Atomically check the creation key and for a live duplicate, then
    /// allocate an ID and insert at version 1
    fn insert_pending(&self, draft: RequestDraft) -> Result<InsertOutcome, StoreError>;

    /// Fetch one record
    fn get(&self, id: RequestId) -> Result<Option<PairingRequest>, StoreError>;

    /// Replace the stored record with `next` only if the stored version is
    /// still `expected_version`. Returns whether the write happened.
    fn compare_and_swap(&self, expected_version: u64, next: &PairingRequest) -> Result<bool, StoreError>;

    /// Transition up to `limit` pending records with `expires_at <= now` to
    /// expired and return the new versions. A record is returned by exactly
    /// one call.
    fn claim_expired(&self, now_millis: u64, limit: usize) -> Result<Vec<PairingRequest>, StoreError>;

    /// Records addressed to `target` in `status`, oldest first
    fn list_by_target(&self, target: &ActorId, status: RequestStatus) -> Result<Vec<PairingRequest>, StoreError>;

    /// Delete terminal records resolved before `cutoff_millis`
    fn purge_resolved_before(&self, cutoff_millis: u64) -> Result<usize, StoreError>;
}

pub(crate) fn is_live_duplicate(existing: &PairingRequest, draft: &RequestDraft) -> bool {
    existing.status == RequestStatus::Pending
        && existing.expires_at_millis > draft.created_at_millis
        && existing.requester_id == draft.requester_id
        && existing.target_id == draft.target_id
        && existing.resource_ref == draft.resource_ref
}

#[derive(Default)]
struct Tables {
    rows: HashMap<RequestId, PairingRequest>,
    by_target: HashMap<ActorId, BTreeSet<RequestId>>,
    pending_by_deadline: BTreeSet<(u64, RequestId)>,
    by_creation_key: HashMap<String, RequestId>,
    last_id: u64,
}

impl Tables {
    fn put(&mut self, record: PairingRequest) {
        if record.status != RequestStatus::Pending {
            self.pending_by_deadline
                .remove(&(record.expires_at_millis, record.id));
        }
        self.rows.insert(record.id, record);
    }
}

/// In-memory request store
pub struct InMemoryRequestStore {
    tables: RwLock<Tables>,
}

impl InMemoryRequestStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Number of stored requests
    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Check if no requests are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestStore for InMemoryRequestStore {
    fn insert_pending(&self, draft: RequestDraft) -> Result<InsertOutcome, StoreError> {
        let mut tables = self.tables.write().map_err(StoreError::poisoned)?;

        let keyed = draft
            .creation_key
            .as_ref()
            .and_then(|key| tables.by_creation_key.get(key))
            .and_then(|id| tables.rows.get(id));
        if let Some(existing) = keyed {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        if let Some(ids) = tables.by_target.get(&draft.target_id) {
            let duplicate = ids
                .iter()
                .filter_map(|id| tables.rows.get(id))
                .find(|existing| is_live_duplicate(existing, &draft));
            if let Some(existing) = duplicate {
                return Ok(InsertOutcome::Duplicate(existing.id));
            }
        }

        tables.last_id += 1;
        let record = draft.into_request(RequestId(tables.last_id));
        tables
            .by_target
            .entry(record.target_id.clone())
            .or_default()
            .insert(record.id);
        tables
            .pending_by_deadline
            .insert((record.expires_at_millis, record.id));
        if let Some(key) = &record.creation_key {
            tables.by_creation_key.insert(key.clone(), record.id);
        }
        tables.rows.insert(record.id, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    fn get(&self, id: RequestId) -> Result<Option<PairingRequest>, StoreError> {
        let tables = self.tables.read().map_err(StoreError::poisoned)?;
        Ok(tables.rows.get(&id).cloned())
    }

    fn compare_and_swap(&self, expected_version: u64, next: &PairingRequest) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().map_err(StoreError::poisoned)?;
        let current = tables
            .rows
            .get(&next.id)
            .is_some_and(|current| current.version == expected_version);
        if current {
            tables.put(next.clone());
        }
        Ok(current)
    }

    fn claim_expired(&self, now_millis: u64, limit: usize) -> Result<Vec<PairingRequest>, StoreError> {
        let mut tables = self.tables.write().map_err(StoreError::poisoned)?;
        let due: Vec<RequestId> = tables
            .pending_by_deadline
            .iter()
            .take_while(|(deadline, _)| *deadline <= now_millis)
            .take(limit)
            .map(|(_, id)| *id)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let Some(current) = tables.rows.get(&id) else {
                continue;
            };
            if current.status != RequestStatus::Pending {
                continue;
            }
            let next = current.expired(now_millis);
            tables.put(next.clone());
            claimed.push(next);
        }
        Ok(claimed)
    }

    fn list_by_target(&self, target: &ActorId, status: RequestStatus) -> Result<Vec<PairingRequest>, StoreError> {
        let tables = self.tables.read().map_err(StoreError::poisoned)?;
        Ok(tables
            .by_target
            .get(target)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.rows.get(id))
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    fn purge_resolved_before(&self, cutoff_millis: u64) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().map_err(StoreError::poisoned)?;
        let doomed: Vec<(RequestId, ActorId, Option<String>)> = tables
            .rows
            .values()
            .filter(|r| r.is_terminal() && r.resolved_at_millis.is_some_and(|at| at < cutoff_millis))
            .map(|r| (r.id, r.target_id.clone(), r.creation_key.clone()))
            .collect();

        for (id, target, creation_key) in &doomed {
            tables.rows.remove(id);
            if let Some(key) = creation_key {
                tables.by_creation_key.remove(key);
            }
            if let Some(ids) = tables.by_target.get_mut(target) {
                ids.remove(id);
                if ids.is_empty() {
                    tables.by_target.remove(target);
                }
            }
        }
        Ok(doomed.len())
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}
