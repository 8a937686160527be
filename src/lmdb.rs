//! LMDB-backed stores
//!
//! Records are rkyv-encoded. LMDB admits one write transaction at a time
//! across every process sharing the environment, so the read-check-write in
//! each method below is an atomic conditional write, which is what lets
//! several service instances share one ledger.

use crate::codec::{decode, encode};
use crate::store::is_live_duplicate;
use crate::{
    ActorId, IdempotencyKey, IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InsertOutcome,
    PairingRequest, RequestDraft, RequestId, RequestStatus, RequestStore, StoreError,
};
use heed::byteorder::BigEndian;
use heed::types::{Bytes, Str, Unit, U64};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use std::path::Path;

const LAST_ID: &str = "last_id";

fn backend(err: heed::Error) -> StoreError {
    StoreError::Backend(err.to_string().into())
}

/// Open (creating if needed) an environment both stores can share
pub fn open_env(path: impl AsRef<Path>, map_size: usize) -> Result<Env, StoreError> {
    let path = path.as_ref();
    std::fs::create_dir_all(path).map_err(|e| StoreError::Backend(e.to_string().into()))?;
    // SAFETY: the environment is opened once per path by this process and the
    // files are not modified outside LMDB.
    unsafe { EnvOpenOptions::new().map_size(map_size).max_dbs(8).open(path) }.map_err(backend)
}

fn deadline_key(expires_at_millis: u64, id: RequestId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&expires_at_millis.to_be_bytes());
    key[8..].copy_from_slice(&id.get().to_be_bytes());
    key
}

fn target_prefix(target: &ActorId) -> Vec<u8> {
    let bytes = target.as_str().as_bytes();
    let mut prefix = Vec::with_capacity(4 + bytes.len() + 8);
    prefix.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    prefix.extend_from_slice(bytes);
    prefix
}

fn target_key(target: &ActorId, id: RequestId) -> Vec<u8> {
    let mut key = target_prefix(target);
    key.extend_from_slice(&id.get().to_be_bytes());
    key
}

/// Trailing big-endian request ID of an index key
fn id_suffix(key: &[u8]) -> Result<RequestId, StoreError> {
    key.len()
        .checked_sub(8)
        .and_then(|start| <[u8; 8]>::try_from(&key[start..]).ok())
        .map(|raw| RequestId(u64::from_be_bytes(raw)))
        .ok_or_else(|| StoreError::Codec("index key too short".into()))
}

/// Pairing requests in LMDB
pub struct LmdbRequestStore {
    env: Env,
    rows: Database<U64<BigEndian>, Bytes>,
    by_target: Database<Bytes, Unit>,
    pending_by_deadline: Database<Bytes, Unit>,
    by_creation_key: Database<Str, U64<BigEndian>>,
    meta: Database<Str, U64<BigEndian>>,
}

impl LmdbRequestStore {
    /// Open or create the request databases in `env`
    pub fn new(env: &Env) -> Result<Self, StoreError> {
        let mut wtxn = env.write_txn().map_err(backend)?;
        let rows = env.create_database(&mut wtxn, Some("pairing_requests")).map_err(backend)?;
        let by_target = env
            .create_database(&mut wtxn, Some("pairing_requests_by_target"))
            .map_err(backend)?;
        let pending_by_deadline = env
            .create_database(&mut wtxn, Some("pairing_requests_pending"))
            .map_err(backend)?;
        let by_creation_key = env
            .create_database(&mut wtxn, Some("pairing_requests_by_creation_key"))
            .map_err(backend)?;
        let meta = env.create_database(&mut wtxn, Some("pairing_meta")).map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(Self {
            env: env.clone(),
            rows,
            by_target,
            pending_by_deadline,
            by_creation_key,
            meta,
        })
    }

    /// Open a store in its own environment at `path`
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self, StoreError> {
        Self::new(&open_env(path, map_size)?)
    }

    fn load(&self, txn: &RoTxn, id: RequestId) -> Result<Option<PairingRequest>, StoreError> {
        match self.rows.get(txn, &id.get()).map_err(backend)? {
            Some(bytes) => decode(bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl RequestStore for LmdbRequestStore {
    fn insert_pending(&self, draft: RequestDraft) -> Result<InsertOutcome, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;

        if let Some(key) = &draft.creation_key {
            if let Some(id) = self.by_creation_key.get(&wtxn, key).map_err(backend)? {
                if let Some(existing) = self.load(&wtxn, RequestId(id))? {
                    return Ok(InsertOutcome::Existing(existing));
                }
            }
        }

        let prefix = target_prefix(&draft.target_id);
        for item in self.by_target.prefix_iter(&wtxn, &prefix).map_err(backend)? {
            let (key, ()) = item.map_err(backend)?;
            if let Some(existing) = self.load(&wtxn, id_suffix(key)?)? {
                if is_live_duplicate(&existing, &draft) {
                    return Ok(InsertOutcome::Duplicate(existing.id));
                }
            }
        }

        let last_id = self.meta.get(&wtxn, LAST_ID).map_err(backend)?.unwrap_or(0);
        let record = draft.into_request(RequestId(last_id + 1));
        self.rows
            .put(&mut wtxn, &record.id.get(), &encode(&record)?)
            .map_err(backend)?;
        self.by_target
            .put(&mut wtxn, &target_key(&record.target_id, record.id), &())
            .map_err(backend)?;
        self.pending_by_deadline
            .put(&mut wtxn, &deadline_key(record.expires_at_millis, record.id), &())
            .map_err(backend)?;
        if let Some(key) = &record.creation_key {
            self.by_creation_key
                .put(&mut wtxn, key, &record.id.get())
                .map_err(backend)?;
        }
        self.meta.put(&mut wtxn, LAST_ID, &record.id.get()).map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(InsertOutcome::Inserted(record))
    }

    fn get(&self, id: RequestId) -> Result<Option<PairingRequest>, StoreError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.load(&rtxn, id)
    }

    fn compare_and_swap(&self, expected_version: u64, next: &PairingRequest) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let Some(current) = self.load(&wtxn, next.id)? else {
            return Ok(false);
        };
        if current.version != expected_version {
            return Ok(false);
        }

        self.rows
            .put(&mut wtxn, &next.id.get(), &encode(next)?)
            .map_err(backend)?;
        if next.status != RequestStatus::Pending {
            self.pending_by_deadline
                .delete(&mut wtxn, &deadline_key(current.expires_at_millis, current.id))
                .map_err(backend)?;
        }
        wtxn.commit().map_err(backend)?;
        Ok(true)
    }

    fn claim_expired(&self, now_millis: u64, limit: usize) -> Result<Vec<PairingRequest>, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;

        let mut due = Vec::new();
        for item in self.pending_by_deadline.iter(&wtxn).map_err(backend)? {
            let (key, ()) = item.map_err(backend)?;
            let deadline = key
                .get(..8)
                .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| StoreError::Codec("deadline key too short".into()))?;
            if deadline > now_millis || due.len() == limit {
                break;
            }
            due.push((key.to_vec(), id_suffix(key)?));
        }

        let mut claimed = Vec::with_capacity(due.len());
        for (key, id) in due {
            self.pending_by_deadline.delete(&mut wtxn, &key).map_err(backend)?;
            let Some(current) = self.load(&wtxn, id)? else {
                continue;
            };
            if current.status != RequestStatus::Pending {
                continue;
            }
            let next = current.expired(now_millis);
            self.rows.put(&mut wtxn, &id.get(), &encode(&next)?).map_err(backend)?;
            claimed.push(next);
        }
        wtxn.commit().map_err(backend)?;
        Ok(claimed)
    }

    fn list_by_target(&self, target: &ActorId, status: RequestStatus) -> Result<Vec<PairingRequest>, StoreError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let mut found = Vec::new();
        for item in self.by_target.prefix_iter(&rtxn, &target_prefix(target)).map_err(backend)? {
            let (key, ()) = item.map_err(backend)?;
            if let Some(record) = self.load(&rtxn, id_suffix(key)?)? {
                if record.status == status {
                    found.push(record);
                }
            }
        }
        Ok(found)
    }

    fn purge_resolved_before(&self, cutoff_millis: u64) -> Result<usize, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;

        let mut doomed = Vec::new();
        for item in self.rows.iter(&wtxn).map_err(backend)? {
            let (_, bytes) = item.map_err(backend)?;
            let record: PairingRequest = decode(bytes)?;
            if record.is_terminal() && record.resolved_at_millis.is_some_and(|at| at < cutoff_millis) {
                doomed.push((record.id, record.target_id, record.creation_key));
            }
        }

        for (id, target, creation_key) in &doomed {
            self.rows.delete(&mut wtxn, &id.get()).map_err(backend)?;
            if let Some(key) = creation_key {
                self.by_creation_key.delete(&mut wtxn, key).map_err(backend)?;
            }
            self.by_target
                .delete(&mut wtxn, &target_key(target, *id))
                .map_err(backend)?;
        }
        wtxn.commit().map_err(backend)?;
        Ok(doomed.len())
    }
}

/// Idempotency records in LMDB
pub struct LmdbIdempotencyStore {
    env: Env,
    records: Database<Str, Bytes>,
}

impl LmdbIdempotencyStore {
    /// Open or create the idempotency database in `env`
    pub fn new(env: &Env) -> Result<Self, StoreError> {
        let mut wtxn = env.write_txn().map_err(backend)?;
        let records = env.create_database(&mut wtxn, Some("idempotency")).map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(Self {
            env: env.clone(),
            records,
        })
    }

    fn load(&self, txn: &RoTxn, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        match self.records.get(txn, key.as_str()).map_err(backend)? {
            Some(bytes) => decode(bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl IdempotencyStore for LmdbIdempotencyStore {
    fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        if self.records.get(&wtxn, &record.key).map_err(backend)?.is_some() {
            return Ok(false);
        }
        self.records
            .put(&mut wtxn, &record.key, &encode(&record)?)
            .map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(true)
    }

    fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.load(&rtxn, key)
    }

    fn remove_if_created_at(&self, key: &IdempotencyKey, created_at_millis: u64) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let same = self
            .load(&wtxn, key)?
            .is_some_and(|record| record.created_at_millis == created_at_millis);
        if same {
            self.records.delete(&mut wtxn, key.as_str()).map_err(backend)?;
            wtxn.commit().map_err(backend)?;
        }
        Ok(same)
    }

    fn finalize(
        &self,
        key: &IdempotencyKey,
        status: IdempotencyStatus,
        result: Option<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let Some(mut record) = self.load(&wtxn, key)? else {
            return Ok(false);
        };
        if record.status != IdempotencyStatus::InProgress {
            return Ok(false);
        }
        record.status = status;
        record.result = result;
        self.records
            .put(&mut wtxn, key.as_str(), &encode(&record)?)
            .map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(true)
    }

    fn purge_older_than(&self, cutoff_millis: u64) -> Result<usize, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let mut doomed = Vec::new();
        for item in self.records.iter(&wtxn).map_err(backend)? {
            let (key, bytes) = item.map_err(backend)?;
            let record: IdempotencyRecord = decode(bytes)?;
            if record.created_at_millis < cutoff_millis {
                doomed.push(key.to_owned());
            }
        }
        for key in &doomed {
            self.records.delete(&mut wtxn, key).map_err(backend)?;
        }
        wtxn.commit().map_err(backend)?;
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceRef;

    const MAP_SIZE: usize = 16 * 1024 * 1024;

    fn draft(requester: &str, target: &str, now: u64) -> RequestDraft {
        RequestDraft {
            requester_id: ActorId::new(requester),
            target_id: ActorId::new(target),
            resource_ref: ResourceRef::new("chat"),
            created_at_millis: now,
            expires_at_millis: now + 60_000,
            creation_key: None,
        }
    }

    fn inserted(outcome: InsertOutcome) -> PairingRequest {
        match outcome {
            InsertOutcome::Inserted(record) => record,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn requests_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
            inserted(store.insert_pending(draft("a", "b", 0)).unwrap()).id
        };
        let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.requester_id, ActorId::new("a"));
        // ID allocation continues after the stored maximum
        let next = inserted(store.insert_pending(draft("c", "b", 0)).unwrap());
        assert_eq!(next.id, RequestId(id.get() + 1));
    }

    #[test]
    fn duplicate_and_cas_follow_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
        let record = inserted(store.insert_pending(draft("a", "b", 0)).unwrap());
        assert_eq!(
            store.insert_pending(draft("a", "b", 10)).unwrap(),
            InsertOutcome::Duplicate(record.id)
        );

        let mut next = record.clone();
        next.status = RequestStatus::Declined;
        next.version = 2;
        assert!(store.compare_and_swap(1, &next).unwrap());
        assert!(!store.compare_and_swap(1, &next).unwrap());
        assert!(store.claim_expired(u64::MAX, 10).unwrap().is_empty());
    }

    #[test]
    fn creation_key_survives_reopen_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let keyed = |now| RequestDraft {
            creation_key: Some("create:k1".into()),
            ..draft("a", "b", now)
        };
        let first = {
            let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
            let record = inserted(store.insert_pending(keyed(0)).unwrap());
            assert_eq!(store.claim_expired(60_000, 10).unwrap().len(), 1);
            record
        };

        let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
        match store.insert_pending(keyed(300_000)).unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected existing record, got {other:?}"),
        }

        assert_eq!(store.purge_resolved_before(u64::MAX).unwrap(), 1);
        let again = inserted(store.insert_pending(keyed(400_000)).unwrap());
        assert_eq!(again.id, RequestId(first.id.get() + 1));
    }

    #[test]
    fn sweep_claims_each_row_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
        for requester in ["a", "c", "d"] {
            store.insert_pending(draft(requester, "b", 0)).unwrap();
        }
        let first = store.claim_expired(60_000, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|r| r.status == RequestStatus::Expired && r.version == 2));
        assert_eq!(store.claim_expired(60_000, 10).unwrap().len(), 1);
        assert!(store.claim_expired(60_000, 10).unwrap().is_empty());
        assert!(store.list_by_target(&ActorId::new("b"), RequestStatus::Pending).unwrap().is_empty());
        assert_eq!(store.list_by_target(&ActorId::new("b"), RequestStatus::Expired).unwrap().len(), 3);

        assert_eq!(store.purge_resolved_before(60_001).unwrap(), 3);
        assert!(store.list_by_target(&ActorId::new("b"), RequestStatus::Expired).unwrap().is_empty());
    }

    #[test]
    fn target_index_does_not_leak_across_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbRequestStore::open(dir.path(), MAP_SIZE).unwrap();
        store.insert_pending(draft("a", "bo", 0)).unwrap();
        store.insert_pending(draft("a", "bob", 0)).unwrap();
        let for_bo = store.list_by_target(&ActorId::new("bo"), RequestStatus::Pending).unwrap();
        assert_eq!(for_bo.len(), 1);
        assert_eq!(for_bo[0].target_id, ActorId::new("bo"));
    }

    #[test]
    fn idempotency_records_round_through_lmdb() {
        let dir = tempfile::tempdir().unwrap();
        let env = open_env(dir.path(), MAP_SIZE).unwrap();
        let store = LmdbIdempotencyStore::new(&env).unwrap();
        let key = IdempotencyKey::from_token("k");
        let record = IdempotencyRecord {
            key: "k".into(),
            operation: "resolve_request".into(),
            status: IdempotencyStatus::InProgress,
            result: None,
            created_at_millis: 5,
        };
        assert!(store.insert_if_absent(record.clone()).unwrap());
        assert!(!store.insert_if_absent(record).unwrap());

        assert!(store.finalize(&key, IdempotencyStatus::Completed, Some(vec![7])).unwrap());
        assert!(!store.finalize(&key, IdempotencyStatus::Failed, None).unwrap());
        assert_eq!(store.get(&key).unwrap().unwrap().result, Some(vec![7]));

        assert!(!store.remove_if_created_at(&key, 4).unwrap());
        assert_eq!(store.purge_older_than(6).unwrap(), 1);
        assert!(store.get(&key).unwrap().is_none());
    }
}
