//! In-memory credential store with all-or-nothing transactions.
//!
//! Reads run under the shared lock through a [`Snapshot`] and append their
//! audit records once the lock is released. A [`Transaction`] holds the
//! exclusive lock and mutates the data in place, journaling the previous
//! state of every entry it touches. Committing discards the journal and
//! appends the collected audit records; rolling back (or dropping the
//! transaction) replays the journal in reverse.
//!
//! Lock order is always data, then audit log.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::audit::{
    AuditLog, AuditParameters, AuditRecord, AuditSink, AuditTrailBuilder, AuthFailureAuditRecord, RequestAuditRecord,
    RequestContext,
};
use crate::clock::{Clock, SystemClock};
use crate::credential::{name_key, Credential, CredentialVersion};
use crate::error::CredvaultError;
use crate::permissions::Operation;

/// Access control list of one credential: actor to operations.
pub type AccessControlList = BTreeMap<String, BTreeSet<Operation>>;

/// The transactional part of the store.
#[derive(Debug, Clone, Default)]
pub struct StoreData {
    credentials: HashMap<String, Credential>,
    acls: HashMap<String, AccessControlList>,
}

impl StoreData {
    /// Case-insensitive lookup.
    pub fn find(&self, name: &str) -> Option<&Credential> {
        self.credentials.get(&name_key(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.credentials.contains_key(&name_key(name))
    }

    pub fn credentials(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.values()
    }

    pub fn version_count(&self, name: &str) -> usize {
        self.find(name).map_or(0, |c| c.versions().len())
    }

    pub fn acl(&self, name: &str) -> Option<&AccessControlList> {
        self.acls.get(&name_key(name))
    }

    /// Operations recorded for `actor`; empty when there is no entry.
    pub fn operations_for(&self, name: &str, actor: &str) -> BTreeSet<Operation> {
        self.acl(name)
            .and_then(|acl| acl.get(actor))
            .cloned()
            .unwrap_or_default()
    }

    /// Names of the certificates whose latest version was signed by `ca_name`.
    pub fn signed_by(&self, ca_name: &str) -> Vec<String> {
        let ca_key = name_key(ca_name);
        self.credentials
            .values()
            .filter(|credential| {
                credential
                    .latest_certificate()
                    .and_then(|cert| cert.ca_name.as_deref())
                    .is_some_and(|signer| name_key(signer) == ca_key)
            })
            .map(|credential| credential.name().to_string())
            .collect()
    }

    fn put_version(&mut self, key: &str, name: &str, version: CredentialVersion) -> Result<(), CredvaultError> {
        match self.credentials.get_mut(key) {
            Some(existing) => existing.append(version),
            None => {
                self.credentials
                    .insert(key.to_string(), Credential::new(name.to_string(), version));
                Ok(())
            }
        }
    }

    fn acl_entry(&mut self, key: &str) -> &mut AccessControlList {
        self.acls.entry(key.to_string()).or_default()
    }

    fn restore<T>(map: &mut HashMap<String, T>, key: String, previous: Option<T>) {
        match previous {
            Some(value) => {
                map.insert(key, value);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

/// The state of one entry before a transaction touched it.
#[derive(Debug)]
enum Undo {
    /// Versions were appended to an existing credential.
    Versions { key: String, len: usize },
    /// A credential was created or removed.
    Credential { key: String, previous: Option<Credential> },
    /// An ACL was changed, created or removed.
    Acl {
        key: String,
        previous: Option<AccessControlList>,
    },
}

/// The shared credential store.
pub struct CredentialStore {
    data: RwLock<StoreData>,
    audit: Mutex<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            audit: Mutex::new(AuditLog::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `f` against a consistent view under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        f(&self.data.read())
    }

    pub fn version_count(&self, name: &str) -> usize {
        self.read(|data| data.version_count(name))
    }

    /// Open a transaction. Blocks until no other transaction or snapshot
    /// is open.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            data: self.data.write(),
            log: &self.audit,
            undo: Vec::new(),
            audit: Vec::new(),
            now: self.clock.now(),
        }
    }

    /// Run `f` in a transaction and record its audit parameters either way.
    ///
    /// On success the data changes and success records (with
    /// `success_status`) commit together. On failure the data changes are
    /// undone and the same parameters are recorded as failures carrying
    /// the error's status code.
    pub fn audited<T>(
        &self,
        context: &RequestContext,
        success_status: u16,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, CredvaultError>,
    ) -> Result<T, CredvaultError> {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit(context, success_status);
                Ok(value)
            }
            Err(err) => {
                tx.rollback(context, &err);
                Err(err)
            }
        }
    }

    /// Run the read-only `f` under the shared lock, then record its audit
    /// parameters with the outcome. Concurrent reads do not block each other.
    pub fn read_audited<T>(
        &self,
        context: &RequestContext,
        success_status: u16,
        f: impl FnOnce(&mut Snapshot<'_>) -> Result<T, CredvaultError>,
    ) -> Result<T, CredvaultError> {
        let mut snapshot = Snapshot {
            data: self.data.read(),
            audit: Vec::new(),
            now: self.clock.now(),
        };
        let result = f(&mut snapshot);
        let Snapshot { data, audit, now } = snapshot;
        drop(data);

        let (success, status_code) = match &result {
            Ok(_) => (true, success_status),
            Err(err) => (false, err.status_code()),
        };
        let mut log = self.audit.lock();
        for parameters in audit {
            log.append(AuditTrailBuilder::finish(parameters, context, success, status_code, now));
        }
        result
    }

    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit.lock().add_forward_sink(sink);
    }

    /// A copy of every retained operation record, oldest first.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().iter().cloned().collect()
    }

    pub fn record_request(&self, record: RequestAuditRecord) {
        self.audit.lock().append_request(record);
    }

    pub fn record_auth_failure(&self, record: AuthFailureAuditRecord) {
        self.audit.lock().append_auth_failure(record);
    }

    pub fn request_records(&self) -> Vec<RequestAuditRecord> {
        self.audit.lock().requests().to_vec()
    }

    pub fn auth_failure_records(&self) -> Vec<AuthFailureAuditRecord> {
        self.audit.lock().auth_failures().to_vec()
    }

    /// Retention cleanup over every record kind. Returns how many records
    /// were removed.
    pub fn delete_audit_records_before(&self, cutoff: DateTime<Utc>) -> usize {
        self.audit.lock().delete_before(cutoff)
    }
}

/// The audit side shared by [`Transaction`] and [`Snapshot`].
pub trait AuditScope: Deref<Target = StoreData> {
    /// The time this unit of work started; stamps versions and records.
    fn now(&self) -> DateTime<Utc>;

    /// Parameters collected so far, for post-lookup corrections.
    fn audit_parameters_mut(&mut self) -> &mut Vec<AuditParameters>;

    fn audit(&mut self, parameters: AuditParameters) {
        self.audit_parameters_mut().push(parameters);
    }

    fn audit_all(&mut self, parameters: impl IntoIterator<Item = AuditParameters>)
    where
        Self: Sized,
    {
        self.audit_parameters_mut().extend(parameters);
    }
}

/// A read-only view held under the shared lock.
pub struct Snapshot<'a> {
    data: RwLockReadGuard<'a, StoreData>,
    audit: Vec<AuditParameters>,
    now: DateTime<Utc>,
}

impl Deref for Snapshot<'_> {
    type Target = StoreData;

    fn deref(&self) -> &StoreData {
        &self.data
    }
}

impl AuditScope for Snapshot<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn audit_parameters_mut(&mut self) -> &mut Vec<AuditParameters> {
        &mut self.audit
    }
}

/// An open, exclusive unit of work. Every mutation goes through here so it
/// can be journaled.
pub struct Transaction<'a> {
    data: RwLockWriteGuard<'a, StoreData>,
    log: &'a Mutex<AuditLog>,
    undo: Vec<Undo>,
    audit: Vec<AuditParameters>,
    now: DateTime<Utc>,
}

impl Transaction<'_> {
    /// Append `version` to the credential, creating it when absent.
    pub fn put_version(&mut self, name: &str, version: CredentialVersion) -> Result<(), CredvaultError> {
        let key = name_key(name);
        let undo = match self.data.credentials.get(&key) {
            Some(existing) => Undo::Versions {
                key: key.clone(),
                len: existing.versions().len(),
            },
            None => Undo::Credential {
                key: key.clone(),
                previous: None,
            },
        };
        self.undo.push(undo);
        self.data.put_version(&key, name, version)
    }

    /// Remove a credential and every ACL entry attached to it. Returns
    /// whether the credential existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let key = name_key(name);
        let acl = self.data.acls.remove(&key);
        let credential = self.data.credentials.remove(&key);
        let existed = credential.is_some();
        self.undo.push(Undo::Acl {
            key: key.clone(),
            previous: acl,
        });
        self.undo.push(Undo::Credential { key, previous: credential });
        existed
    }

    /// Make `operations` the complete set for `actor`.
    pub fn replace_operations(&mut self, name: &str, actor: &str, operations: BTreeSet<Operation>) {
        let key = self.journal_acl(name);
        self.data.acl_entry(&key).insert(actor.to_string(), operations);
    }

    /// Add `operations` to whatever `actor` already holds.
    pub fn merge_operations(&mut self, name: &str, actor: &str, operations: &BTreeSet<Operation>) {
        let key = self.journal_acl(name);
        self.data
            .acl_entry(&key)
            .entry(actor.to_string())
            .or_default()
            .extend(operations.iter().copied());
    }

    /// Remove the entry for `actor`. Returns whether one existed.
    pub fn remove_actor(&mut self, name: &str, actor: &str) -> bool {
        let key = self.journal_acl(name);
        self.data
            .acls
            .get_mut(&key)
            .is_some_and(|acl| acl.remove(actor).is_some())
    }

    fn journal_acl(&mut self, name: &str) -> String {
        let key = name_key(name);
        self.undo.push(Undo::Acl {
            key: key.clone(),
            previous: self.data.acls.get(&key).cloned(),
        });
        key
    }

    /// Undo every journaled change, newest first.
    fn revert(&mut self) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Versions { key, len } => {
                    if let Some(credential) = self.data.credentials.get_mut(&key) {
                        credential.truncate_versions(len);
                    }
                }
                Undo::Credential { key, previous } => StoreData::restore(&mut self.data.credentials, key, previous),
                Undo::Acl { key, previous } => StoreData::restore(&mut self.data.acls, key, previous),
            }
        }
    }

    /// Keep the changes and record the collected parameters as successes.
    pub fn commit(mut self, context: &RequestContext, status_code: u16) {
        self.undo.clear();
        self.finish(context, true, status_code);
    }

    /// Undo the changes and record the collected parameters as failures.
    pub fn rollback(mut self, context: &RequestContext, err: &CredvaultError) {
        tracing::debug!(
            request_uuid = %context.request_uuid,
            error = %err,
            undone = self.undo.len(),
            "transaction rolled back"
        );
        self.revert();
        self.finish(context, false, err.status_code());
    }

    fn finish(&mut self, context: &RequestContext, success: bool, status_code: u16) {
        let mut log = self.log.lock();
        for parameters in self.audit.drain(..) {
            log.append(AuditTrailBuilder::finish(parameters, context, success, status_code, self.now));
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            tracing::warn!(undone = self.undo.len(), "transaction dropped without commit");
            self.revert();
        }
    }
}

impl Deref for Transaction<'_> {
    type Target = StoreData;

    fn deref(&self) -> &StoreData {
        &self.data
    }
}

impl AuditScope for Transaction<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn audit_parameters_mut(&mut self) -> &mut Vec<AuditParameters> {
        &mut self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use crate::audit::AuditingOperationCode;
    use crate::credential::CredentialValue;

    fn password(value: &str) -> CredentialVersion {
        CredentialVersion::new(CredentialValue::Password(value.into()), Utc::now())
    }

    fn access(name: &str) -> AuditParameters {
        AuditTrailBuilder::for_operation(AuditingOperationCode::CredentialUpdate, Some(name), None, vec![])
    }

    fn boom() -> CredvaultError {
        CredvaultError::GenerationFailure("boom".into())
    }

    #[test]
    fn test_commit_publishes_versions_and_records() {
        let store = CredentialStore::new();
        let ctx = RequestContext::new("alice");

        store
            .audited(&ctx, 200, |tx| {
                tx.audit(access("/pw"));
                tx.put_version("/pw", password("one"))?;
                tx.put_version("/PW", password("two"))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.version_count("/pw"), 2);
        assert_eq!(store.read(|d| d.find("/Pw").map(|c| c.name().to_string())), Some("/pw".to_string()));
        let records = store.audit_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].request_uuid, ctx.request_uuid);
    }

    #[test]
    fn test_rollback_discards_everything_but_failure_records() {
        let store = CredentialStore::new();
        let ctx = RequestContext::new("alice");

        let result: Result<(), CredvaultError> = store.audited(&ctx, 200, |tx| {
            tx.audit(access("/pw"));
            tx.put_version("/pw", password("one"))?;
            tx.replace_operations("/pw", "alice", BTreeSet::from([Operation::Read]));
            Err(boom())
        });

        assert!(result.is_err());
        assert_eq!(store.version_count("/pw"), 0);
        assert!(store.read(|d| d.acl("/pw").is_none()));
        let records = store.audit_records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].status_code, 500);
    }

    #[test]
    fn test_rollback_truncates_appended_versions() {
        let store = CredentialStore::new();
        let ctx = RequestContext::new("alice");
        store.audited(&ctx, 200, |tx| tx.put_version("/pw", password("one"))).unwrap();

        let _ = store.audited(&ctx, 200, |tx| -> Result<(), CredvaultError> {
            tx.put_version("/pw", password("two"))?;
            tx.put_version("/pw", password("three"))?;
            Err(boom())
        });

        store.read(|data| {
            let credential = data.find("/pw").unwrap();
            assert_eq!(credential.versions().len(), 1);
            assert_eq!(credential.latest_version().value, CredentialValue::Password("one".into()));
        });
    }

    #[test]
    fn test_rollback_restores_removed_credential_and_acl() {
        let store = CredentialStore::new();
        let ctx = RequestContext::new("alice");
        store
            .audited(&ctx, 200, |tx| {
                tx.put_version("/pw", password("one"))?;
                tx.replace_operations("/pw", "alice", BTreeSet::from([Operation::Read, Operation::Delete]));
                tx.replace_operations("/pw", "bob", BTreeSet::from([Operation::Read]));
                Ok(())
            })
            .unwrap();

        let _ = store.audited(&ctx, 200, |tx| -> Result<(), CredvaultError> {
            assert!(tx.remove_actor("/pw", "bob"));
            assert!(tx.remove("/PW"));
            assert!(tx.find("/pw").is_none());
            Err(boom())
        });

        store.read(|data| {
            assert_eq!(data.version_count("/pw"), 1);
            assert_eq!(data.operations_for("/pw", "alice"), BTreeSet::from([Operation::Read, Operation::Delete]));
            assert_eq!(data.operations_for("/pw", "bob"), BTreeSet::from([Operation::Read]));
        });
    }

    #[test]
    fn test_dropped_transaction_is_undone() {
        let store = CredentialStore::new();
        {
            let mut tx = store.begin();
            tx.put_version("/pw", password("one")).unwrap();
        }
        assert_eq!(store.version_count("/pw"), 0);
    }

    #[test]
    fn test_remove_cascades_acl() {
        let store = CredentialStore::new();
        let mut tx = store.begin();
        tx.put_version("/pw", password("one")).unwrap();
        tx.replace_operations("/pw", "alice", BTreeSet::from([Operation::Read]));

        assert!(tx.remove("/PW"));
        assert!(!tx.remove("/pw"));
        assert!(tx.acl("/pw").is_none());
        assert!(tx.operations_for("/pw", "alice").is_empty());
        tx.commit(&RequestContext::new("alice"), 204);
    }

    #[test]
    fn test_replace_and_merge_operations() {
        let store = CredentialStore::new();
        let mut tx = store.begin();
        tx.replace_operations("/pw", "alice", BTreeSet::from([Operation::Read, Operation::Write]));
        tx.replace_operations("/pw", "alice", BTreeSet::from([Operation::Delete]));
        assert_eq!(tx.operations_for("/pw", "alice"), BTreeSet::from([Operation::Delete]));

        tx.merge_operations("/pw", "alice", &BTreeSet::from([Operation::Read]));
        assert_eq!(
            tx.operations_for("/pw", "alice"),
            BTreeSet::from([Operation::Read, Operation::Delete])
        );
        assert!(tx.remove_actor("/pw", "alice"));
        assert!(!tx.remove_actor("/pw", "alice"));
        tx.commit(&RequestContext::new("alice"), 200);
    }

    #[test]
    fn test_reads_share_the_lock() {
        let store = Arc::new(CredentialStore::new());
        let ctx = RequestContext::new("alice");
        store.audited(&ctx, 200, |tx| tx.put_version("/pw", password("one"))).unwrap();

        let (tx_done, rx_done) = mpsc::channel();
        store
            .read_audited(&ctx, 200, |outer| {
                outer.audit(access("/pw"));
                let store = Arc::clone(&store);
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let count = store.read_audited(&ctx, 200, |inner| {
                        inner.audit(access("/pw"));
                        Ok(inner.version_count("/pw"))
                    });
                    let _ = tx_done.send(count);
                });
                let inner = rx_done
                    .recv_timeout(Duration::from_secs(5))
                    .expect("a second reader ran while the first held the lock");
                assert_eq!(inner.unwrap(), 1);
                Ok(())
            })
            .unwrap();

        let records = store.audit_records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.success && r.status_code == 200));
    }

    #[test]
    fn test_failed_read_records_error_status() {
        let store = CredentialStore::new();
        let ctx = RequestContext::new("alice");
        let result: Result<(), CredvaultError> = store.read_audited(&ctx, 200, |snapshot| {
            snapshot.audit(access("/missing"));
            Err(CredvaultError::NotFound(crate::error::DenialCause::CredentialMissing))
        });

        assert!(result.is_err());
        let records = store.audit_records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].status_code, 404);
    }
}
