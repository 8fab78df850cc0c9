//! Credential search.
//!
//! Every search is audited once and only returns credentials the caller
//! holds READ on. Matching is case-insensitive.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditTrailBuilder, AuditingOperationCode, RequestContext};
use crate::credential::{name_key, Credential};
use crate::error::CredvaultError;
use crate::permissions::{Operation, PermissionRegistry};
use crate::store::{AuditScope, CredentialStore, StoreData};

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindResult {
    pub name: String,
    pub version_created_at: DateTime<Utc>,
}

/// Searches the store on behalf of a caller.
pub struct CredentialFinder {
    store: Arc<CredentialStore>,
    registry: Arc<PermissionRegistry>,
}

impl CredentialFinder {
    pub fn new(store: Arc<CredentialStore>, registry: Arc<PermissionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Credentials whose name contains `pattern`. Newest first.
    pub fn find_by_name_like(&self, context: &RequestContext, pattern: &str) -> Result<Vec<FindResult>, CredvaultError> {
        let needle = pattern.trim().to_lowercase();
        self.search(context, |credential| name_key(credential.name()).contains(&needle))
    }

    /// Credentials stored under the folder `path`. Only whole segments
    /// match: `/deploy` finds `/deploy/cert` but not `/deployment/cert`.
    pub fn find_by_path(&self, context: &RequestContext, path: &str) -> Result<Vec<FindResult>, CredvaultError> {
        let folder = folder_prefix(path);
        self.search(context, |credential| name_key(credential.name()).starts_with(&folder))
    }

    /// Every folder that contains at least one readable credential, sorted.
    pub fn find_all_paths(&self, context: &RequestContext) -> Result<Vec<String>, CredvaultError> {
        self.store.read_audited(context, 200, |snapshot| {
            snapshot.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialFind,
                None,
                None,
                vec![],
            ));

            let mut paths = BTreeSet::new();
            for credential in self.readable(snapshot, &context.actor) {
                paths.extend(ancestor_folders(credential.name()));
            }
            Ok(paths.into_iter().collect())
        })
    }

    fn search(
        &self,
        context: &RequestContext,
        matches: impl Fn(&Credential) -> bool,
    ) -> Result<Vec<FindResult>, CredvaultError> {
        self.store.read_audited(context, 200, |snapshot| {
            snapshot.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialFind,
                None,
                None,
                vec![],
            ));

            let mut results: Vec<FindResult> = self
                .readable(snapshot, &context.actor)
                .filter(|credential| matches(credential))
                .map(|credential| FindResult {
                    name: credential.name().to_string(),
                    version_created_at: credential.latest_version().created_at,
                })
                .collect();
            results.sort_by(|a, b| {
                b.version_created_at
                    .cmp(&a.version_created_at)
                    .then_with(|| a.name.cmp(&b.name))
            });
            Ok(results)
        })
    }

    fn readable<'d>(&'d self, data: &'d StoreData, actor: &'d str) -> impl Iterator<Item = &'d Credential> + 'd {
        data.credentials()
            .filter(move |credential| self.registry.permits(data, credential.name(), actor, Operation::Read))
    }
}

/// Lower-cased `/a/b/` form of a folder path.
fn folder_prefix(path: &str) -> String {
    let mut folder = name_key(path);
    if !folder.ends_with('/') {
        folder.push('/');
    }
    folder
}

/// `/a/b/c` yields `/`, `/a/` and `/a/b/`.
fn ancestor_folders(name: &str) -> Vec<String> {
    let mut folders = vec!["/".to_string()];
    let segments: Vec<&str> = name.trim_start_matches('/').split('/').collect();
    let mut current = String::from("/");
    for segment in &segments[..segments.len().saturating_sub(1)] {
        current.push_str(segment);
        current.push('/');
        folders.push(current.clone());
    }
    folders
}
