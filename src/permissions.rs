//! Per-credential access control.
//!
//! Default deny: an actor holds an operation on a credential only if an
//! entry says so. Every registry call checks authorization before it
//! mutates anything, and a missing credential is reported exactly like a
//! missing permission.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{AuditTrailBuilder, AuditingOperationCode, RequestContext};
use crate::credential::Credential;
use crate::error::{CredvaultError, DenialCause};
use crate::store::{AuditScope, CredentialStore, StoreData, Transaction};

/// An operation an actor may be granted on a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Delete,
    ReadAcl,
    WriteAcl,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Read,
        Operation::Write,
        Operation::Delete,
        Operation::ReadAcl,
        Operation::WriteAcl,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::ReadAcl => "read_acl",
            Self::WriteAcl => "write_acl",
        };
        f.write_str(name)
    }
}

/// The operations one actor holds on a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub actor: String,
    pub operations: BTreeSet<Operation>,
}

impl PermissionEntry {
    pub fn new(actor: impl Into<String>, operations: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            actor: actor.into(),
            operations: operations.into_iter().collect(),
        }
    }
}

/// The ACL of one credential as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsView {
    pub credential_name: String,
    pub permissions: Vec<PermissionEntry>,
}

/// Answers and maintains who may do what to which credential.
pub struct PermissionRegistry {
    store: Arc<CredentialStore>,
    acls_enabled: bool,
}

impl PermissionRegistry {
    pub fn new(store: Arc<CredentialStore>, acls_enabled: bool) -> Self {
        Self { store, acls_enabled }
    }

    /// Operations `actor` holds on `credential_name`. Empty when there is no
    /// entry or no such credential. With ACLs disabled every operation is
    /// held on every existing credential, matching [`permits`](Self::permits).
    pub fn allowed_operations(&self, credential_name: &str, actor: &str) -> BTreeSet<Operation> {
        self.store.read(|data| {
            if !data.contains(credential_name) {
                BTreeSet::new()
            } else if !self.acls_enabled {
                Operation::ALL.into_iter().collect()
            } else {
                data.operations_for(credential_name, actor)
            }
        })
    }

    pub fn has_permission(&self, credential_name: &str, actor: &str, operation: Operation) -> bool {
        self.store
            .read(|data| self.permits(data, credential_name, actor, operation))
    }

    /// Whether `actor` may perform `operation` on an existing credential.
    pub fn permits(&self, data: &StoreData, credential_name: &str, actor: &str, operation: Operation) -> bool {
        if !data.contains(credential_name) {
            return false;
        }
        if !self.acls_enabled {
            return true;
        }
        data.operations_for(credential_name, actor).contains(&operation)
    }

    /// Resolve `credential_name` if `actor` holds any of `operations` on it.
    pub fn authorize<'d>(
        &self,
        data: &'d StoreData,
        credential_name: &str,
        actor: &str,
        operations: &[Operation],
    ) -> Result<&'d Credential, DenialCause> {
        let credential = data.find(credential_name).ok_or(DenialCause::CredentialMissing)?;
        if operations
            .iter()
            .any(|op| self.permits(data, credential_name, actor, *op))
        {
            Ok(credential)
        } else {
            Err(DenialCause::InsufficientPermission)
        }
    }

    /// List the ACL of a credential. Requires READ_ACL or READ.
    pub fn list_entries(
        &self,
        context: &RequestContext,
        credential_name: &str,
    ) -> Result<PermissionsView, CredvaultError> {
        self.store.read_audited(context, 200, |snapshot| {
            snapshot.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::AclAccess,
                Some(credential_name),
                None,
                vec![],
            ));

            let resolved = self
                .authorize(snapshot, credential_name, &context.actor, &[Operation::ReadAcl, Operation::Read])
                .map_err(|cause| denied(context, credential_name, Operation::ReadAcl, cause))?
                .name()
                .to_string();
            for parameters in snapshot.audit_parameters_mut() {
                parameters.resolve_name(&resolved);
            }

            let permissions = snapshot
                .acl(&resolved)
                .map(|acl| {
                    acl.iter()
                        .map(|(actor, operations)| PermissionEntry {
                            actor: actor.clone(),
                            operations: operations.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(PermissionsView {
                credential_name: resolved,
                permissions,
            })
        })
    }

    /// Replace the operation sets of the actors named in `entries`.
    /// Requires WRITE_ACL. Entries for the same actor within one call are
    /// combined; other actors keep their entries. Returns the applied
    /// entries under the stored credential name.
    pub fn set_entries(
        &self,
        context: &RequestContext,
        credential_name: &str,
        entries: Vec<PermissionEntry>,
    ) -> Result<PermissionsView, CredvaultError> {
        let mut combined: BTreeMap<String, BTreeSet<Operation>> = BTreeMap::new();
        for entry in &entries {
            combined
                .entry(entry.actor.clone())
                .or_default()
                .extend(entry.operations.iter().copied());
        }
        let applied: Vec<PermissionEntry> = combined
            .into_iter()
            .map(|(actor, operations)| PermissionEntry { actor, operations })
            .collect();

        self.store.audited(context, 200, |tx| {
            tx.audit_all(AuditTrailBuilder::for_permissions(
                AuditingOperationCode::AclUpdate,
                credential_name,
                &applied,
            ));
            if applied.iter().any(|entry| entry.actor.trim().is_empty()) {
                return Err(CredvaultError::validation("missing_actor"));
            }

            let resolved = self
                .authorize(tx, credential_name, &context.actor, &[Operation::WriteAcl])
                .map_err(|cause| denied(context, credential_name, Operation::WriteAcl, cause))?
                .name()
                .to_string();
            for parameters in tx.audit_parameters_mut() {
                parameters.resolve_name(&resolved);
            }

            for entry in &applied {
                tx.replace_operations(&resolved, &entry.actor, entry.operations.clone());
            }
            tracing::debug!(credential = %resolved, entries = applied.len(), "permission entries replaced");
            Ok(PermissionsView {
                credential_name: resolved,
                permissions: applied.clone(),
            })
        })
    }

    /// Remove `actor`'s entry. Requires WRITE_ACL. An actor without an
    /// entry is reported like a missing credential, and audited as such.
    pub fn delete_entry(
        &self,
        context: &RequestContext,
        credential_name: &str,
        actor: &str,
    ) -> Result<(), CredvaultError> {
        self.store.audited(context, 204, |tx| {
            let held: Vec<Operation> = tx.operations_for(credential_name, actor).into_iter().collect();
            tx.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::AclDelete,
                Some(credential_name),
                Some(actor),
                held,
            ));

            let resolved = self
                .authorize(tx, credential_name, &context.actor, &[Operation::WriteAcl])
                .map_err(|cause| denied(context, credential_name, Operation::WriteAcl, cause))?
                .name()
                .to_string();
            for parameters in tx.audit_parameters_mut() {
                parameters.resolve_name(&resolved);
            }

            if !tx.remove_actor(&resolved, actor) {
                tracing::debug!(credential = %resolved, acl_actor = %actor, "no permission entry to delete");
                return Err(CredvaultError::NotFound(DenialCause::CredentialMissing));
            }
            Ok(())
        })
    }

    /// Grants made when a credential is first written: the creator receives
    /// every operation and `additional` entries are merged in.
    pub fn grant_on_create(
        &self,
        tx: &mut Transaction<'_>,
        credential_name: &str,
        creator: &str,
        additional: &[PermissionEntry],
    ) {
        tx.merge_operations(credential_name, creator, &Operation::ALL.into_iter().collect());
        for entry in additional {
            tx.merge_operations(credential_name, &entry.actor, &entry.operations);
        }
    }
}

/// Log a denial and turn it into the read-side error.
pub(crate) fn denied(
    context: &RequestContext,
    credential_name: &str,
    operation: Operation,
    cause: DenialCause,
) -> CredvaultError {
    tracing::warn!(
        actor = %context.actor,
        credential = %credential_name,
        %operation,
        ?cause,
        "access denied"
    );
    CredvaultError::NotFound(cause)
}
