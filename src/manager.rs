//! The credential lifecycle facade.
//!
//! [`CredentialManager`] wires the store, the permission registry, the
//! certificate generator and the regeneration and search components
//! together. Writes run as audited transactions and reads as audited
//! snapshots under the shared lock.

use std::sync::Arc;

use crate::audit::{
    AuditRecord, AuditSink, AuditTrailBuilder, AuditingOperationCode, AuthFailureAuditRecord, RequestAuditRecord,
    RequestContext,
};
use crate::certificate::{CertificateGenerationRequest, CertificateParameters};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credential::{normalize_name, CredentialValue, CredentialVersion};
use crate::error::CredvaultError;
use crate::find::{CredentialFinder, FindResult};
use crate::generator::{CertificateGenerator, SigningCertificateGenerator};
use crate::permissions::{denied, Operation, PermissionEntry, PermissionRegistry, PermissionsView};
use crate::regenerate::{append_regenerated, BulkRegenerationOrchestrator};
use crate::retention::AuditRetentionTask;
use crate::store::{AuditScope, CredentialStore, StoreData};

pub struct CredentialManager {
    config: Config,
    store: Arc<CredentialStore>,
    registry: Arc<PermissionRegistry>,
    generator: Arc<dyn CertificateGenerator>,
    orchestrator: BulkRegenerationOrchestrator,
    finder: CredentialFinder,
}

impl CredentialManager {
    /// A manager on the system clock with the built-in generator.
    pub fn new(config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let generator = Arc::new(SigningCertificateGenerator::new(Arc::clone(&clock)));
        Self::with_parts(config, clock, generator)
    }

    pub fn with_parts(config: Config, clock: Arc<dyn Clock>, generator: Arc<dyn CertificateGenerator>) -> Self {
        let store = Arc::new(CredentialStore::with_clock(clock));
        let registry = Arc::new(PermissionRegistry::new(
            Arc::clone(&store),
            config.authorization.acls_enabled,
        ));
        Self {
            orchestrator: BulkRegenerationOrchestrator::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&generator),
            ),
            finder: CredentialFinder::new(Arc::clone(&store), Arc::clone(&registry)),
            config,
            store,
            registry,
            generator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write a new version of `name`.
    ///
    /// A new credential grants its creator every operation plus
    /// `additional_permissions`. An existing one requires WRITE; with
    /// `overwrite` unset its latest version is returned unchanged.
    pub fn set_credential(
        &self,
        context: &RequestContext,
        name: &str,
        value: CredentialValue,
        additional_permissions: &[PermissionEntry],
        overwrite: bool,
    ) -> Result<CredentialVersion, CredvaultError> {
        self.store.audited(context, 200, |tx| {
            tx.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialUpdate,
                Some(name),
                None,
                vec![],
            ));
            let name = normalize_name(name)?;

            let created = !tx.contains(&name);
            let name = if created {
                name
            } else {
                let existing = self.require(tx, context, &name, Operation::Write)?;
                if !overwrite {
                    return latest_version(tx, &existing);
                }
                existing
            };

            let now = tx.now();
            tx.put_version(&name, CredentialVersion::new(value, now))?;
            if created {
                self.registry
                    .grant_on_create(tx, &name, &context.actor, additional_permissions);
            }
            resolve_audit(tx, &name, &context.actor);
            latest_version(tx, &name)
        })
    }

    /// Generate a certificate under `name` from `request`.
    ///
    /// Signing with a CA requires READ on it. Creation and overwrite rules
    /// are those of [`set_credential`](Self::set_credential).
    pub fn generate_certificate(
        &self,
        context: &RequestContext,
        name: &str,
        request: &CertificateGenerationRequest,
        additional_permissions: &[PermissionEntry],
        overwrite: bool,
    ) -> Result<CredentialVersion, CredvaultError> {
        self.store.audited(context, 200, |tx| {
            tx.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialUpdate,
                Some(name),
                None,
                vec![],
            ));
            let name = normalize_name(name)?;
            let mut parameters = CertificateParameters::from_request(request, &self.config.certificates)?;

            let created = !tx.contains(&name);
            let name = if created {
                name
            } else {
                let existing = self.require(tx, context, &name, Operation::Write)?;
                if !overwrite {
                    return latest_version(tx, &existing);
                }
                existing
            };

            self.resolve_signer(tx, context, &mut parameters)?;
            let now = tx.now();
            append_regenerated(tx, self.generator.as_ref(), &name, &parameters, now)?;
            if created {
                self.registry
                    .grant_on_create(tx, &name, &context.actor, additional_permissions);
            }
            resolve_audit(tx, &name, &context.actor);
            tracing::info!(actor = %context.actor, credential = %name, ca = ?parameters.ca_name, "certificate generated");
            latest_version(tx, &name)
        })
    }

    /// Regenerate one certificate from its latest version. Present fields
    /// of `overrides` replace inherited values.
    pub fn regenerate_certificate(
        &self,
        context: &RequestContext,
        name: &str,
        overrides: &CertificateGenerationRequest,
    ) -> Result<CredentialVersion, CredvaultError> {
        self.store.audited(context, 200, |tx| {
            tx.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CertificateRegenerate,
                Some(name),
                None,
                vec![],
            ));
            let name = self.require(tx, context, name, Operation::Write)?;
            resolve_audit(tx, &name, &context.actor);

            let mut parameters = {
                let current = tx
                    .find(&name)
                    .and_then(|credential| credential.latest_certificate())
                    .ok_or_else(|| CredvaultError::invalid("not_a_certificate", name.as_str()))?;
                CertificateParameters::from_existing_certificate(&current.certificate, current.ca_name.as_deref())
                    .with_overrides(overrides)?
            };

            self.resolve_signer(tx, context, &mut parameters)?;
            let now = tx.now();
            append_regenerated(tx, self.generator.as_ref(), &name, &parameters, now)?;
            tracing::info!(actor = %context.actor, credential = %name, "certificate regenerated");
            latest_version(tx, &name)
        })
    }

    /// Remove a credential with all of its versions and permission entries.
    pub fn delete_credential(&self, context: &RequestContext, name: &str) -> Result<(), CredvaultError> {
        self.store.audited(context, 204, |tx| {
            tx.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialDelete,
                Some(name),
                None,
                vec![],
            ));
            let name = self.require(tx, context, name, Operation::Delete)?;
            resolve_audit(tx, &name, &context.actor);
            tx.remove(&name);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_credential(&self, context: &RequestContext, name: &str) -> Result<CredentialVersion, CredvaultError> {
        self.store.read_audited(context, 200, |snapshot| {
            snapshot.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialAccess,
                Some(name),
                None,
                vec![],
            ));
            let name = self.require(snapshot, context, name, Operation::Read)?;
            resolve_audit(snapshot, &name, &context.actor);
            latest_version(snapshot, &name)
        })
    }

    /// Every version of `name`, newest first.
    pub fn get_versions(&self, context: &RequestContext, name: &str) -> Result<Vec<CredentialVersion>, CredvaultError> {
        self.store.read_audited(context, 200, |snapshot| {
            snapshot.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::CredentialAccess,
                Some(name),
                None,
                vec![],
            ));
            let name = self.require(snapshot, context, name, Operation::Read)?;
            resolve_audit(snapshot, &name, &context.actor);
            Ok(snapshot
                .find(&name)
                .map(|credential| credential.versions().iter().rev().cloned().collect())
                .unwrap_or_default())
        })
    }

    pub fn find_by_name_like(&self, context: &RequestContext, pattern: &str) -> Result<Vec<FindResult>, CredvaultError> {
        self.finder.find_by_name_like(context, pattern)
    }

    pub fn find_by_path(&self, context: &RequestContext, path: &str) -> Result<Vec<FindResult>, CredvaultError> {
        self.finder.find_by_path(context, path)
    }

    pub fn find_all_paths(&self, context: &RequestContext) -> Result<Vec<String>, CredvaultError> {
        self.finder.find_all_paths(context)
    }

    // -----------------------------------------------------------------------
    // Permissions and regeneration
    // -----------------------------------------------------------------------

    pub fn list_permissions(&self, context: &RequestContext, name: &str) -> Result<PermissionsView, CredvaultError> {
        self.registry.list_entries(context, name)
    }

    pub fn set_permissions(
        &self,
        context: &RequestContext,
        name: &str,
        entries: Vec<PermissionEntry>,
    ) -> Result<PermissionsView, CredvaultError> {
        self.registry.set_entries(context, name, entries)
    }

    pub fn delete_permission(&self, context: &RequestContext, name: &str, actor: &str) -> Result<(), CredvaultError> {
        self.registry.delete_entry(context, name, actor)
    }

    pub fn bulk_regenerate(&self, context: &RequestContext, signed_by: Option<&str>) -> Result<Vec<String>, CredvaultError> {
        self.orchestrator.bulk_regenerate(context, signed_by)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.store.add_audit_sink(sink);
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.store.audit_records()
    }

    pub fn request_records(&self) -> Vec<RequestAuditRecord> {
        self.store.request_records()
    }

    pub fn auth_failure_records(&self) -> Vec<AuthFailureAuditRecord> {
        self.store.auth_failure_records()
    }

    /// The retention task configured by `[audit_logs]`, not yet started.
    pub fn retention_task(&self) -> AuditRetentionTask {
        AuditRetentionTask::from_config(
            Arc::clone(&self.store),
            &self.config.audit_logs,
            Arc::clone(self.store.clock()),
        )
    }

    /// Resolve `name` to its stored casing if the caller holds `operation`.
    fn require(
        &self,
        data: &StoreData,
        context: &RequestContext,
        name: &str,
        operation: Operation,
    ) -> Result<String, CredvaultError> {
        self.registry
            .authorize(data, name, &context.actor, &[operation])
            .map(|credential| credential.name().to_string())
            .map_err(|cause| denied(context, name, operation, cause))
    }

    /// Check READ on the signing CA and pin its stored casing.
    fn resolve_signer(
        &self,
        data: &StoreData,
        context: &RequestContext,
        parameters: &mut CertificateParameters,
    ) -> Result<(), CredvaultError> {
        if parameters.self_signed {
            return Ok(());
        }
        if let Some(ca_name) = parameters.ca_name.take() {
            parameters.ca_name = Some(self.require(data, context, &ca_name, Operation::Read)?);
        }
        Ok(())
    }
}

/// Point the collected audit parameters at the stored name and record the
/// operations the caller holds on it.
fn resolve_audit(scope: &mut impl AuditScope, name: &str, actor: &str) {
    let held: Vec<Operation> = scope.operations_for(name, actor).into_iter().collect();
    for parameters in scope.audit_parameters_mut() {
        parameters.resolve_name(name);
        parameters.allowed_operations = held.clone();
    }
}

fn latest_version(data: &StoreData, name: &str) -> Result<CredentialVersion, CredvaultError> {
    data.find(name)
        .map(|credential| credential.latest_version().clone())
        .ok_or_else(|| CredvaultError::Integrity(format!("credential {name} vanished inside its transaction")))
}
