//! Certificate regeneration.
//!
//! Bulk regeneration replaces every certificate transitively signed by a CA
//! in one transaction. It runs in two passes: the first resolves the signing
//! graph and checks WRITE on every member without touching the store, the
//! second generates and appends new versions in graph order. Parents are
//! regenerated before their children, so each child is signed by the
//! version its parent received earlier in the same call.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{AuditTrailBuilder, AuditingOperationCode, RequestContext};
use crate::certificate::CertificateParameters;
use crate::credential::{normalize_name, CredentialValue, CredentialVersion};
use crate::error::{CredvaultError, DenialCause};
use crate::generator::{CertificateGenerator, SigningAuthority};
use crate::graph::CertificateGraphResolver;
use crate::permissions::{denied, Operation, PermissionRegistry};
use crate::store::{AuditScope, CredentialStore, StoreData, Transaction};

/// Regenerates whole certificate chains below a CA.
pub struct BulkRegenerationOrchestrator {
    store: Arc<CredentialStore>,
    registry: Arc<PermissionRegistry>,
    generator: Arc<dyn CertificateGenerator>,
}

impl BulkRegenerationOrchestrator {
    pub fn new(
        store: Arc<CredentialStore>,
        registry: Arc<PermissionRegistry>,
        generator: Arc<dyn CertificateGenerator>,
    ) -> Self {
        Self {
            store,
            registry,
            generator,
        }
    }

    /// Regenerate every certificate signed, directly or transitively, by
    /// `signed_by`. Returns the regenerated names in regeneration order.
    ///
    /// Requires READ on the CA and WRITE on every descendant. Either all
    /// descendants receive a new version or none do.
    pub fn bulk_regenerate(
        &self,
        context: &RequestContext,
        signed_by: Option<&str>,
    ) -> Result<Vec<String>, CredvaultError> {
        self.store.audited(context, 200, |tx| {
            tx.audit(AuditTrailBuilder::for_operation(
                AuditingOperationCode::BulkRegenerate,
                signed_by,
                None,
                vec![],
            ));

            let ca_name = match signed_by.map(str::trim) {
                Some(name) if !name.is_empty() => normalize_name(name)?,
                _ => return Err(CredvaultError::validation("missing_signed_by")),
            };

            let ca = self
                .registry
                .authorize(tx, &ca_name, &context.actor, &[Operation::Read])
                .map_err(|cause| denied(context, &ca_name, Operation::Read, cause))?
                .name()
                .to_string();
            let held: Vec<Operation> = tx.operations_for(&ca, &context.actor).into_iter().collect();
            for parameters in tx.audit_parameters_mut() {
                parameters.resolve_name(&ca);
                parameters.allowed_operations = held.clone();
            }

            let data: &StoreData = &**tx;
            let descendants = CertificateGraphResolver::new(data).resolve_descendants(&ca)?;

            for name in &descendants {
                if !self.registry.permits(tx, name, &context.actor, Operation::Write) {
                    tracing::warn!(
                        actor = %context.actor,
                        ca = %ca,
                        credential = %name,
                        "bulk regeneration denied: missing write permission"
                    );
                    return Err(CredvaultError::Forbidden(DenialCause::InsufficientPermission));
                }
            }

            let now = tx.now();
            for name in &descendants {
                let parameters = {
                    let certificate = tx
                        .find(name)
                        .and_then(|credential| credential.latest_certificate())
                        .ok_or_else(|| {
                            CredvaultError::Integrity(format!("{name} is in the signing graph but holds no certificate"))
                        })?;
                    CertificateParameters::from_existing_certificate(
                        &certificate.certificate,
                        certificate.ca_name.as_deref(),
                    )
                };
                append_regenerated(tx, self.generator.as_ref(), name, &parameters, now)?;

                let allowed = tx.operations_for(name, &context.actor).into_iter().collect();
                tx.audit(AuditTrailBuilder::for_operation(
                    AuditingOperationCode::CertificateRegenerate,
                    Some(name),
                    None,
                    allowed,
                ));
            }

            tracing::info!(
                actor = %context.actor,
                ca = %ca,
                regenerated = descendants.len(),
                "bulk regeneration complete"
            );
            Ok(descendants)
        })
    }
}

/// Generate new material for `name` with `parameters` and append it as a
/// version. The signer is the latest version of `parameters.ca_name` as
/// visible in `tx`.
pub(crate) fn append_regenerated(
    tx: &mut Transaction<'_>,
    generator: &dyn CertificateGenerator,
    name: &str,
    parameters: &CertificateParameters,
    now: DateTime<Utc>,
) -> Result<(), CredvaultError> {
    let value = {
        let signer = match (parameters.self_signed, parameters.ca_name.as_deref()) {
            (true, _) => None,
            (false, Some(ca_name)) => {
                let ca = tx.find(ca_name).ok_or_else(|| {
                    tracing::error!(credential = %name, ca = %ca_name, "signing CA does not exist");
                    CredvaultError::Integrity(format!("{name} references missing CA {ca_name}"))
                })?;
                let material = ca
                    .latest_certificate()
                    .ok_or_else(|| CredvaultError::invalid("not_a_certificate", ca_name))?;
                Some(SigningAuthority::from_value(ca.name(), material))
            }
            (false, None) => {
                return Err(CredvaultError::Integrity(format!(
                    "{name} is neither self-signed nor linked to a CA"
                )))
            }
        };
        generator.generate(parameters, signer).map_err(|err| {
            tracing::error!(credential = %name, error = %err, "certificate generation failed");
            err
        })?
    };

    tx.put_version(name, CredentialVersion::new(CredentialValue::Certificate(Box::new(value)), now))
}
