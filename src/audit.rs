//! Request-scoped audit trail.
//!
//! Three kinds of record are kept apart:
//! - [`AuditRecord`]: one per audited operation, whether it succeeds or is
//!   denied, committed by the store together with the data it describes
//! - [`RequestAuditRecord`]: one per handled request, with method, path and
//!   response status
//! - [`AuthFailureAuditRecord`]: one per request rejected before an actor
//!   was established
//!
//! The log is append-only apart from retention cleanup.
//! Supports pluggable sinks for forwarding records to files, S3, etc.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::permissions::{Operation, PermissionEntry};

/// The authenticated caller of one request, plus the UUID that correlates
/// every audit record the request produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_uuid: Uuid,
    pub actor: String,
}

impl RequestContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            request_uuid: Uuid::new_v4(),
            actor: actor.into(),
        }
    }
}

/// What kind of operation an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditingOperationCode {
    CredentialAccess,
    CredentialFind,
    CredentialUpdate,
    CredentialDelete,
    AclAccess,
    AclUpdate,
    AclDelete,
    CertificateRegenerate,
    BulkRegenerate,
}

/// The operation-specific part of an audit record, collected while the
/// operation runs and finalized once its outcome is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditParameters {
    pub operation: AuditingOperationCode,
    pub credential_name: Option<String>,
    /// The actor an ACL operation is about, which is not necessarily the caller.
    pub acl_actor: Option<String>,
    /// Operations found to be held at decision time.
    pub allowed_operations: Vec<Operation>,
}

impl AuditParameters {
    /// Replace the recorded name with the one resolved by lookup.
    pub fn resolve_name(&mut self, name: &str) {
        self.credential_name = Some(name.to_string());
    }
}

/// A permanent record of one audited operation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_uuid: Uuid,
    /// The caller.
    pub actor: String,
    pub operation: AuditingOperationCode,
    pub credential_name: Option<String>,
    pub acl_actor: Option<String>,
    pub allowed_operations: Vec<Operation>,
    pub success: bool,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// A permanent record of one handled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAuditRecord {
    pub request_uuid: Uuid,
    pub actor: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

impl RequestAuditRecord {
    pub fn new(
        context: &RequestContext,
        method: &str,
        path: &str,
        status_code: u16,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_uuid: context.request_uuid,
            actor: context.actor.clone(),
            method: method.to_string(),
            path: path.to_string(),
            status_code,
            timestamp,
        }
    }
}

/// A request rejected because its caller could not be authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailureAuditRecord {
    pub request_uuid: Uuid,
    pub method: String,
    pub path: String,
    pub reason: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

impl AuthFailureAuditRecord {
    pub fn new(method: &str, path: &str, reason: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            request_uuid: Uuid::new_v4(),
            method: method.to_string(),
            path: path.to_string(),
            reason: reason.to_string(),
            status_code: 401,
            timestamp,
        }
    }
}

/// Shapes audit parameters and records.
pub struct AuditTrailBuilder;

impl AuditTrailBuilder {
    pub fn for_operation(
        code: AuditingOperationCode,
        credential_name: Option<&str>,
        actor: Option<&str>,
        allowed_operations: Vec<Operation>,
    ) -> AuditParameters {
        AuditParameters {
            operation: code,
            credential_name: credential_name.map(str::to_string),
            acl_actor: actor.map(str::to_string),
            allowed_operations,
        }
    }

    /// One parameter set per permission entry.
    pub fn for_permissions(
        code: AuditingOperationCode,
        credential_name: &str,
        entries: &[PermissionEntry],
    ) -> Vec<AuditParameters> {
        entries
            .iter()
            .map(|entry| {
                Self::for_operation(
                    code,
                    Some(credential_name),
                    Some(&entry.actor),
                    entry.operations.iter().copied().collect(),
                )
            })
            .collect()
    }

    /// Finalize parameters with the request identity and outcome.
    pub fn finish(
        parameters: AuditParameters,
        context: &RequestContext,
        success: bool,
        status_code: u16,
        timestamp: DateTime<Utc>,
    ) -> AuditRecord {
        AuditRecord {
            request_uuid: context.request_uuid,
            actor: context.actor.clone(),
            operation: parameters.operation,
            credential_name: parameters.credential_name,
            acl_actor: parameters.acl_actor,
            allowed_operations: parameters.allowed_operations,
            success,
            status_code,
            timestamp,
        }
    }
}

/// A sink that receives audit records. Implement this to forward records
/// to a file, database, S3, or other persistent store.
pub trait AuditSink: Send + Sync {
    /// Append a record. Called for every committed record.
    fn append(&mut self, record: AuditRecord);

    /// Called for every handled request. Ignored unless overridden.
    fn append_request(&mut self, _record: RequestAuditRecord) {}

    /// Called for every authentication failure. Ignored unless overridden.
    fn append_auth_failure(&mut self, _record: AuthFailureAuditRecord) {}
}

/// An append-only log of all audit records.
/// Can forward records to additional sinks via `add_forward_sink`.
#[derive(Default)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    requests: Vec<RequestAuditRecord>,
    auth_failures: Vec<AuthFailureAuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("requests", &self.requests.len())
            .field("auth_failures", &self.auth_failures.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record to the log and forward to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    pub fn append_request(&mut self, record: RequestAuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append_request(record.clone());
        }
        self.requests.push(record);
    }

    pub fn append_auth_failure(&mut self, record: AuthFailureAuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append_auth_failure(record.clone());
        }
        self.auth_failures.push(record);
    }

    /// Drop records of every kind older than `cutoff`. Returns how many
    /// were removed.
    pub fn delete_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len() + self.requests.len() + self.auth_failures.len();
        self.records.retain(|record| record.timestamp >= cutoff);
        self.requests.retain(|record| record.timestamp >= cutoff);
        self.auth_failures.retain(|record| record.timestamp >= cutoff);
        before - (self.records.len() + self.requests.len() + self.auth_failures.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }

    pub fn requests(&self) -> &[RequestAuditRecord] {
        &self.requests
    }

    pub fn auth_failures(&self) -> &[AuthFailureAuditRecord] {
        &self.auth_failures
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn write_line(&mut self, record: &impl Serialize, request_uuid: Uuid) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode audit record");
                return;
            }
        };
        if let Err(e) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
            tracing::error!(error = %e, %request_uuid, "failed to write audit record");
        }
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        self.write_line(&record, record.request_uuid);
    }

    fn append_request(&mut self, record: RequestAuditRecord) {
        self.write_line(&record, record.request_uuid);
    }

    fn append_auth_failure(&mut self, record: AuthFailureAuditRecord) {
        self.write_line(&record, record.request_uuid);
    }
}
