//! Credentials and their versions.
//!
//! A credential is a named, typed, append-only sequence of versions. The
//! value of each version is a tagged enum; type-specific payloads are only
//! reachable after checking the tag.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::certificate::Certificate;
use crate::crypto::PrivateKey;
use crate::error::CredvaultError;

/// Prefix a leading `/` when missing and reject empty path segments.
pub fn normalize_name(name: &str) -> Result<String, CredvaultError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Err(CredvaultError::validation("missing_credential_name"));
    }
    let normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    if normalized.ends_with('/') || normalized.contains("//") {
        return Err(CredvaultError::invalid("invalid_credential_name", name));
    }
    Ok(normalized)
}

/// The case-folded lookup key for a credential name.
pub fn name_key(name: &str) -> String {
    let key = name.trim().to_lowercase();
    if key.starts_with('/') {
        key
    } else {
        format!("/{key}")
    }
}

/// The credential type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    Value,
    Password,
    Json,
    User,
    Rsa,
    Ssh,
    Certificate,
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Value => "value",
            Self::Password => "password",
            Self::Json => "json",
            Self::User => "user",
            Self::Rsa => "rsa",
            Self::Ssh => "ssh",
            Self::Certificate => "certificate",
        };
        f.write_str(name)
    }
}

/// The certificate payload of a version.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateCredentialValue {
    pub certificate: Certificate,
    pub private_key: PrivateKey,
    /// The issuing CA's certificate at signing time. `None` when self-signed.
    pub ca_certificate: Option<Certificate>,
    /// Weak back-reference to the signing credential, by name.
    pub ca_name: Option<String>,
}

impl CertificateCredentialValue {
    pub fn is_ca(&self) -> bool {
        self.certificate.is_ca()
    }

    pub fn is_self_signed(&self) -> bool {
        self.certificate.is_self_signed()
    }
}

/// The value of a single credential version.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialValue {
    Value(String),
    Password(String),
    Json(serde_json::Value),
    User { username: String, password: String },
    Rsa { public_key: String, private_key: String },
    Ssh { public_key: String, private_key: String },
    Certificate(Box<CertificateCredentialValue>),
}

impl CredentialValue {
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::Value(_) => CredentialType::Value,
            Self::Password(_) => CredentialType::Password,
            Self::Json(_) => CredentialType::Json,
            Self::User { .. } => CredentialType::User,
            Self::Rsa { .. } => CredentialType::Rsa,
            Self::Ssh { .. } => CredentialType::Ssh,
            Self::Certificate(_) => CredentialType::Certificate,
        }
    }

    pub fn as_certificate(&self) -> Option<&CertificateCredentialValue> {
        match self {
            Self::Certificate(cert) => Some(cert),
            _ => None,
        }
    }
}

/// One immutable version of a credential.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialVersion {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub value: CredentialValue,
}

impl CredentialVersion {
    pub fn new(value: CredentialValue, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at,
            value,
        }
    }
}

/// A named credential and its version history, oldest first.
#[derive(Debug, Clone)]
pub struct Credential {
    id: Uuid,
    name: String,
    credential_type: CredentialType,
    versions: Vec<CredentialVersion>,
}

impl Credential {
    /// Create a credential whose first version is `version`.
    pub fn new(name: String, version: CredentialVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            credential_type: version.value.credential_type(),
            versions: vec![version],
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The name with its original casing.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential_type(&self) -> CredentialType {
        self.credential_type
    }

    pub fn versions(&self) -> &[CredentialVersion] {
        &self.versions
    }

    pub fn latest_version(&self) -> &CredentialVersion {
        // A credential is never constructed without a version and versions
        // are never removed.
        &self.versions[self.versions.len() - 1]
    }

    /// The latest certificate payload, or `None` for other credential types.
    pub fn latest_certificate(&self) -> Option<&CertificateCredentialValue> {
        self.latest_version().value.as_certificate()
    }

    /// Append a version. The type is fixed at creation.
    pub fn append(&mut self, version: CredentialVersion) -> Result<(), CredvaultError> {
        if version.value.credential_type() != self.credential_type {
            return Err(CredvaultError::validation("type_mismatch"));
        }
        self.versions.push(version);
        Ok(())
    }

    /// Drop versions past `len`. Only used to undo appends of an aborted
    /// transaction, so `len` is never zero.
    pub(crate) fn truncate_versions(&mut self, len: usize) {
        self.versions.truncate(len.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("ca-to-rotate").unwrap(), "/ca-to-rotate");
        assert_eq!(normalize_name("/My/Cert").unwrap(), "/My/Cert");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("/a//b").is_err());
        assert!(normalize_name("/folder/").is_err());
    }

    #[test]
    fn test_name_key_is_case_insensitive() {
        assert_eq!(name_key("/My/Cert"), name_key("my/cert"));
    }

    #[test]
    fn test_versions_are_append_only_and_typed() {
        let now = Utc::now();
        let mut credential = Credential::new(
            "/password".into(),
            CredentialVersion::new(CredentialValue::Password("one".into()), now),
        );
        credential
            .append(CredentialVersion::new(CredentialValue::Password("two".into()), now))
            .unwrap();

        assert_eq!(credential.versions().len(), 2);
        assert_eq!(credential.latest_version().value, CredentialValue::Password("two".into()));

        let err = credential
            .append(CredentialVersion::new(CredentialValue::Value("three".into()), now))
            .unwrap_err();
        assert!(matches!(err, CredvaultError::InvalidParameter { code: "type_mismatch", .. }));
        assert_eq!(credential.versions().len(), 2);
        assert!(credential.latest_certificate().is_none());
    }
}
