//! # credvault
//!
//! Access-controlled credential store with CA-aware certificate regeneration.
//!
//! Credentials are named, versioned secrets. Every operation on them is
//! checked against a per-credential ACL and recorded in an audit trail.
//! Certificates remember the CA that signed them, which makes the signing
//! graph derivable: bulk regeneration replaces every certificate below a CA
//! in one all-or-nothing transaction, parents before children.
//!
//! ## Public API
//!
//! [`CredentialManager`] is the entry point for credential operations and
//! [`Api`] wraps it for an HTTP layer. The component types are public so
//! they can be composed differently, for example with a custom
//! [`CertificateGenerator`].

pub mod api;
pub mod audit;
pub mod certificate;
pub mod clock;
pub mod config;
pub mod credential;
pub(crate) mod crypto;
pub mod error;
pub mod find;
pub mod generator;
pub mod graph;
pub mod manager;
pub mod permissions;
pub mod regenerate;
pub mod retention;
pub mod store;

pub use api::{Api, ApiResponse};
pub use audit::{
    AuditRecord, AuditSink, AuditingOperationCode, AuthFailureAuditRecord, FileAuditSink, RequestAuditRecord,
    RequestContext,
};
pub use certificate::{Certificate, CertificateGenerationRequest, CertificateParameters, ParsedCertificate};
pub use config::Config;
pub use credential::{CredentialType, CredentialValue, CredentialVersion};
pub use crypto::PrivateKey;
pub use error::CredvaultError;
pub use generator::{CertificateGenerator, SigningAuthority, SigningCertificateGenerator};
pub use manager::CredentialManager;
pub use permissions::{Operation, PermissionEntry, PermissionsView};
