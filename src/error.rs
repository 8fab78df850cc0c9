//! Error types for credvault.
//!
//! Authorization failures and missing credentials collapse into the same
//! externally visible outcome. The [`DenialCause`] carried alongside is for
//! logs and audit only and never reaches a response body.

use std::fmt;

/// Message returned for every authorization-or-not-found outcome.
pub const GENERIC_AUTHORIZATION_MESSAGE: &str = "The request could not be completed because the credential does not exist or you do not have sufficient authorization.";

/// Message returned for internal failures. Carries no detail.
pub const GENERIC_SERVER_MESSAGE: &str =
    "An application error occurred. Please contact your administrator.";

/// Why an authorization-or-not-found error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialCause {
    /// No credential exists under the requested name.
    CredentialMissing,
    /// The credential exists but the caller lacks the operation.
    InsufficientPermission,
}

/// The single error type for all credvault operations.
#[derive(Debug)]
pub enum CredvaultError {
    /// Read-side authorization failure or absent credential (404).
    NotFound(DenialCause),

    /// Write-side authorization failure (403).
    Forbidden(DenialCause),

    /// A request field holds a value outside its enumerated domain, or a
    /// required field is missing. `code` is machine readable; `token` is the
    /// offending input when there is one.
    InvalidParameter { code: &'static str, token: Option<String> },

    /// An internal invariant was violated (signing-graph cycle, dangling CA
    /// reference, corrupted version payload).
    Integrity(String),

    /// The certificate generator could not produce key or certificate material.
    GenerationFailure(String),

    /// Configuration could not be read or parsed.
    Config(String),

    /// Filesystem failure (config file, audit sink).
    Io(std::io::Error),
}

impl CredvaultError {
    /// Shorthand for a validation failure without an offending token.
    pub fn validation(code: &'static str) -> Self {
        Self::InvalidParameter { code, token: None }
    }

    /// Shorthand for a validation failure that names the offending token.
    pub fn invalid(code: &'static str, token: impl Into<String>) -> Self {
        Self::InvalidParameter {
            code,
            token: Some(token.into()),
        }
    }

    /// Whether this is one of the merged authorization-or-not-found outcomes.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Forbidden(_))
    }

    /// The HTTP status the outer layer maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::InvalidParameter { .. } => 400,
            Self::Integrity(_) | Self::GenerationFailure(_) | Self::Config(_) | Self::Io(_) => 500,
        }
    }

    /// The message surfaced to callers. Denials and internal errors are
    /// rendered generically; validation errors verbatim.
    pub fn response_message(&self) -> String {
        match self {
            Self::NotFound(_) | Self::Forbidden(_) => GENERIC_AUTHORIZATION_MESSAGE.to_string(),
            Self::InvalidParameter { code, token } => validation_message(code, token.as_deref()),
            _ => GENERIC_SERVER_MESSAGE.to_string(),
        }
    }
}

fn validation_message(code: &str, token: Option<&str>) -> String {
    let token = token.unwrap_or_default();
    match code {
        "missing_signed_by" => {
            "You must specify a signing CA. Please update and retry your request.".to_string()
        }
        "invalid_key_usage" => format!(
            "The provided key usage '{token}' is not supported. Valid values include 'digital_signature', 'non_repudiation', 'key_encipherment', 'data_encipherment', 'key_agreement', 'key_cert_sign', 'crl_sign', 'encipher_only' and 'decipher_only'."
        ),
        "invalid_extended_key_usage" => format!(
            "The provided extended key usage '{token}' is not supported. Valid values include 'client_auth', 'server_auth', 'code_signing', 'email_protection' and 'timestamping'."
        ),
        "invalid_key_length" => {
            "The provided key length is not supported. Valid values include '2048', '3072' and '4096'.".to_string()
        }
        "invalid_duration" => {
            "The provided duration must be between 1 and 3650 days.".to_string()
        }
        "missing_signing_ca" => {
            "A signing CA, self_sign or is_ca must be provided to generate a certificate.".to_string()
        }
        "ca_and_self_sign" => {
            "A certificate cannot be both self-signed and signed by a CA.".to_string()
        }
        "missing_certificate_parameters" => {
            "You must specify at least one subject field or alternative name.".to_string()
        }
        "missing_credential_name" => {
            "A credential name must be provided. Please validate your input and retry your request.".to_string()
        }
        "invalid_credential_name" => format!(
            "The credential name '{token}' contains invalid characters or empty path segments."
        ),
        "type_mismatch" => {
            "The credential type cannot be modified. Please delete the credential if you wish to create it with a different type.".to_string()
        }
        "not_a_certificate" => {
            "The referenced credential is not a certificate.".to_string()
        }
        "missing_actor" => {
            "An actor must be provided for every permission entry.".to_string()
        }
        "not_a_ca" => format!("The credential '{token}' is not a certificate authority."),
        "bad_request" => "The request could not be fulfilled because the request path or body did not meet expectation. Please check the documentation for required formatting and retry your request.".to_string(),
        other => format!("invalid parameter: {other}"),
    }
}

impl fmt::Display for CredvaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(cause) => write!(f, "not found or not authorized ({:?})", cause),
            Self::Forbidden(cause) => write!(f, "forbidden ({:?})", cause),
            Self::InvalidParameter { code, token: Some(token) } => {
                write!(f, "invalid parameter {}: {}", code, token)
            }
            Self::InvalidParameter { code, token: None } => write!(f, "invalid parameter {}", code),
            Self::Integrity(reason) => write!(f, "integrity violation: {}", reason),
            Self::GenerationFailure(reason) => write!(f, "certificate generation failed: {}", reason),
            Self::Config(reason) => write!(f, "configuration error: {}", reason),
            Self::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for CredvaultError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CredvaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
