//! Certificate generation.
//!
//! [`CertificateGenerator`] is the seam between the lifecycle engine and the
//! key-generation and signing primitives. [`SigningCertificateGenerator`] is
//! the built-in implementation: RSA keys from `crate::crypto`, certificates
//! encoded and signed by `rcgen`, then parsed back into [`Certificate`].

use std::sync::Arc;

use chrono::Duration;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
    SerialNumber,
};
use time::OffsetDateTime;

use crate::certificate::{
    validate_key_length, AlternativeName, Certificate, CertificateParameters, ExtendedKeyUsage, KeyUsage,
};
use crate::clock::Clock;
use crate::credential::CertificateCredentialValue;
use crate::crypto::{self, PrivateKey};
use crate::error::CredvaultError;

/// The latest key material of the CA that signs a new certificate.
#[derive(Debug, Clone, Copy)]
pub struct SigningAuthority<'a> {
    pub name: &'a str,
    pub certificate: &'a Certificate,
    pub private_key: &'a PrivateKey,
}

impl<'a> SigningAuthority<'a> {
    /// Borrow the signer out of a stored certificate version.
    pub fn from_value(name: &'a str, value: &'a CertificateCredentialValue) -> Self {
        Self {
            name,
            certificate: &value.certificate,
            private_key: &value.private_key,
        }
    }
}

/// Produces new key material and a signed certificate for a parameter bundle.
pub trait CertificateGenerator: Send + Sync {
    /// `signer` is `None` exactly when `parameters.self_signed` is set.
    fn generate(
        &self,
        parameters: &CertificateParameters,
        signer: Option<SigningAuthority<'_>>,
    ) -> Result<CertificateCredentialValue, CredvaultError>;
}

/// Generates RSA keys and issues X.509 certificates with `rcgen`.
pub struct SigningCertificateGenerator {
    clock: Arc<dyn Clock>,
}

impl SigningCertificateGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn build_params(&self, parameters: &CertificateParameters) -> Result<CertificateParams, CredvaultError> {
        let mut params = CertificateParams::default();

        let mut dn = rcgen::DistinguishedName::new();
        for (attr, value) in parameters.subject.fields().ordered() {
            let Some(value) = value else { continue };
            let dn_type = match attr {
                "L" => DnType::LocalityName,
                "O" => DnType::OrganizationName,
                "ST" => DnType::StateOrProvinceName,
                "C" => DnType::CountryName,
                "OU" => DnType::OrganizationalUnitName,
                _ => DnType::CommonName,
            };
            dn.push(dn_type, value);
        }
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from(crypto::generate_serial()?));

        let not_before = self.clock.now();
        let not_after = not_before + Duration::days(i64::from(parameters.duration_days));
        params.not_before = offset_date_time(not_before.timestamp())?;
        params.not_after = offset_date_time(not_after.timestamp())?;

        params.is_ca = if parameters.is_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::NoCa
        };

        if let Some(usage) = parameters.key_usage {
            params.key_usages = [
                (KeyUsage::DIGITAL_SIGNATURE, KeyUsagePurpose::DigitalSignature),
                (KeyUsage::NON_REPUDIATION, KeyUsagePurpose::ContentCommitment),
                (KeyUsage::KEY_ENCIPHERMENT, KeyUsagePurpose::KeyEncipherment),
                (KeyUsage::DATA_ENCIPHERMENT, KeyUsagePurpose::DataEncipherment),
                (KeyUsage::KEY_AGREEMENT, KeyUsagePurpose::KeyAgreement),
                (KeyUsage::KEY_CERT_SIGN, KeyUsagePurpose::KeyCertSign),
                (KeyUsage::CRL_SIGN, KeyUsagePurpose::CrlSign),
                (KeyUsage::ENCIPHER_ONLY, KeyUsagePurpose::EncipherOnly),
                (KeyUsage::DECIPHER_ONLY, KeyUsagePurpose::DecipherOnly),
            ]
            .into_iter()
            .filter(|(bit, _)| usage.contains(*bit))
            .map(|(_, purpose)| purpose)
            .collect();
        }

        if let Some(purposes) = &parameters.extended_key_usage {
            params.extended_key_usages = purposes
                .iter()
                .map(|purpose| match purpose {
                    ExtendedKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
                    ExtendedKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
                    ExtendedKeyUsage::CodeSigning => ExtendedKeyUsagePurpose::CodeSigning,
                    ExtendedKeyUsage::EmailProtection => ExtendedKeyUsagePurpose::EmailProtection,
                    ExtendedKeyUsage::TimeStamping => ExtendedKeyUsagePurpose::TimeStamping,
                })
                .collect();
        }

        if let Some(names) = &parameters.alternative_names {
            params.subject_alt_names = names
                .iter()
                .map(|name| match name {
                    AlternativeName::Ip(ip) => Ok(SanType::IpAddress(*ip)),
                    AlternativeName::Dns(dns) => dns
                        .clone()
                        .try_into()
                        .map(SanType::DnsName)
                        .map_err(|e| CredvaultError::invalid("invalid_alternative_name", format!("{dns}: {e}"))),
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(params)
    }
}

impl CertificateGenerator for SigningCertificateGenerator {
    fn generate(
        &self,
        parameters: &CertificateParameters,
        signer: Option<SigningAuthority<'_>>,
    ) -> Result<CertificateCredentialValue, CredvaultError> {
        let signer = match (parameters.self_signed, signer) {
            (true, _) => None,
            (false, Some(signer)) => {
                if !signer.certificate.is_ca() {
                    return Err(CredvaultError::invalid("not_a_ca", signer.name));
                }
                Some(signer)
            }
            (false, None) => {
                return Err(CredvaultError::GenerationFailure(
                    "certificate is not self-signed and no signing CA was supplied".into(),
                ))
            }
        };

        let key_length = validate_key_length(parameters.key_length)?;
        let params = self.build_params(parameters)?;
        let private_key = crypto::generate_private_key(key_length)?;
        let key_pair = private_key.key_pair()?;

        let issued = match signer {
            None => params.self_signed(&key_pair).map_err(generation_failure)?,
            Some(signer) => {
                let issuer_key = signer.private_key.key_pair()?;
                if issuer_key.public_key_raw() != signer.certificate.parsed().public_key.as_slice() {
                    return Err(CredvaultError::Integrity(format!(
                        "private key of {} does not match its certificate",
                        signer.name
                    )));
                }
                let issuer = CertificateParams::from_ca_cert_pem(signer.certificate.pem())
                    .and_then(|issuer| issuer.self_signed(&issuer_key))
                    .map_err(generation_failure)?;
                params
                    .signed_by(&key_pair, &issuer, &issuer_key)
                    .map_err(generation_failure)?
            }
        };

        Ok(CertificateCredentialValue {
            certificate: Certificate::from_pem(&issued.pem())?,
            private_key,
            ca_certificate: signer.map(|s| s.certificate.clone()),
            ca_name: if parameters.self_signed {
                None
            } else {
                parameters.ca_name.clone()
            },
        })
    }
}

fn generation_failure(e: rcgen::Error) -> CredvaultError {
    CredvaultError::GenerationFailure(format!("certificate issuance failed: {e}"))
}

fn offset_date_time(secs: i64) -> Result<OffsetDateTime, CredvaultError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| CredvaultError::GenerationFailure(format!("validity out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateGenerationRequest;
    use crate::clock::SystemClock;
    use crate::config::CertificateDefaults;

    fn params(request: CertificateGenerationRequest) -> CertificateParameters {
        CertificateParameters::from_request(&request, &CertificateDefaults::default()).unwrap()
    }

    #[test]
    fn test_self_signed_root() {
        let generator = SigningCertificateGenerator::new(Arc::new(SystemClock));
        let root = generator
            .generate(&params(CertificateGenerationRequest::with_common_name("root").as_ca()), None)
            .unwrap();

        assert!(root.is_ca());
        assert!(root.is_self_signed());
        assert!(root.ca_name.is_none());
        assert!(root.ca_certificate.is_none());
        assert_eq!(root.certificate.duration_days(), 365);
        assert_eq!(root.certificate.key_length(), 2048);
        assert!(root.certificate.pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_key_is_sized_to_requested_length() {
        let generator = SigningCertificateGenerator::new(Arc::new(SystemClock));
        let mut request = CertificateGenerationRequest::with_common_name("big-root").as_ca();
        request.key_length = Some(4096);
        let root = generator.generate(&params(request), None).unwrap();

        assert_eq!(root.certificate.key_length(), 4096);
        assert_eq!(root.certificate.parsed().key_length, 4096);
        let key_pair = root.private_key.key_pair().unwrap();
        assert_eq!(key_pair.public_key_raw(), root.certificate.parsed().public_key.as_slice());
    }

    #[test]
    fn test_leaf_is_signed_by_ca_key() {
        let generator = SigningCertificateGenerator::new(Arc::new(SystemClock));
        let root = generator
            .generate(&params(CertificateGenerationRequest::with_common_name("root").as_ca()), None)
            .unwrap();

        let mut request = CertificateGenerationRequest::with_common_name("leaf").signed_by("/root");
        request.key_usage = Some(vec!["digital_signature".into()]);
        request.extended_key_usage = Some(vec!["server_auth".into()]);
        request.alternative_names = Some(vec!["10.0.0.7".into(), "leaf.example.com".into()]);
        let leaf = generator
            .generate(&params(request), Some(SigningAuthority::from_value("/root", &root)))
            .unwrap();

        assert!(!leaf.is_self_signed());
        assert!(!leaf.is_ca());
        assert!(leaf.certificate.is_signed_by(&root.certificate));
        assert_eq!(leaf.certificate.parsed().issuer, root.certificate.parsed().subject);
        assert_eq!(leaf.ca_name.as_deref(), Some("/root"));
        assert_eq!(leaf.ca_certificate.as_ref(), Some(&root.certificate));
        assert_eq!(leaf.certificate.parsed().key_usage, Some(KeyUsage::from_bits(KeyUsage::DIGITAL_SIGNATURE)));
        assert_eq!(leaf.certificate.parsed().extended_key_usage, Some(vec![ExtendedKeyUsage::ServerAuth]));
        assert_eq!(
            leaf.certificate.parsed().alternative_names,
            Some(vec![AlternativeName::classify("10.0.0.7"), AlternativeName::Dns("leaf.example.com".into())])
        );
    }

    #[test]
    fn test_subject_keeps_distinguished_name_order() {
        let generator = SigningCertificateGenerator::new(Arc::new(SystemClock));
        let mut request = CertificateGenerationRequest::with_common_name("root").as_ca();
        request.subject.organization = Some("organization".into());
        request.subject.country = Some("US".into());
        let root = generator.generate(&params(request), None).unwrap();

        assert_eq!(root.certificate.parsed().subject.as_str(), "O=organization,C=US,CN=root");
    }

    #[test]
    fn test_mismatched_signer_key_is_rejected() {
        let generator = SigningCertificateGenerator::new(Arc::new(SystemClock));
        let root = generator
            .generate(&params(CertificateGenerationRequest::with_common_name("root").as_ca()), None)
            .unwrap();
        let other = generator
            .generate(&params(CertificateGenerationRequest::with_common_name("other").as_ca()), None)
            .unwrap();

        let forged = SigningAuthority {
            name: "/root",
            certificate: &root.certificate,
            private_key: &other.private_key,
        };
        let leaf = CertificateGenerationRequest::with_common_name("leaf").signed_by("/root");
        let err = generator.generate(&params(leaf), Some(forged)).unwrap_err();
        assert!(matches!(err, CredvaultError::Integrity(_)));
    }

    #[test]
    fn test_non_ca_signer_is_rejected() {
        let generator = SigningCertificateGenerator::new(Arc::new(SystemClock));
        let mut request = CertificateGenerationRequest::with_common_name("plain");
        request.self_sign = Some(true);
        let plain = generator.generate(&params(request), None).unwrap();

        let leaf = CertificateGenerationRequest::with_common_name("leaf").signed_by("/plain");
        let err = generator
            .generate(&params(leaf), Some(SigningAuthority::from_value("/plain", &plain)))
            .unwrap_err();
        assert!(matches!(err, CredvaultError::InvalidParameter { code: "not_a_ca", .. }));
    }
}
