//! Private certificate authority store
//!
//! Owns the root key pair and certificate for the agent mTLS trust chain.
//! The pair is generated lazily on first use and persisted to
//! `<certsDir>/ca.key` (0600) and `<certsDir>/ca.crt` (0644); every later
//! start loads the same pair.
//!
//! A pair that is present but unreadable is a hard error, never a trigger
//! for regeneration: regenerating would silently orphan the trust chain of
//! every leaf certificate already issued. Rotation is an explicit operator
//! action (remove both files).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use tracing::{debug, info};

use warden_common::{WardenError, WardenResult};

use super::keys;

/// Root certificate validity in days (~10 years)
const CA_VALIDITY_DAYS: i64 = 3650;

/// CA certificate file name under the certs directory
pub const CA_CERT_FILE: &str = "ca.crt";
/// CA private key file name under the certs directory
pub const CA_KEY_FILE: &str = "ca.key";

/// The root certificate authority, loaded into memory for leaf signing.
pub struct CertificateAuthority {
    certs_dir: PathBuf,
    cert_pem: String,
    key_pair: KeyPair,
    /// Rebuilt issuer certificate used by `signed_by`; carries the same
    /// subject DN as the stored root.
    issuer_cert: Certificate,
    /// Serial counter seeded from the clock at load; unique across the CA
    /// lifetime.
    serial: AtomicU64,
}

impl CertificateAuthority {
    /// Load the CA from `certs_dir`, generating the pair on first use.
    ///
    /// Idempotent; safe to call on every process start. When both files
    /// already exist they are loaded unchanged, byte for byte.
    ///
    /// # Errors
    ///
    /// Fails when only one of the two files exists, or when an existing
    /// key or certificate does not parse. Neither case regenerates.
    pub fn ensure(certs_dir: &Path, organization: &str) -> WardenResult<Self> {
        let cert_path = certs_dir.join(CA_CERT_FILE);
        let key_path = certs_dir.join(CA_KEY_FILE);

        let (cert_pem, key_pair) = match (cert_path.exists(), key_path.exists()) {
            (true, true) => Self::load(&cert_path, &key_path)?,
            (false, false) => Self::generate(certs_dir, organization, &cert_path, &key_path)?,
            (cert_present, _) => {
                let (present, missing) = if cert_present {
                    (CA_CERT_FILE, CA_KEY_FILE)
                } else {
                    (CA_KEY_FILE, CA_CERT_FILE)
                };
                return Err(WardenError::certificate(format!(
                    "CA state in {} is inconsistent: {} exists but {} is missing. \
                     Refusing to regenerate; restore the pair or remove both files to rotate the CA",
                    certs_dir.display(),
                    present,
                    missing,
                )));
            }
        };

        let issuer_cert = Self::rebuild_issuer(&cert_pem, organization, &key_pair)?;

        let seed = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis()) as u64;

        Ok(Self {
            certs_dir: certs_dir.to_path_buf(),
            cert_pem,
            key_pair,
            issuer_cert,
            serial: AtomicU64::new(seed),
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> WardenResult<(String, KeyPair)> {
        debug!(path = %cert_path.display(), "Loading existing CA");

        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| WardenError::io_at(cert_path.display().to_string(), e))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| WardenError::io_at(key_path.display().to_string(), e))?;

        let key_pair = keys::key_pair_from_pem(&key_pem).map_err(|e| {
            WardenError::certificate(format!(
                "CA key at {} exists but does not parse ({}). Refusing to regenerate; \
                 issued agent certificates would lose their trust chain. \
                 Remove both ca.key and ca.crt to rotate the CA",
                key_path.display(),
                e,
            ))
        })?;

        // The certificate must parse too; a readable key with a corrupt
        // certificate is the same inconsistent state.
        keys::certificate_expiry(&cert_pem).map_err(|e| {
            WardenError::certificate(format!(
                "CA certificate at {} exists but does not parse ({}). \
                 Refusing to regenerate; remove both files to rotate the CA",
                cert_path.display(),
                e,
            ))
        })?;

        Ok((cert_pem, key_pair))
    }

    fn generate(
        certs_dir: &Path,
        organization: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> WardenResult<(String, KeyPair)> {
        info!(dir = %certs_dir.display(), organization, "Generating new certificate authority");

        let key_pair = keys::generate_key_pair()?;
        let params = Self::root_params(organization)?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| WardenError::certificate(format!("Failed to self-sign CA: {}", e)))?;

        let cert_pem = cert.pem();
        keys::write_pem_restricted(key_path, &key_pair.serialize_pem())?;
        keys::write_pem_public(cert_path, &cert_pem)?;

        info!(cert = %cert_path.display(), "Certificate authority created");
        Ok((cert_pem, key_pair))
    }

    fn root_params(organization: &str) -> WardenResult<CertificateParams> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} CA", organization));
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let not_before = Utc::now();
        let not_after = not_before + Duration::days(CA_VALIDITY_DAYS);
        params.not_before = rcgen::date_time_ymd(
            not_before.date_naive().year(),
            not_before.date_naive().month() as u8,
            not_before.date_naive().day() as u8,
        );
        params.not_after = rcgen::date_time_ymd(
            not_after.date_naive().year(),
            not_after.date_naive().month() as u8,
            not_after.date_naive().day() as u8,
        );

        let seed = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_millis()) as u64;
        params.serial_number = Some(SerialNumber::from_slice(&seed.to_be_bytes()));

        Ok(params)
    }

    /// Rebuild an issuer `Certificate` carrying the stored root's subject
    /// DN, for use with `signed_by`.
    fn rebuild_issuer(
        cert_pem: &str,
        organization: &str,
        key_pair: &KeyPair,
    ) -> WardenResult<Certificate> {
        let mut params = Self::root_params(organization)?;
        params.distinguished_name = Self::subject_dn_of(cert_pem)?;
        params
            .self_signed(key_pair)
            .map_err(|e| WardenError::certificate(format!("Failed to rebuild CA issuer: {}", e)))
    }

    /// Extract the subject DN of a PEM certificate into rcgen form
    fn subject_dn_of(cert_pem: &str) -> WardenResult<rcgen::DistinguishedName> {
        use x509_parser::prelude::*;

        let (_, pem) = pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| WardenError::certificate(format!("Failed to parse CA PEM: {}", e)))?;
        let (_, cert) = X509Certificate::from_der(&pem.contents).map_err(|e| {
            WardenError::certificate(format!("Failed to parse CA certificate: {}", e))
        })?;

        let mut dn = rcgen::DistinguishedName::new();
        for rdn in cert.subject().iter() {
            for attr in rdn.iter() {
                let value = match attr.as_str() {
                    Ok(v) => v.to_string(),
                    Err(_) => continue,
                };
                match attr.attr_type().to_id_string().as_str() {
                    "2.5.4.3" => dn.push(DnType::CommonName, value),
                    "2.5.4.6" => dn.push(DnType::CountryName, value),
                    "2.5.4.7" => dn.push(DnType::LocalityName, value),
                    "2.5.4.8" => dn.push(DnType::StateOrProvinceName, value),
                    "2.5.4.10" => dn.push(DnType::OrganizationName, value),
                    "2.5.4.11" => dn.push(DnType::OrganizationalUnitName, value),
                    _ => {}
                }
            }
        }
        Ok(dn)
    }

    /// Sign leaf parameters with the CA key
    pub(crate) fn sign(
        &self,
        params: CertificateParams,
        leaf_key: &KeyPair,
    ) -> WardenResult<Certificate> {
        params
            .signed_by(leaf_key, &self.issuer_cert, &self.key_pair)
            .map_err(|e| WardenError::certificate(format!("Failed to sign certificate: {}", e)))
    }

    /// Next serial number, unique across the CA's lifetime
    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// PEM of the root certificate
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Path of the root certificate file
    pub fn cert_path(&self) -> PathBuf {
        self.certs_dir.join(CA_CERT_FILE)
    }

    /// Path of the root key file
    pub fn key_path(&self) -> PathBuf {
        self.certs_dir.join(CA_KEY_FILE)
    }

    /// Directory the CA (and all issued material) lives under
    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("certs_dir", &self.certs_dir)
            .field("serial", &self.serial.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
