//! Root CA persistence and per-host leaf certificate minting
//!
//! The root CA is created once per data directory (`ca.pem` / `ca.key`) and
//! loaded on every later start. Leaves are minted lazily per SNI host,
//! cached for the process lifetime, and handed to rustls as ready-made
//! `CertifiedKey`s so issuance can run inside the TLS handshake path.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rustls::sign::CertifiedKey;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};

use crate::error::CaError;

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "HTTPeek Root CA";
const CA_ORGANIZATION: &str = "HTTPeek";

/// Root validity: five years from creation.
const CA_VALIDITY_DAYS: i64 = 5 * 365;
/// Leaf not_before is backdated an hour to absorb clock skew.
const LEAF_BACKDATE_SECS: i64 = 60 * 60;

/// A minted per-host certificate, ready for the TLS acceptor.
pub struct LeafCert {
    pub host: String,
    pub serial: u64,
    pub certified: Arc<CertifiedKey>,
}

/// Certificate authority backing the MITM bridge.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    ca_not_after: OffsetDateTime,

    /// Per-host leaf cache. The per-host slot lock makes issuance
    /// single-flight: concurrent callers for one host block on the slot and
    /// observe the leaf minted by the winner.
    leaf_cache: Mutex<HashMap<String, Arc<Mutex<Option<Arc<LeafCert>>>>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .field("ca_not_after", &self.ca_not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the CA from `data_dir`, or generate and persist a fresh one when
    /// the files are absent. Decode failures and a key that does not match
    /// the certificate are reported as corrupt; filesystem failures as I/O.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, CaError> {
        let cert_path = data_dir.join(CA_CERT_FILE);
        let key_path = data_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)
        } else {
            Self::generate(&cert_path, &key_path)
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let ca_key = KeyPair::from_pem(&key_pem).map_err(|e| corrupt(key_path, e))?;

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| corrupt(cert_path, e))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
            .map_err(|e| corrupt(cert_path, e))?;

        if parsed.public_key().subject_public_key.data.as_ref() != ca_key.public_key_raw() {
            return Err(CaError::Corrupt {
                path: key_path.display().to_string(),
                reason: "private key does not match ca.pem".into(),
            });
        }
        let ca_not_after =
            OffsetDateTime::from_unix_timestamp(parsed.validity().not_after.timestamp())
                .map_err(|e| corrupt(cert_path, e))?;

        // Rebuild a signing handle from the stored certificate so minted
        // leaves carry the installed root's exact subject and extensions.
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| corrupt(cert_path, e))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| corrupt(cert_path, e))?;

        tracing::info!("Loaded root CA from {}", cert_path.display());

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            ca_cert_der: cert_der,
            ca_not_after,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    fn generate(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        tracing::info!("Generating new root CA at {}", cert_path.display());

        let rsa_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .map_err(|e| std::io::Error::other(format!("RSA key generation failed: {e}")))?;
        let key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| std::io::Error::other(format!("RSA key encoding failed: {e}")))?;
        let ca_key = KeyPair::from_pem(&key_pem).map_err(|e| corrupt(key_path, e))?;

        let now = OffsetDateTime::now_utc();
        let not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = now - Duration::seconds(LEAF_BACKDATE_SECS);
        params.not_after = not_after;

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| std::io::Error::other(format!("CA self-sign failed: {e}")))?;
        let cert_pem = ca_cert.pem();

        write_with_mode(cert_path, cert_pem.as_bytes(), 0o644)?;
        write_with_mode(key_path, key_pem.as_bytes(), 0o600)?;

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| corrupt(cert_path, e))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            ca_cert_der: cert_der,
            ca_not_after: not_after,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Root certificate PEM, for download and trust-store installation.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Root certificate DER, e.g. for a test client's root store.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Return the cached leaf for `host`, minting it on first use.
    /// Concurrent callers for the same host receive the identical leaf.
    pub fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCert>, CaError> {
        let slot = {
            let mut cache = self.leaf_cache.lock();
            cache.entry(host.to_string()).or_default().clone()
        };

        let mut guard = slot.lock();
        if let Some(leaf) = guard.as_ref() {
            return Ok(leaf.clone());
        }
        let leaf = Arc::new(self.mint_leaf(host)?);
        *guard = Some(leaf.clone());
        Ok(leaf)
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCert, CaError> {
        let serial: u64 = rand::thread_rng().gen();

        let mut params = CertificateParams::default();
        params.serial_number = Some(serial.into());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![SanType::IpAddress(ip)]
        } else {
            vec![SanType::DnsName(host.try_into().map_err(|_| {
                CaError::Corrupt {
                    path: host.to_string(),
                    reason: "host is not a valid DNS name".into(),
                }
            })?)]
        };

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(LEAF_BACKDATE_SECS);
        params.not_after = (now + Duration::days(CA_VALIDITY_DAYS)).min(self.ca_not_after);

        let leaf_key = KeyPair::generate().map_err(sign_error)?;
        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(sign_error)?;

        let key_der =
            PrivateKeyDer::try_from(leaf_key.serialize_der()).map_err(|e| CaError::Corrupt {
                path: host.to_string(),
                reason: format!("leaf key encoding: {e}"),
            })?;
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(sign_error)?;

        let chain = vec![
            CertificateDer::from(cert.der().to_vec()),
            self.ca_cert_der.clone(),
        ];

        tracing::debug!("Minted leaf certificate for {} (serial {})", host, serial);

        Ok(LeafCert {
            host: host.to_string(),
            serial,
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> CaError {
    CaError::Corrupt {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

fn sign_error(err: impl std::fmt::Display) -> CaError {
    CaError::Io(std::io::Error::other(format!("signing failed: {err}")))
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<(), CaError> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Location helpers for the CA files inside a data directory.
pub fn ca_paths(data_dir: &Path) -> (PathBuf, PathBuf) {
    (data_dir.join(CA_CERT_FILE), data_dir.join(CA_KEY_FILE))
}
