//! Self-signed TLS server certificates.
//!
//! Generation, PEM output and a read-back report of the parsed certificate.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::objects::{oid2sn, oid_registry};
use x509_parser::oid_registry::Oid;
use x509_parser::pem::parse_x509_pem;

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to generate RSA key: {0}")]
    KeyGeneration(#[from] rsa::Error),
    #[error("failed to encode private key: {0}")]
    Encoding(#[from] rsa::pkcs8::Error),
    #[error("failed to build certificate: {0}")]
    Signing(#[from] rcgen::Error),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode PEM: {0}")]
    Pem(String),
    #[error("PEM block is {0:?}, expected CERTIFICATE")]
    NotACertificate(String),
    #[error("failed to parse certificate: {0}")]
    Parse(String),
}

/// Subject and extensions of a generated certificate.
#[derive(Debug, Clone)]
pub struct CertificateProfile {
    pub common_name: String,
    pub organization: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub serial: u64,
    pub valid_days: u32,
    pub key_bits: usize,
}

impl Default for CertificateProfile {
    fn default() -> CertificateProfile {
        CertificateProfile {
            common_name: "localhost".to_owned(),
            organization: "My Organization".to_owned(),
            dns_names: vec!["localhost".to_owned(), "example.com".to_owned()],
            ip_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            serial: 1,
            valid_days: 365,
            key_bits: 2048,
        }
    }
}

/// PEM-encoded certificate and its PKCS#8 private key.
pub struct GeneratedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub fn generate(profile: &CertificateProfile) -> Result<GeneratedCertificate, CertificateError> {
    debug!(bits = profile.key_bits, "generating RSA key");
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), profile.key_bits)?;
    let key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?;

    let mut names: Vec<String> = profile.dns_names.clone();
    names.extend(profile.ip_addresses.iter().map(|ip| ip.to_string()));
    let mut params = CertificateParams::new(names)?;

    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, profile.common_name.as_str());
    subject.push(DnType::OrganizationName, profile.organization.as_str());
    params.distinguished_name = subject;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(profile.valid_days));
    params.serial_number = Some(SerialNumber::from(profile.serial));
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;

    let cert = params.self_signed(&key_pair)?;
    info!(common_name = %profile.common_name, "self-signed certificate generated");

    Ok(GeneratedCertificate {
        cert_pem: cert.pem(),
        key_pem,
    })
}

impl GeneratedCertificate {
    /// Writes `server.crt` and `server.key` into `dir`, replacing existing files.
    pub fn write_to(&self, dir: &Path) -> Result<CertificatePaths, CertificateError> {
        let paths = CertificatePaths {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
        };

        write_file(&paths.cert, self.cert_pem.as_bytes(), 0o644)?;
        write_file(&paths.key, self.key_pem.as_bytes(), 0o600)?;
        info!(cert = %paths.cert.display(), key = %paths.key.display(), "certificate files written");

        Ok(paths)
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), CertificateError> {
    let io_err = |source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file: File = options.open(path).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

/// Reads back a PEM certificate file and inspects it.
pub fn inspect_file(path: &Path, now: DateTime<Utc>) -> Result<CertificateReport, CertificateError> {
    let data = fs::read(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    inspect(&data, now)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidityStatus {
    NotYetValid { starts: DateTime<Utc> },
    Expired { ended: DateTime<Utc> },
    Valid { days_left: i64 },
}

impl ValidityStatus {
    fn at(not_before: DateTime<Utc>, not_after: DateTime<Utc>, now: DateTime<Utc>) -> ValidityStatus {
        if now < not_before {
            ValidityStatus::NotYetValid { starts: not_before }
        } else if now > not_after {
            ValidityStatus::Expired { ended: not_after }
        } else {
            ValidityStatus::Valid {
                days_left: (not_after - now).num_days(),
            }
        }
    }
}

/// Parsed fields of an X.509 certificate.
#[derive(Debug, Clone)]
pub struct CertificateReport {
    pub version: u32,
    pub serial: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject: String,
    pub public_key_algorithm: String,
    pub signature_algorithm: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub is_ca: bool,
    pub key_usage: Vec<&'static str>,
    pub extended_key_usage: Vec<String>,
    pub status: ValidityStatus,
}

/// Decodes the first PEM block of `data`, which must be a certificate.
pub fn inspect(data: &[u8], now: DateTime<Utc>) -> Result<CertificateReport, CertificateError> {
    let (_, pem) = parse_x509_pem(data).map_err(|e| CertificateError::Pem(e.to_string()))?;
    if pem.label != "CERTIFICATE" {
        return Err(CertificateError::NotACertificate(pem.label));
    }
    let cert = pem
        .parse_x509()
        .map_err(|e| CertificateError::Parse(e.to_string()))?;
    let parse_err = |e: x509_parser::error::X509Error| CertificateError::Parse(e.to_string());

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Some(san) = cert.subject_alternative_name().map_err(parse_err)? {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_bytes(raw) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    let mut key_usage = Vec::new();
    if let Some(ku) = cert.key_usage().map_err(parse_err)? {
        let ku = ku.value;
        let flags = [
            (ku.digital_signature(), "DigitalSignature"),
            (ku.non_repudiation(), "ContentCommitment"),
            (ku.key_encipherment(), "KeyEncipherment"),
            (ku.data_encipherment(), "DataEncipherment"),
            (ku.key_agreement(), "KeyAgreement"),
            (ku.key_cert_sign(), "CertSign"),
            (ku.crl_sign(), "CRLSign"),
            (ku.encipher_only(), "EncipherOnly"),
            (ku.decipher_only(), "DecipherOnly"),
        ];
        key_usage.extend(flags.iter().filter(|(set, _)| *set).map(|(_, name)| *name));
    }

    let mut extended_key_usage = Vec::new();
    if let Some(eku) = cert.extended_key_usage().map_err(parse_err)? {
        let eku = eku.value;
        let flags = [
            (eku.any, "Any"),
            (eku.server_auth, "ServerAuth"),
            (eku.client_auth, "ClientAuth"),
            (eku.code_signing, "CodeSigning"),
            (eku.email_protection, "EmailProtection"),
            (eku.time_stamping, "TimeStamping"),
            (eku.ocsp_signing, "OCSPSigning"),
        ];
        extended_key_usage.extend(
            flags
                .iter()
                .filter(|(set, _)| *set)
                .map(|(_, name)| (*name).to_owned()),
        );
        extended_key_usage.extend(eku.other.iter().map(oid_name));
    }

    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;

    Ok(CertificateReport {
        version: cert.version().0 + 1,
        serial: cert.tbs_certificate.serial.to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        subject: cert.subject().to_string(),
        public_key_algorithm: oid_name(&cert.public_key().algorithm.algorithm),
        signature_algorithm: oid_name(&cert.signature_algorithm.algorithm),
        dns_names,
        ip_addresses,
        is_ca: cert.is_ca(),
        key_usage,
        extended_key_usage,
        status: ValidityStatus::at(not_before, not_after, now),
    })
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

fn oid_name(oid: &Oid) -> String {
    oid2sn(oid, oid_registry())
        .map(str::to_owned)
        .unwrap_or_else(|_| oid.to_id_string())
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::Parse(format!("timestamp {} out of range", secs)))
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl fmt::Display for CertificateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Certificate details:")?;
        writeln!(f, "  Version: {}", self.version)?;
        writeln!(f, "  Serial number: {}", self.serial)?;
        writeln!(f, "  Issuer: {}", self.issuer)?;
        writeln!(
            f,
            "  Validity: {} to {}",
            rfc3339(&self.not_before),
            rfc3339(&self.not_after)
        )?;
        writeln!(f, "  Subject: {}", self.subject)?;
        writeln!(f, "  Public key algorithm: {}", self.public_key_algorithm)?;
        writeln!(f, "  Signature algorithm: {}", self.signature_algorithm)?;
        writeln!(f, "  DNS names: {:?}", self.dns_names)?;
        writeln!(f, "  IP addresses: {:?}", self.ip_addresses)?;
        writeln!(f, "  Is CA: {}", self.is_ca)?;
        writeln!(f, "  Key usage: {:?}", self.key_usage)?;
        writeln!(f, "  Extended key usage: {:?}", self.extended_key_usage)?;
        match &self.status {
            ValidityStatus::NotYetValid { starts } => {
                write!(f, "Certificate not yet valid, starts at {}", rfc3339(starts))
            }
            ValidityStatus::Expired { ended } => {
                write!(f, "Certificate expired at {}", rfc3339(ended))
            }
            ValidityStatus::Valid { days_left } => {
                write!(f, "Certificate valid, {} days left", days_left)
            }
        }
    }
}
