//! Root and leaf certificate management.
//!
//! The bridge presents a certificate for `127.0.0.1` signed by a local root
//! that the operator installs as trusted once. The root is created lazily and
//! reused for the lifetime of the certificate directory, since replacing it
//! would invalidate the installed trust anchor.
//!
//! Private keys are written unencrypted (PKCS#8 PEM). The bridge runs on a
//! single-operator machine and must start unattended, so there is nowhere to
//! keep a passphrase.

use crate::error::CertificateError;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const SERVER_CERT_FILE: &str = "server.crt";

/// The address the browser expects the Ukey driver on.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const VALIDITY_DAYS: i64 = 3650;
const ORGANIZATION: &str = "CertAide";
const ROOT_COMMON_NAME: &str = "pawdroot";
const LOCAL_UNIT: &str = "pawd";
const REMOTE_UNIT: &str = "RemoteNode";

/// Paths of the loopback server identity and the root that signed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub root_cert: PathBuf,
    pub leaf_cert: PathBuf,
    pub leaf_key: PathBuf,
}

/// Paths of a leaf issued for an arbitrary target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedIdentity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A loaded root: its signing key plus the subject taken from `ca.crt`.
struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
}

impl RootAuthority {
    /// Load `ca.key` + `ca.crt` from `dir`.
    fn load(dir: &Path) -> Result<Self, CertificateError> {
        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);
        if !key_path.is_file() || !cert_path.is_file() {
            return Err(CertificateError::MissingRoot(dir.to_path_buf()));
        }

        let key_pem = read_pem(&key_path)?;
        let cert_pem = read_pem(&cert_path)?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;

        Ok(Self { issuer, cert_pem })
    }

    /// Generate a fresh root and persist it to `dir`.
    fn create(dir: &Path) -> Result<Self, CertificateError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = name(ROOT_COMMON_NAME, LOCAL_UNIT);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();

        write_private(&dir.join(CA_KEY_FILE), &key_pair.serialize_pem())?;
        write_public(&dir.join(CA_CERT_FILE), &cert_pem)?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
        Ok(Self { issuer, cert_pem })
    }

    /// Sign a leaf bound to `ip`. Returns (cert PEM, key PEM).
    fn issue_leaf(
        &self,
        ip: IpAddr,
        unit: &str,
        not_before: OffsetDateTime,
    ) -> Result<(String, String), CertificateError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = name(&ip.to_string(), unit);
        // Strict clients ignore the common name for IP endpoints.
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(VALIDITY_DAYS);

        let cert = params.signed_by(&key_pair, &self.issuer)?;
        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

/// Make sure `dir` holds a loopback server identity.
///
/// Existing `server.crt` + `server.key` are returned untouched. Otherwise the
/// root is loaded (or created if absent) and a fresh loopback leaf is signed.
pub fn ensure_server_identity(dir: &Path) -> Result<ServerIdentity, CertificateError> {
    let identity = ServerIdentity {
        root_cert: dir.join(CA_CERT_FILE),
        leaf_cert: dir.join(SERVER_CERT_FILE),
        leaf_key: dir.join(SERVER_KEY_FILE),
    };

    if identity.leaf_cert.is_file() && identity.leaf_key.is_file() {
        debug!("Reusing server identity in {}", dir.display());
        return Ok(identity);
    }

    fs::create_dir_all(dir).map_err(|source| CertificateError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    let root = match RootAuthority::load(dir) {
        Ok(root) => root,
        Err(CertificateError::MissingRoot(_)) => {
            info!("Generating root certificate (ECDSA P-256)");
            RootAuthority::create(dir)?
        }
        Err(e) => return Err(e),
    };

    let (cert_pem, key_pem) = root.issue_leaf(LOOPBACK, LOCAL_UNIT, OffsetDateTime::now_utc())?;
    write_private(&identity.leaf_key, &key_pem)?;
    write_public(&identity.leaf_cert, &cert_pem)?;

    info!("Server certificate generated for {}", LOOPBACK);
    if let Some(fp) = fingerprint(&root.cert_pem) {
        info!("Root fingerprint (SHA-256): {}", fp);
    }
    info!(
        "Install {} as a trusted root certificate authority on this machine",
        identity.root_cert.display()
    );

    Ok(identity)
}

/// Sign a leaf for `target` with the existing root in `dir`.
///
/// Writes `<target>.crt` and `<target>.key`. Fails without writing anything
/// if the root has not been created yet.
pub fn issue_identity_for(dir: &Path, target: &str) -> Result<IssuedIdentity, CertificateError> {
    let ip: IpAddr = target
        .trim()
        .parse()
        .map_err(|_| CertificateError::InvalidTarget(target.to_string()))?;
    let root = RootAuthority::load(dir)?;

    info!("Issuing certificate for {} from existing root", ip);

    // Back-date a day so a peer with a slow clock still accepts it.
    let not_before = OffsetDateTime::now_utc() - Duration::days(1);
    let (cert_pem, key_pem) = root.issue_leaf(ip, REMOTE_UNIT, not_before)?;

    let issued = IssuedIdentity {
        cert: dir.join(format!("{ip}.crt")),
        key: dir.join(format!("{ip}.key")),
    };
    write_private(&issued.key, &key_pem)?;
    if let Err(e) = write_public(&issued.cert, &cert_pem) {
        // No key without its certificate.
        let _ = fs::remove_file(&issued.key);
        return Err(e);
    }

    Ok(issued)
}

/// Hex SHA-256 of the first certificate in a PEM blob.
pub fn fingerprint(pem: &str) -> Option<String> {
    let der = rustls_pemfile::certs(&mut pem.as_bytes()).next()?.ok()?;
    let digest = ring::digest::digest(&ring::digest::SHA256, der.as_ref());
    Some(hex::encode(digest.as_ref()))
}

fn name(common_name: &str, unit: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, unit);
    dn
}

fn read_pem(path: &Path) -> Result<String, CertificateError> {
    fs::read_to_string(path).map_err(|source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn write_public(path: &Path, contents: &str) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|source| CertificateError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a private key, owner-only on Unix.
fn write_private(path: &Path, contents: &str) -> Result<(), CertificateError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
        .open(path)
        .and_then(|mut file| file.write_all(contents.as_bytes()))
        .map_err(|source| CertificateError::Write {
            path: path.to_path_buf(),
            source,
        })
}
