//! Error types for the bridge.
//!
//! Startup failures (configuration, certificates) abort only the bridge.
//! Session failures are logged by the listener and never leave the session.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Missing or malformed settings. The bridge declines to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("ukey_proxy_target_ip is not configured")]
    MissingTargetHost,
    #[error("ukey_proxy_target_port is not configured")]
    MissingTargetPort,
}

/// Certificate generation, loading or issuance failed.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("root certificate or key missing in {0}; run the base initialization first")]
    MissingRoot(PathBuf),
    #[error("target must be an IP address, got {0:?}")]
    InvalidTarget(String),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS material: {0}")]
    Tls(#[from] rustls::Error),
}

/// Registering the root certificate with the OS trust store failed.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("root certificate not found at {0}")]
    MissingCertificate(PathBuf),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {output}")]
    Rejected {
        program: &'static str,
        status: std::process::ExitStatus,
        output: String,
    },
    #[error("failed to write trust flag {path}: {source}")]
    Flag {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The per-user trust store lives under a home directory that could not
    /// be resolved.
    #[error("cannot locate the user's home directory")]
    NoHomeDirectory,
}

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Another bridge instance or a local Ukey driver already owns the port.
    #[error("address {0} is already in use")]
    BindInUse(SocketAddr),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to Ukey host {target}: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid target host {0:?}")]
    InvalidTarget(String),
}

/// Anything that stops the bridge from starting.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("bridge task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
