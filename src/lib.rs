//! TLS forwarding bridge for a remotely attached Ukey.
//!
//! A Ukey driver only serves TLS on `localhost` of the machine the key is
//! plugged into. This bridge listens on the same port on another machine,
//! presents a certificate for `127.0.0.1` signed by a locally trusted root,
//! and relays every byte to the real driver over a second TLS connection.
//!
//! ## Flow
//!
//! ```text
//! browser --TLS (bridge leaf)--> bridge --TLS (no verification)--> Ukey host
//!         <-------------------- relay, both directions -------------------->
//! ```
//!
//! Certificates live in one directory (`certs` by default):
//!
//! | file | contents |
//! |---|---|
//! | `ca.key` / `ca.crt` | root key and self-signed certificate |
//! | `server.key` / `server.crt` | loopback leaf used by the listener |
//! | `<ip>.key` / `<ip>.crt` | leaves issued with the `issue-cert` tool |
//! | `cert_installed.flag` | present once the root was registered |
//!
//! Host applications embed the bridge with [`spawn_bridge`] and stop it with
//! [`BridgeHandle::shutdown`].

pub mod ca;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod relay;
pub mod sniff;
pub mod trust;

pub use ca::{ensure_server_identity, issue_identity_for, IssuedIdentity, ServerIdentity};
pub use config::{FileSettings, Overrides, Settings};
pub use error::{BridgeError, CertificateError, ConfigError, NetworkError, TrustError};
pub use proxy::{run_bridge, spawn_bridge, Bridge, BridgeConfig, BridgeExit, BridgeHandle};
pub use trust::{ensure_trusted, platform_installer, TrustInstaller, TrustOutcome};
