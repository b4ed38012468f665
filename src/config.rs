//! Bridge settings.
//!
//! Settings come from the host application's `config.json` and can be
//! overridden on the command line or through the environment.

use crate::error::ConfigError;
use crate::proxy::BridgeConfig;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_CERT_DIR: &str = "certs";

/// The bridge's keys in `config.json`. Other keys belong to the login flow
/// and are ignored.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileSettings {
    pub ukey_proxy_target_ip: Option<String>,
    pub ukey_proxy_target_port: Option<u16>,
    pub enable_local_proxy: Option<bool>,
    pub certificate_directory: Option<PathBuf>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub cert_dir: Option<PathBuf>,
    pub skip_trust: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub target_host: String,
    pub target_port: u16,
    pub cert_dir: PathBuf,
    /// `enable_local_proxy`; absent means enabled.
    pub enabled: bool,
    pub skip_trust: bool,
}

impl Settings {
    /// Merge file and overrides. Empty host and port 0 count as missing.
    pub fn resolve(file: FileSettings, overrides: Overrides) -> Result<Self, ConfigError> {
        let target_host = overrides
            .target_host
            .or(file.ukey_proxy_target_ip)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingTargetHost)?;
        let target_port = overrides
            .target_port
            .or(file.ukey_proxy_target_port)
            .filter(|&p| p != 0)
            .ok_or(ConfigError::MissingTargetPort)?;
        let cert_dir = overrides
            .cert_dir
            .or(file.certificate_directory)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_DIR));

        Ok(Self {
            target_host,
            target_port,
            cert_dir,
            enabled: file.enable_local_proxy.unwrap_or(true),
            skip_trust: overrides.skip_trust,
        })
    }

    /// The browser expects the driver's own port, so the bridge listens on
    /// the target port on all interfaces.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.target_port)),
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            cert_dir: self.cert_dir.clone(),
            skip_trust: self.skip_trust,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "url": "https://portal.example/login",
        "username": "operator",
        "ukey_pin": "000000",
        "enable_local_proxy": true,
        "ukey_proxy_target_ip": "192.168.1.20",
        "ukey_proxy_target_port": 18443
    }"#;

    #[test]
    fn test_parse_ignores_login_keys() {
        let file = FileSettings::parse(SAMPLE).unwrap();
        let settings = Settings::resolve(file, Overrides::default()).unwrap();

        assert_eq!(settings.target_host, "192.168.1.20");
        assert_eq!(settings.target_port, 18443);
        assert_eq!(settings.cert_dir, PathBuf::from(DEFAULT_CERT_DIR));
        assert!(settings.enabled);
    }

    #[test]
    fn test_overrides_win() {
        let file = FileSettings::parse(SAMPLE).unwrap();
        let overrides = Overrides {
            target_host: Some("10.0.0.5".into()),
            target_port: None,
            cert_dir: Some("/var/lib/bridge".into()),
            skip_trust: true,
        };

        let settings = Settings::resolve(file, overrides).unwrap();

        assert_eq!(settings.target_host, "10.0.0.5");
        assert_eq!(settings.target_port, 18443);
        assert_eq!(settings.cert_dir, PathBuf::from("/var/lib/bridge"));
        assert!(settings.skip_trust);
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let no_host = FileSettings {
            ukey_proxy_target_ip: Some("  ".into()),
            ukey_proxy_target_port: Some(18443),
            ..Default::default()
        };
        assert!(matches!(
            Settings::resolve(no_host, Overrides::default()),
            Err(ConfigError::MissingTargetHost)
        ));

        let no_port = FileSettings {
            ukey_proxy_target_ip: Some("10.0.0.5".into()),
            ukey_proxy_target_port: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Settings::resolve(no_port, Overrides::default()),
            Err(ConfigError::MissingTargetPort)
        ));
    }

    #[test]
    fn test_bridge_listens_on_target_port() {
        let file = FileSettings::parse(SAMPLE).unwrap();
        let config = Settings::resolve(file, Overrides::default())
            .unwrap()
            .bridge_config();

        assert_eq!(config.listen_addr, "0.0.0.0:18443".parse().unwrap());
        assert_eq!(config.target_port, 18443);
    }

    #[test]
    fn test_disabled_flag() {
        let file = FileSettings::parse(
            r#"{"enable_local_proxy": false, "ukey_proxy_target_ip": "10.0.0.5", "ukey_proxy_target_port": 1}"#,
        )
        .unwrap();
        assert!(!Settings::resolve(file, Overrides::default()).unwrap().enabled);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.json");
        assert!(matches!(
            FileSettings::load(&missing),
            Err(ConfigError::NotFound(_))
        ));

        std::fs::write(&missing, "{ not json").unwrap();
        assert!(matches!(
            FileSettings::load(&missing),
            Err(ConfigError::Parse { .. })
        ));
    }
}
