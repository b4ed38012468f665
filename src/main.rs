//! Ukey bridge binary.
//!
//! Run with:
//! ```bash
//! ukey-bridge --config config.json
//! ukey-bridge --target-host 192.168.1.20 --target-port 18443
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ukey_bridge::logging::init_logging;
use ukey_bridge::{run_bridge, BridgeExit, ConfigError, FileSettings, Overrides, Settings};

#[derive(Parser, Debug)]
#[command(name = "ukey-bridge")]
#[command(about = "Forward a remote Ukey driver to this machine over TLS")]
struct Args {
    /// Host application config file (reads the ukey_proxy_* keys)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Ukey host address, overrides ukey_proxy_target_ip
    #[arg(long, env = "UKEY_TARGET_HOST")]
    target_host: Option<String>,

    /// Ukey driver port, overrides ukey_proxy_target_port; also the local port
    #[arg(long, env = "UKEY_TARGET_PORT")]
    target_port: Option<u16>,

    /// Directory for the root and server certificates
    #[arg(long, env = "UKEY_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Log file, appended to
    #[arg(long, default_value = "run_log.txt")]
    log_file: PathBuf,

    /// Do not register the root certificate with the OS trust store
    #[arg(long)]
    skip_trust: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            target_host: self.target_host.clone(),
            target_port: self.target_port,
            cert_dir: self.cert_dir.clone(),
            skip_trust: self.skip_trust,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let _guard = init_logging(Some(&args.log_file))?;

    let file = match FileSettings::load(&args.config) {
        Ok(file) => file,
        Err(ConfigError::NotFound(path)) => {
            warn!("{} not found, using command line settings only", path.display());
            FileSettings::default()
        }
        Err(e) => {
            error!("{}; bridge not started", e);
            return Ok(());
        }
    };

    // Configuration problems stop the bridge, not the caller.
    let settings = match Settings::resolve(file, args.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}; bridge not started", e);
            return Ok(());
        }
    };
    if !settings.enabled {
        info!("enable_local_proxy is false; bridge not started");
        return Ok(());
    }

    info!("Starting Ukey bridge");
    info!("  Target: {}:{}", settings.target_host, settings.target_port);
    info!("  Certificates: {}", settings.cert_dir.display());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
        }
    });

    match run_bridge(settings.bridge_config(), shutdown).await {
        Ok(BridgeExit::Shutdown) | Ok(BridgeExit::PortInUse(_)) => {}
        Err(e) => error!("Bridge failed: {}", e),
    }

    Ok(())
}
