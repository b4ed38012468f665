//! Issue a leaf certificate for a remote address from the existing root.
//!
//! Run with:
//! ```bash
//! issue-cert --cert-dir certs --target 58.220.240.50
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use ukey_bridge::issue_identity_for;
use ukey_bridge::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "issue-cert")]
#[command(about = "Sign a certificate for a remote IP with the bridge's root")]
struct Args {
    /// Directory holding ca.key and ca.crt
    #[arg(long, env = "UKEY_CERT_DIR", default_value = "certs")]
    cert_dir: PathBuf,

    /// IP address the certificate is issued for
    #[arg(short, long)]
    target: String,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let _guard = init_logging(None)?;

    let issued = issue_identity_for(&args.cert_dir, &args.target)
        .with_context(|| format!("Failed to issue certificate for {}", args.target))?;

    info!("Certificate: {}", issued.cert.display());
    info!("Private key: {}", issued.key.display());
    Ok(())
}
