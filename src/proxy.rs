//! TLS listener that impersonates the local Ukey driver.
//!
//! Accepts browser connections with the loopback server identity, opens a
//! second TLS connection to the real driver on the Ukey host for each one,
//! and hands both streams to the relay.

use crate::ca::{ensure_server_identity, ServerIdentity};
use crate::error::{BridgeError, CertificateError, NetworkError};
use crate::relay::{relay, SHUTDOWN_GRACE};
use crate::trust::{ensure_trusted, platform_installer, TrustInstaller};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for one bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub target_host: String,
    pub target_port: u16,
    pub cert_dir: PathBuf,
    /// Skip OS trust store registration (headless hosts, tests).
    pub skip_trust: bool,
}

/// How a bridge stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    Shutdown,
    /// The listen port was taken; the bridge never started.
    PortInUse(SocketAddr),
}

/// Immutable state shared by every session of one listener.
pub struct BridgeContext {
    tls_acceptor: TlsAcceptor,
    tls_connector: TlsConnector,
    target_host: String,
    target_port: u16,
    server_name: ServerName<'static>,
}

impl BridgeContext {
    /// `host:port` of the real driver.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    async fn connect_upstream(&self) -> Result<TlsStream<TcpStream>, NetworkError> {
        let stream = TcpStream::connect((self.target_host.as_str(), self.target_port))
            .await
            .map_err(|source| self.connect_failed(source))?;
        let _ = stream.set_nodelay(true);

        self.tls_connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|source| self.connect_failed(source))
    }

    fn connect_failed(&self, source: io::Error) -> NetworkError {
        NetworkError::ConnectFailed {
            target: self.target(),
            source,
        }
    }
}

/// Ensure certificates (and, if given, trust), then build the TLS contexts.
///
/// Trust failures are logged and do not stop the bridge; the next startup
/// retries them.
pub fn prepare(
    config: &BridgeConfig,
    installer: Option<&dyn TrustInstaller>,
) -> Result<BridgeContext, BridgeError> {
    let identity = ensure_server_identity(&config.cert_dir)?;

    if let Some(installer) = installer {
        if let Err(e) = ensure_trusted(&config.cert_dir, installer) {
            warn!("Continuing without trust store registration: {}", e);
        }
    }

    let server_name = ServerName::try_from(config.target_host.clone())
        .map_err(|_| NetworkError::InvalidTarget(config.target_host.clone()))?;
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    Ok(BridgeContext {
        tls_acceptor: TlsAcceptor::from(Arc::new(server_config(&identity, provider.clone())?)),
        tls_connector: TlsConnector::from(Arc::new(client_config(provider)?)),
        target_host: config.target_host.clone(),
        target_port: config.target_port,
        server_name,
    })
}

fn server_config(
    identity: &ServerIdentity,
    provider: Arc<CryptoProvider>,
) -> Result<rustls::ServerConfig, CertificateError> {
    let certs = load_certs(&identity.leaf_cert)?;
    let key = load_key(&identity.leaf_key)?;

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

fn client_config(provider: Arc<CryptoProvider>) -> Result<rustls::ClientConfig, CertificateError> {
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoServerVerification(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts whatever certificate the Ukey host presents.
///
/// The driver's certificate is self-signed and the host is fixed by
/// configuration, so there is no chain to validate. Handshake signatures are
/// still checked against the presented key.
#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Bind the listen socket, reporting a taken port separately.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| match source.kind() {
            io::ErrorKind::AddrInUse => NetworkError::BindInUse(addr),
            _ => NetworkError::Bind { addr, source },
        })
}

/// A prepared and bound bridge, ready to serve.
pub struct Bridge {
    listener: TcpListener,
    ctx: Arc<BridgeContext>,
}

impl Bridge {
    /// Prepare certificates and bind, registering trust with the platform
    /// installer unless `skip_trust` is set.
    pub async fn bind(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let installer = (!config.skip_trust).then(platform_installer);
        Self::bind_with(config, installer).await
    }

    pub async fn bind_with(
        config: &BridgeConfig,
        installer: Option<Arc<dyn TrustInstaller>>,
    ) -> Result<Self, BridgeError> {
        // The trust step can block on an interactive system prompt.
        let ctx = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || prepare(&config, installer.as_deref())).await??
        };

        let listener = bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Each session runs on its own task. Sessions still open at shutdown
    /// are aborted, which closes their sockets.
    pub async fn serve(self, shutdown: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(
                "Listening on {} (TLS) -> forwarding to {}",
                addr,
                self.ctx.target()
            ),
            Err(_) => info!("Listening (TLS) -> forwarding to {}", self.ctx.target()),
        }

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    reap_session(joined);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        sessions.spawn(async move {
                            if let Err(e) = handle_session(&ctx, stream, peer).await {
                                error!("Session from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        debug!("Stopping listener, aborting {} session(s)", sessions.len());
        sessions.shutdown().await;
        info!("Bridge stopped");
    }
}

/// Log a session task that panicked or was cancelled. Returns whether it did.
fn reap_session(joined: Result<(), tokio::task::JoinError>) -> bool {
    match joined {
        Ok(()) => false,
        Err(e) => {
            error!("Session task ended abnormally: {}", e);
            true
        }
    }
}

async fn handle_session(
    ctx: &BridgeContext,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), NetworkError> {
    info!("New browser connection from {}", peer);
    let _ = stream.set_nodelay(true);

    let mut client = ctx
        .tls_acceptor
        .accept(stream)
        .await
        .map_err(|source| NetworkError::Handshake {
            peer: peer.to_string(),
            source,
        })?;

    let upstream = match ctx.connect_upstream().await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, client.shutdown()).await;
            return Err(e);
        }
    };
    debug!("Connected to Ukey host {}", ctx.target());

    let outcome = relay(client, upstream).await;
    info!(
        "Connection from {} closed ({} ended first after {} bytes)",
        peer, outcome.direction, outcome.bytes
    );
    Ok(())
}

/// Prepare, bind and serve until `shutdown` is cancelled.
///
/// A taken port is not an error: another bridge or a genuine local driver
/// already answers there, so the bridge stays down quietly.
pub async fn run_bridge(
    config: BridgeConfig,
    shutdown: CancellationToken,
) -> Result<BridgeExit, BridgeError> {
    match Bridge::bind(&config).await {
        Ok(bridge) => {
            bridge.serve(shutdown).await;
            Ok(BridgeExit::Shutdown)
        }
        Err(BridgeError::Network(NetworkError::BindInUse(addr))) => {
            warn!(
                "Port {} is already in use, likely a running bridge or a local Ukey driver; bridge not started",
                addr.port()
            );
            Ok(BridgeExit::PortInUse(addr))
        }
        Err(e) => Err(e),
    }
}

/// Handle to a bridge running in the background.
pub struct BridgeHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<BridgeExit, BridgeError>>,
}

impl BridgeHandle {
    /// Stop accepting, abort open sessions and wait for the bridge to exit.
    pub async fn shutdown(self) -> Result<BridgeExit, BridgeError> {
        self.shutdown.cancel();
        self.task.await?
    }

    /// Wait for the bridge to exit on its own (startup failure or port in use).
    pub async fn join(self) -> Result<BridgeExit, BridgeError> {
        self.task.await?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start the bridge on the current tokio runtime.
pub fn spawn_bridge(config: BridgeConfig) -> BridgeHandle {
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(run_bridge(config, shutdown.clone()));
    BridgeHandle { shutdown, task }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let file = std::fs::File::open(path).map_err(|source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load the TLS private key.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let read_err = |source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(read_err)?;
    let mut reader = std::io::BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(read_err)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => return Err(CertificateError::NoPrivateKey(path.to_path_buf())),
            _ => continue,
        }
    }
}
