use certwatch::{DEFAULT_RELOAD_INTERVAL, Reloader, ReloaderConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const RESPONSE_BODY: &str = "hello world\n";

/// HTTPS server backed by hot-reloaded certificate directories
#[derive(Parser, Debug)]
#[command(name = "certwatch-server")]
#[command(version)]
#[command(about = "Serve HTTPS with certificates reloaded from watched directories")]
pub struct Args {
    /// Directory holding `<name>.crt`/`<name>.key` pairs (repeatable)
    #[arg(long = "dir", required = true, env = "CERTWATCH_DIRS", value_delimiter = ',')]
    pub dirs: Vec<PathBuf>,

    /// Seconds between full rescans; 0 disables the rescan
    #[arg(long, default_value_t = DEFAULT_RELOAD_INTERVAL.as_secs())]
    pub reload_interval_secs: u64,

    /// Watch the directories for changes
    #[arg(long)]
    pub watch: bool,

    /// Address to accept TLS connections on
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub listen: SocketAddr,
}

impl Args {
    fn reloader_config(&self) -> ReloaderConfig {
        ReloaderConfig::default()
            .with_dirs(self.dirs.iter().cloned())
            .with_reload_interval(Duration::from_secs(self.reload_interval_secs))
            .with_watch(self.watch)
    }
}

fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    tracing::info!("certwatch-server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Listen address: {}", args.listen);

    let reloader = Reloader::new(args.reloader_config())?;
    tracing::info!(
        certificates = reloader.cache().len(),
        dirs = ?reloader.dirs(),
        "Loaded certificates"
    );

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(reloader.clone()));
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let shutdown = CancellationToken::new();
    let reloader_task = reloader.start(shutdown.clone());

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!("Accepting connections on {}", listener.local_addr()?);

    tokio::select! {
        _ = accept_loop(listener, acceptor, shutdown.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    shutdown.cancel();
    reloader.stop().await;
    match reloader_task.await {
        Ok(Err(e)) if !e.is_cancelled() => {
            tracing::error!(error = %e, "Certificate reloader failed");
        }
        Err(e) => {
            tracing::error!(error = %e, "Certificate reloader task panicked");
        }
        _ => {}
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(acceptor, stream).await {
                tracing::debug!(peer = %peer, error = %e, "Connection failed");
            }
        });
    }
}

async fn serve_connection(acceptor: TlsAcceptor, stream: TcpStream) -> std::io::Result<()> {
    let mut tls = acceptor.accept(stream).await?;

    let (_, connection) = tls.get_ref();
    if let Some(host) = connection.server_name() {
        tracing::debug!(hostname = %host, "TLS handshake complete");
    }

    // Single request per connection; the body is ignored.
    let mut request = [0u8; 4096];
    let _ = tls.read(&mut request).await?;

    tls.write_all(http_response(RESPONSE_BODY).as_bytes()).await?;
    tls.shutdown().await
}

fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}
