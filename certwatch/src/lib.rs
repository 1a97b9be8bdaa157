//! Hot-reloading TLS certificates from watched directories
//!
//! Certificates live on disk as `<name>.crt`/`<name>.key` pairs. A
//! [`Reloader`] loads every pair under its configured directories, indexes
//! them by DNS name, and keeps the index current from filesystem
//! notifications and a periodic rescan. It implements rustls'
//! [`ResolvesServerCert`](rustls::server::ResolvesServerCert), so a server
//! picks up rotated certificates without restarting.
//!
//! ```rust,ignore
//! use certwatch::{Reloader, ReloaderConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let reloader = Reloader::new(
//!     ReloaderConfig::default()
//!         .with_dir("/etc/tls")
//!         .with_watch(true),
//! )?;
//! let shutdown = CancellationToken::new();
//! let task = reloader.start(shutdown.clone());
//!
//! let tls = rustls::ServerConfig::builder()
//!     .with_no_client_auth()
//!     .with_cert_resolver(std::sync::Arc::new(reloader.clone()));
//! ```

mod cache;
mod cert;
mod config;
mod error;
mod file;
mod queue;
mod reloader;

#[cfg(test)]
mod testutil;

pub use cache::Cache;
pub use cert::{Cert, LeafInfo, load_cert_pair, load_directory_certs};
pub use config::{DEFAULT_RELOAD_INTERVAL, ReloaderConfig, remove_subdirectories};
pub use error::{CertError, QueueError, ReloaderError};
pub use file::{
    CERT_EXTENSION, CertFile, FileKind, KEY_EXTENSION, pair_name, pair_name_and_kind, pair_path,
    wildcard_for,
};
pub use queue::DedupQueue;
pub use reloader::{MIN_QUEUE_CAPACITY, Reloader};
