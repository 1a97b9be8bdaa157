//! Loaded certificate pairs

use crate::error::CertError;
use crate::file::{CertFile, FileKind, pair_name, pair_path};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::*;

/// Routing metadata parsed from the leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    /// Subject-Alternative-Name DNS entries
    pub dns_names: Vec<String>,
    /// Subject Common Name, if present and non-empty
    pub common_name: Option<String>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl LeafInfo {
    fn parse(der: &CertificateDer<'_>) -> Result<Self, String> {
        let (_, x509) = X509Certificate::from_der(der.as_ref()).map_err(|e| e.to_string())?;

        let mut dns_names = Vec::new();
        if let Ok(Some(san)) = x509.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    dns_names.push(dns.to_string());
                }
            }
        }

        let common_name = x509
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .filter(|cn| !cn.is_empty())
            .map(str::to_string);

        let validity = x509.validity();
        Ok(Self {
            dns_names,
            common_name,
            not_before: system_time_from_unix(validity.not_before.timestamp()),
            not_after: system_time_from_unix(validity.not_after.timestamp()),
        })
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

fn system_time_from_unix(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(timestamp.unsigned_abs())
    }
}

/// A certificate chain and private key loaded from a `<name>.crt`/`<name>.key` pair
#[derive(Clone)]
pub struct Cert {
    name: String,
    cert_file: CertFile,
    key_file: CertFile,
    loaded: SystemTime,
    key: Arc<CertifiedKey>,
    leaf: OnceLock<LeafInfo>,
}

impl std::fmt::Debug for Cert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cert")
            .field("name", &self.name)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("loaded", &self.loaded)
            .field("chain_len", &self.key.cert.len())
            .finish()
    }
}

impl Cert {
    /// Wrap already-built certificate material under `name`.
    ///
    /// The file records point at the conventional pair paths with an epoch
    /// modification time, so the next [`Cert::reload`] reads from disk.
    pub fn from_certified_key(name: impl Into<String>, key: Arc<CertifiedKey>) -> Self {
        let name = name.into();
        Self {
            cert_file: CertFile::new(pair_path(&name, FileKind::Cert), UNIX_EPOCH),
            key_file: CertFile::new(pair_path(&name, FileKind::Key), UNIX_EPOCH),
            name,
            loaded: UNIX_EPOCH,
            key,
            leaf: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// When this certificate was read from disk
    pub fn loaded(&self) -> SystemTime {
        self.loaded
    }

    pub fn file(&self, kind: FileKind) -> &CertFile {
        match kind {
            FileKind::Cert => &self.cert_file,
            FileKind::Key => &self.key_file,
        }
    }

    pub(crate) fn file_mut(&mut self, kind: FileKind) -> &mut CertFile {
        match kind {
            FileKind::Cert => &mut self.cert_file,
            FileKind::Key => &mut self.key_file,
        }
    }

    /// Certificate material handed to rustls during the handshake
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.key)
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.key.cert
    }

    /// Parsed leaf metadata, parsed on first use.
    pub fn leaf(&self) -> Option<&LeafInfo> {
        if let Some(leaf) = self.leaf.get() {
            return Some(leaf);
        }
        let der = self.key.cert.first()?;
        match LeafInfo::parse(der) {
            Ok(info) => Some(self.leaf.get_or_init(|| info)),
            Err(e) => {
                tracing::debug!(name = %self.name, error = %e, "Failed to parse leaf certificate");
                None
            }
        }
    }

    /// DNS names this certificate answers for: the leaf's SAN DNS entries
    /// followed by its Common Name. Empty when the chain is empty or the
    /// leaf cannot be parsed.
    pub fn dns_names(&self) -> Vec<String> {
        let Some(leaf) = self.leaf() else {
            return Vec::new();
        };
        let mut names = leaf.dns_names.clone();
        if let Some(cn) = &leaf.common_name {
            names.push(cn.clone());
        }
        names
    }

    /// Re-read the pair from disk if either file changed since it was loaded.
    ///
    /// Returns `Ok(false)` without touching `self` when nothing changed.
    pub fn reload(&mut self) -> Result<bool, CertError> {
        match load_cert_pair(&self.name, Some(self.loaded))? {
            Some(fresh) => {
                *self = fresh;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Load the pair `<name>.crt`/`<name>.key`.
///
/// With a `cutoff`, returns `Ok(None)` when neither file was modified after
/// it. The leaf must be inside its validity window and must match the key.
pub fn load_cert_pair(name: &str, cutoff: Option<SystemTime>) -> Result<Option<Cert>, CertError> {
    let cert_path = pair_path(name, FileKind::Cert);
    let key_path = pair_path(name, FileKind::Key);

    let cert_modified = modified_time(&cert_path)?;
    let key_modified = modified_time(&key_path)?;

    if let Some(cutoff) = cutoff
        && cert_modified <= cutoff
        && key_modified <= cutoff
    {
        return Ok(None);
    }

    let chain = read_chain(&cert_path)?;
    let leaf = LeafInfo::parse(&chain[0]).map_err(|reason| CertError::Parse {
        path: cert_path.clone(),
        reason,
    })?;

    let now = SystemTime::now();
    if now < leaf.not_before {
        return Err(CertError::NotYetValid(name.to_string()));
    }
    if now > leaf.not_after {
        return Err(CertError::Expired(name.to_string()));
    }

    let private_key = read_private_key(&key_path)?;
    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&private_key).map_err(|e| {
            CertError::UnsupportedKey {
                path: key_path.clone(),
                reason: e.to_string(),
            }
        })?;
    let key = CertifiedKey::new(chain, signing_key);

    match key.keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(e) => {
            return Err(CertError::KeyMismatch {
                name: name.to_string(),
                reason: e.to_string(),
            });
        }
    }

    Ok(Some(Cert {
        name: name.to_string(),
        cert_file: CertFile::new(cert_path, cert_modified),
        key_file: CertFile::new(key_path, key_modified),
        loaded: SystemTime::now(),
        key: Arc::new(key),
        leaf: OnceLock::from(leaf),
    }))
}

fn modified_time(path: &Path) -> Result<SystemTime, CertError> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| CertError::io(path, e))
}

fn read_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let file = File::open(path).map_err(|e| CertError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if chain.is_empty() {
        return Err(CertError::NoCertificates(path.to_path_buf()));
    }
    Ok(chain)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let file = File::open(path).map_err(|e| CertError::io(path, e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.to_path_buf()))
}

/// Load every certificate pair found under `dir`, descending into
/// subdirectories.
///
/// A pair that fails to load is logged and skipped. A missing directory
/// yields no certificates.
pub fn load_directory_certs(dir: &Path, cancel: &CancellationToken) -> Result<Vec<Cert>, CertError> {
    let names = collect_pair_names(dir, cancel)?;

    let mut certs = Vec::with_capacity(names.len());
    for name in names {
        if cancel.is_cancelled() {
            return Err(CertError::Cancelled);
        }
        match load_cert_pair(&name, None) {
            Ok(Some(cert)) => certs.push(cert),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "Skipping certificate pair");
            }
        }
    }
    Ok(certs)
}

fn collect_pair_names(dir: &Path, cancel: &CancellationToken) -> Result<BTreeSet<String>, CertError> {
    let mut names = BTreeSet::new();
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CertError::io(&current, e)),
        };

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(CertError::Cancelled);
            }
            let entry = entry.map_err(|e| CertError::io(&current, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| CertError::io(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if let Some(name) = pair_name(&path) {
                names.insert(name);
            }
        }
    }

    Ok(names)
}
