//! Certificate pair file naming
//!
//! A certificate pair is two files sharing a stem: `<name>.crt` holds the
//! PEM chain and `<name>.key` holds the PEM private key. The pair's name is
//! that shared stem, including its directory, so it can always be turned
//! back into the two file paths.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const CERT_EXTENSION: &str = "crt";
pub const KEY_EXTENSION: &str = "key";

/// Which half of a certificate pair a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Cert,
    Key,
}

impl FileKind {
    /// Map a file extension (without the dot) to a pair half.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            CERT_EXTENSION => Some(Self::Cert),
            KEY_EXTENSION => Some(Self::Key),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Cert => CERT_EXTENSION,
            Self::Key => KEY_EXTENSION,
        }
    }
}

/// One file of a pair, with the modification time seen when it was loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl CertFile {
    pub fn new(path: impl Into<PathBuf>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            modified,
        }
    }
}

/// Split a path into its pair name and kind.
///
/// Returns `None` for any extension other than `.crt` or `.key`, and for
/// paths that are not valid UTF-8.
pub fn pair_name_and_kind(path: impl AsRef<Path>) -> Option<(String, FileKind)> {
    let path = path.as_ref();
    let kind = FileKind::from_extension(path.extension()?.to_str()?)?;
    let name = path.with_extension("");
    let name = name.to_str()?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), kind))
}

/// Pair name for a path, ignoring which half it is.
pub fn pair_name(path: impl AsRef<Path>) -> Option<String> {
    pair_name_and_kind(path).map(|(name, _)| name)
}

/// Path of one half of the pair called `name`.
pub fn pair_path(name: &str, kind: FileKind) -> PathBuf {
    PathBuf::from(format!("{}.{}", name, kind.extension()))
}

/// Wildcard pattern covering `host`: `api.example.com` -> `*.example.com`.
///
/// Only hosts with at least three labels get a pattern, so a registrable
/// domain such as `example.com` never falls back to `*.com`.
pub fn wildcard_for(host: &str) -> Option<String> {
    let dot = host.find('.')?;
    let parent = &host[dot + 1..];
    if dot == 0 || !parent.contains('.') || parent.starts_with('.') {
        return None;
    }
    Some(format!("*.{}", parent))
}
