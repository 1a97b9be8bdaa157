//! Certificate cache indexed by pair name and by DNS name
//!
//! Writers serialize on a mutex. The DNS-name index used on the handshake
//! path is an immutable map behind an [`ArcSwap`]: every write builds a new
//! map and publishes it with one pointer swap, so readers never lock and
//! never see a half-built index.

use crate::cert::{Cert, load_cert_pair};
use crate::error::CertError;
use crate::file::{pair_name_and_kind, wildcard_for};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

type SniIndex = HashMap<String, Arc<Cert>>;

#[derive(Default)]
struct State {
    /// Source of truth, keyed by pair name
    by_name: HashMap<String, Arc<Cert>>,
    /// Names whose files were reported modified, drained by `pop_modified`
    dirty: HashMap<String, Arc<Cert>>,
}

/// Name- and SNI-indexed store of loaded certificates
pub struct Cache {
    state: Mutex<State>,
    sni: ArcSwap<SniIndex>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("certificates", &self.len())
            .field("dns_names", &self.sni.load().len())
            .finish()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            sni: ArcSwap::from_pointee(SniIndex::new()),
        }
    }

    /// Number of certificates tracked by name
    pub fn len(&self) -> usize {
        self.state.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Exact lookup by pair name
    pub fn get(&self, name: &str) -> Option<Arc<Cert>> {
        self.state.lock().by_name.get(name).cloned()
    }

    /// Lookup by DNS name, falling back to the wildcard one level up.
    pub fn get_sni(&self, dns_name: &str) -> Option<Arc<Cert>> {
        let dns_name = dns_name.to_ascii_lowercase();
        let sni = self.sni.load();
        if let Some(cert) = sni.get(&dns_name) {
            return Some(Arc::clone(cert));
        }
        let wildcard = wildcard_for(&dns_name)?;
        sni.get(&wildcard).cloned()
    }

    /// Store certificates and publish a new DNS-name index that includes
    /// their names.
    pub fn set<I>(&self, certs: I)
    where
        I: IntoIterator<Item = Cert>,
    {
        let certs: Vec<Arc<Cert>> = certs.into_iter().map(Arc::new).collect();
        if certs.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        self.publish(&mut state, certs);
    }

    fn publish(&self, state: &mut State, certs: Vec<Arc<Cert>>) {
        let mut sni: SniIndex = self.sni.load().as_ref().clone();
        for cert in certs {
            let dns_names = cert.dns_names();
            tracing::debug!(name = %cert.name(), dns_names = ?dns_names, "Caching certificate");
            for dns_name in dns_names {
                sni.insert(dns_name.to_ascii_lowercase(), Arc::clone(&cert));
            }
            state.by_name.insert(cert.name().to_string(), cert);
        }
        self.sni.store(Arc::new(sni));
    }

    /// Reload `name` from disk.
    ///
    /// A tracked certificate is re-read only if its files changed since it
    /// was loaded; an unknown name is loaded unconditionally. Returns whether
    /// the name was already tracked. On error the cached certificate, if
    /// any, stays in place.
    pub fn reload(&self, name: &str) -> Result<bool, CertError> {
        let mut state = self.state.lock();
        match state.by_name.get(name) {
            Some(existing) => {
                let mut cert = Cert::clone(existing);
                if cert.reload()? {
                    self.publish(&mut state, vec![Arc::new(cert)]);
                }
                Ok(true)
            }
            None => {
                if let Some(cert) = load_cert_pair(name, None)? {
                    self.publish(&mut state, vec![Arc::new(cert)]);
                }
                Ok(false)
            }
        }
    }

    /// Record that `path` changed at `modified`.
    ///
    /// Only affects bookkeeping for observers; the served certificate is
    /// untouched. Paths that are not part of a tracked pair are ignored.
    pub fn set_modified(&self, path: impl AsRef<Path>, modified: SystemTime) {
        let Some((name, kind)) = pair_name_and_kind(path) else {
            return;
        };
        let mut state = self.state.lock();
        let Some(existing) = state.by_name.get(&name) else {
            return;
        };
        let mut cert = Cert::clone(existing);
        cert.file_mut(kind).modified = modified;
        let cert = Arc::new(cert);
        state.by_name.insert(name.clone(), Arc::clone(&cert));
        state.dirty.insert(name, cert);
    }

    /// Drain the names recorded by [`Cache::set_modified`].
    pub fn pop_modified(&self) -> Vec<String> {
        let dirty = std::mem::take(&mut self.state.lock().dirty);
        let mut names: Vec<_> = dirty.into_keys().collect();
        names.sort();
        names
    }
}
