//! Certificate reloader
//!
//! Keeps a [`Cache`] in step with the configured directories. Two loops run
//! while the reloader is running:
//!
//! - the watch loop rescans every directory on a timer and turns
//!   create/write notifications into queued reload requests
//! - the queue loop reloads one queued pair at a time
//!
//! Both share one cancellation token. When either loop exits the token is
//! cancelled, both are awaited, and their errors are returned together.

use crate::cache::Cache;
use crate::cert::load_directory_certs;
use crate::config::ReloaderConfig;
use crate::error::{CertError, ReloaderError};
use crate::file::pair_name;
use crate::queue::DedupQueue;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Smallest reload queue, used when few certificates are loaded at startup.
pub const MIN_QUEUE_CAPACITY: usize = 32;

type WatchEvent = notify::Result<notify::Event>;

struct WatchSource {
    _watcher: Mutex<RecommendedWatcher>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchEvent>>,
    #[cfg(test)]
    sender: mpsc::UnboundedSender<WatchEvent>,
}

impl WatchSource {
    fn register(dirs: &[PathBuf]) -> Result<Self, ReloaderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        #[cfg(test)]
        let sender = tx.clone();
        let mut watcher = notify::recommended_watcher(move |event: WatchEvent| {
            let _ = tx.send(event);
        })?;
        for dir in dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        Ok(Self {
            _watcher: Mutex::new(watcher),
            events: tokio::sync::Mutex::new(rx),
            #[cfg(test)]
            sender,
        })
    }
}

struct RunHandle {
    cancel: CancellationToken,
    stopped: watch::Receiver<bool>,
}

struct Shared {
    dirs: Vec<PathBuf>,
    reload_interval: Duration,
    span: Option<tracing::Span>,
    cache: Arc<Cache>,
    queue: DedupQueue<String>,
    watch: Option<WatchSource>,
    running: AtomicBool,
    run_state: Mutex<Option<RunHandle>>,
}

/// Keeps certificates loaded from watched directories and answers
/// per-handshake certificate lookups.
///
/// Cloning is cheap; clones share the same cache and run state.
#[derive(Clone)]
pub struct Reloader {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Reloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloader")
            .field("dirs", &self.shared.dirs)
            .field("reload_interval", &self.shared.reload_interval)
            .field("watch", &self.shared.watch.is_some())
            .field("running", &self.is_running())
            .field("cache", &self.shared.cache)
            .finish()
    }
}

impl Reloader {
    /// Validate `config`, register directory watches and load every
    /// certificate pair currently on disk.
    pub fn new(config: ReloaderConfig) -> Result<Self, ReloaderError> {
        let config = config.validate()?;

        let watch = if config.watch {
            Some(WatchSource::register(&config.dirs)?)
        } else {
            None
        };

        let cache = Arc::new(Cache::new());
        load_all(&cache, &config.dirs, &CancellationToken::new())
            .map_err(ReloaderError::InitialLoad)?;
        let queue = DedupQueue::new(initial_queue_capacity(cache.len()));

        tracing::debug!(
            dirs = ?config.dirs,
            certificates = cache.len(),
            queue_capacity = queue.capacity(),
            "Initialized certificate reloader"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                dirs: config.dirs,
                reload_interval: config.reload_interval,
                span: config.span,
                cache,
                queue,
                watch,
                running: AtomicBool::new(false),
                run_state: Mutex::new(None),
            }),
        })
    }

    /// Shared certificate cache
    pub fn cache(&self) -> Arc<Cache> {
        Arc::clone(&self.shared.cache)
    }

    /// Normalized directory list
    pub fn dirs(&self) -> &[PathBuf] {
        &self.shared.dirs
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Certificate material for `server_name`, with wildcard fallback.
    pub fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ReloaderError> {
        self.shared
            .cache
            .get_sni(server_name)
            .map(|cert| cert.certified_key())
            .ok_or_else(|| ReloaderError::NoCertificate(server_name.to_string()))
    }

    /// Run the watch and queue loops until `parent` is cancelled, [`stop`]
    /// is called, or either loop fails.
    ///
    /// Returns [`ReloaderError::AlreadyRunning`] if another run is active.
    /// A cancelled run returns an error for which
    /// [`ReloaderError::is_cancelled`] is true.
    ///
    /// [`stop`]: Reloader::stop
    pub async fn run(&self, parent: &CancellationToken) -> Result<(), ReloaderError> {
        let span = self
            .shared
            .span
            .clone()
            .unwrap_or_else(|| tracing::info_span!("cert_reloader"));
        self.run_inner(parent).instrument(span).await
    }

    /// Spawn [`Reloader::run`] onto the current runtime.
    pub fn start(&self, parent: CancellationToken) -> JoinHandle<Result<(), ReloaderError>> {
        let reloader = self.clone();
        tokio::spawn(async move { reloader.run(&parent).await })
    }

    /// Cancel the active run and wait until it has fully stopped.
    pub async fn stop(&self) {
        let handle = {
            let state = self.shared.run_state.lock();
            state
                .as_ref()
                .map(|handle| (handle.cancel.clone(), handle.stopped.clone()))
        };
        let Some((cancel, mut stopped)) = handle else {
            return;
        };
        cancel.cancel();
        let _ = stopped.wait_for(|done| *done).await;
    }

    async fn run_inner(&self, parent: &CancellationToken) -> Result<(), ReloaderError> {
        let guard = self.begin_run(parent)?;
        let cancel = guard.cancel.clone();

        tracing::info!(dirs = ?self.shared.dirs, "Running certificate reloader");

        let span = tracing::Span::current();
        let mut watch_task = tokio::spawn(
            Arc::clone(&self.shared)
                .watch_loop(cancel.clone())
                .instrument(span.clone()),
        );
        let mut queue_task = tokio::spawn(
            Arc::clone(&self.shared)
                .process_queue(cancel.clone())
                .instrument(span),
        );
        let _abort = AbortOnDrop([watch_task.abort_handle(), queue_task.abort_handle()]);

        let (first, second) = tokio::select! {
            result = &mut watch_task => {
                tracing::info!("Stopping certificate reloader");
                cancel.cancel();
                (task_result(result), task_result(queue_task.await))
            }
            result = &mut queue_task => {
                tracing::info!("Stopping certificate reloader");
                cancel.cancel();
                (task_result(result), task_result(watch_task.await))
            }
        };

        drop(guard);
        tracing::info!("Certificate reloader stopped");
        ReloaderError::join(first, second)
    }

    fn begin_run(&self, parent: &CancellationToken) -> Result<RunGuard<'_>, ReloaderError> {
        if self.shared.running.load(Ordering::Acquire) {
            return Err(ReloaderError::AlreadyRunning);
        }
        let mut state = self.shared.run_state.lock();
        if self.shared.running.load(Ordering::Acquire) {
            return Err(ReloaderError::AlreadyRunning);
        }
        self.shared.running.store(true, Ordering::Release);

        let cancel = parent.child_token();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        *state = Some(RunHandle {
            cancel: cancel.clone(),
            stopped: stopped_rx,
        });

        Ok(RunGuard {
            shared: &self.shared,
            cancel,
            stopped: stopped_tx,
        })
    }
}

/// Marks the reloader stopped when a run ends, including when the run
/// future is dropped before completing.
struct RunGuard<'a> {
    shared: &'a Shared,
    cancel: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        {
            let mut state = self.shared.run_state.lock();
            *state = None;
            self.shared.running.store(false, Ordering::Release);
        }
        let _ = self.stopped.send(true);
    }
}

/// Aborts both loops if the run future is dropped before they finish.
struct AbortOnDrop([AbortHandle; 2]);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

impl Shared {
    async fn watch_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ReloaderError> {
        let first_tick = Instant::now().checked_add(self.reload_interval);
        let mut ticker = match first_tick {
            _ if self.reload_interval.is_zero() => {
                tracing::warn!("Reload on interval disabled, relying on file watch only");
                None
            }
            None => {
                tracing::warn!(
                    interval_secs = self.reload_interval.as_secs_f64(),
                    "Reload interval out of range, relying on file watch only"
                );
                None
            }
            Some(start) => {
                tracing::info!(
                    interval_secs = self.reload_interval.as_secs_f64(),
                    "Using reload interval"
                );
                let mut ticker = tokio::time::interval_at(start, self.reload_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(ticker)
            }
        };

        let mut events = match &self.watch {
            Some(source) => {
                tracing::info!("File watch is configured");
                Some(source.events.lock().await)
            }
            None => {
                tracing::info!("File watch is not configured");
                None
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReloaderError::Cancelled),
                _ = next_tick(&mut ticker) => self.rescan(&cancel).await,
                event = next_event(&mut events) => match event {
                    None => return Ok(()),
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "File watcher error");
                    }
                },
            }
        }
    }

    async fn process_queue(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ReloaderError> {
        loop {
            let Some(name) = self.queue.poll(&cancel).await? else {
                return Ok(());
            };
            tracing::debug!(name = %name, "Processing certificate reload");

            let shared = Arc::clone(&self);
            let reload_name = name.clone();
            let result = tokio::task::spawn_blocking(move || shared.cache.reload(&reload_name)).await;
            match result {
                Ok(Ok(existed)) => {
                    tracing::debug!(name = %name, existed, "Reloaded certificate pair");
                    self.grow_queue_if_needed();
                }
                Ok(Err(e)) => {
                    tracing::error!(name = %name, error = %e, "Error reloading certificate pair");
                }
                Err(e) => {
                    tracing::error!(name = %name, error = %e, "Certificate reload task failed");
                }
            }
        }
    }

    /// Full rescan of every directory. Pending incremental requests are
    /// dropped first since the rescan covers them.
    async fn rescan(self: &Arc<Self>, cancel: &CancellationToken) {
        tracing::debug!("Reloading all certificates");
        self.queue.empty();

        let shared = Arc::clone(self);
        let scan_cancel = cancel.clone();
        let result =
            tokio::task::spawn_blocking(move || load_all(&shared.cache, &shared.dirs, &scan_cancel))
                .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(failures)) => {
                for (dir, e) in failures {
                    if !matches!(e, CertError::Cancelled) {
                        tracing::error!(dir = %dir.display(), error = %e, "Reload all error");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Certificate rescan task failed");
            }
        }

        self.grow_queue_if_needed();
    }

    fn handle_event(&self, event: notify::Event) {
        if !is_write_event(&event.kind) {
            return;
        }
        for path in &event.paths {
            let Some(name) = pair_name(path) else {
                continue;
            };
            if self.queue.push(name.clone()) {
                tracing::debug!(name = %name, "Queued certificate reload");
            } else {
                tracing::debug!(name = %name, "Certificate reload already queued or queue full");
            }
        }
    }

    fn grow_queue_if_needed(&self) {
        let certificates = self.cache.len();
        let capacity = self.queue.capacity();
        if needs_growth(certificates, capacity) {
            tracing::debug!(certificates, capacity, "Resizing reload queue");
            self.queue
                .expand(capacity.saturating_mul(2).max(MIN_QUEUE_CAPACITY));
        }
    }
}

impl ResolvesServerCert for Reloader {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            tracing::debug!("No SNI hostname in TLS handshake");
            return None;
        };
        match self.get_certificate(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!(hostname = %server_name, error = %e, "SNI certificate lookup failed");
                None
            }
        }
    }
}

/// Load every directory into `cache`, continuing past failed directories.
fn load_all(
    cache: &Cache,
    dirs: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<(), Vec<(PathBuf, CertError)>> {
    let mut failures = Vec::new();
    for dir in dirs {
        if cancel.is_cancelled() {
            failures.push((dir.clone(), CertError::Cancelled));
            break;
        }
        tracing::debug!(dir = %dir.display(), "Loading certificates for directory");
        match load_directory_certs(dir, cancel) {
            Ok(certs) => cache.set(certs),
            Err(e) => failures.push((dir.clone(), e)),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

fn initial_queue_capacity(certificates: usize) -> usize {
    certificates.saturating_mul(3).max(MIN_QUEUE_CAPACITY)
}

/// Grow once the cache holds two thirds of the queue's capacity.
fn needs_growth(certificates: usize, capacity: usize) -> bool {
    certificates.saturating_mul(3) >= capacity.saturating_mul(2)
}

fn is_write_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_event(
    events: &mut Option<tokio::sync::MutexGuard<'_, mpsc::UnboundedReceiver<WatchEvent>>>,
) -> Option<WatchEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn task_result(
    result: Result<Result<(), ReloaderError>, tokio::task::JoinError>,
) -> Result<(), ReloaderError> {
    result.unwrap_or_else(|e| Err(ReloaderError::TaskFailed(e.to_string())))
}
