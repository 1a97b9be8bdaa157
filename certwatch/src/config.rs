//! Reloader configuration

use crate::error::ReloaderError;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Settings for a [`crate::Reloader`]
#[derive(Debug, Clone)]
pub struct ReloaderConfig {
    /// Directories holding `<name>.crt`/`<name>.key` pairs
    pub dirs: Vec<PathBuf>,
    /// How often every directory is rescanned; `Duration::ZERO` disables
    /// the periodic rescan (requires `watch`)
    pub reload_interval: Duration,
    /// Watch the directories for created or written files
    pub watch: bool,
    /// Span that reloader events are recorded under
    pub span: Option<tracing::Span>,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            watch: false,
            span: None,
        }
    }
}

impl ReloaderConfig {
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dirs.push(dir.into());
        self
    }

    pub fn with_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = interval;
        self
    }

    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Check settings and normalize the directory list.
    pub(crate) fn validate(mut self) -> Result<Self, ReloaderError> {
        if self.dirs.is_empty() {
            return Err(ReloaderError::NoDirectories);
        }
        if self.reload_interval.is_zero() && !self.watch {
            return Err(ReloaderError::NoReloadSource);
        }
        if std::time::Instant::now()
            .checked_add(self.reload_interval)
            .is_none()
        {
            return Err(ReloaderError::InvalidReloadInterval(self.reload_interval));
        }
        self.dirs = remove_subdirectories(&self.dirs)?;
        Ok(self)
    }
}

/// Make every directory absolute and drop any that is nested inside
/// another entry of the list (or repeats it).
pub fn remove_subdirectories(dirs: &[PathBuf]) -> Result<Vec<PathBuf>, ReloaderError> {
    let mut absolute = dirs
        .iter()
        .map(|dir| normalize(dir))
        .collect::<Result<Vec<_>, _>>()?;
    absolute.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });

    let mut kept: Vec<PathBuf> = Vec::with_capacity(absolute.len());
    for dir in absolute {
        if kept.iter().any(|parent| dir.starts_with(parent)) {
            continue;
        }
        kept.push(dir);
    }
    Ok(kept)
}

fn normalize(dir: &Path) -> Result<PathBuf, ReloaderError> {
    let absolute = std::path::absolute(dir).map_err(|source| ReloaderError::InvalidDirectory {
        path: dir.to_path_buf(),
        source,
    })?;

    // Collecting components drops `.` segments and trailing separators.
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
