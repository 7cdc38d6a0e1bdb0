#![forbid(unsafe_code)]

//! Relay configuration handling. Parses a TOML file into a strongly-typed structure and supports
//! hot-reloading via the `notify` crate. The stream layer never reads files itself; it receives
//! the validated structures produced here.

use serde::Deserialize;
use std::{fs, path::Path, sync::Arc};
use tokio::sync::watch;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher};
use tracing::{debug, warn};

use crate::{RelayError, RelayResult};

/// Primary configuration structure shared across relay components.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// Reassembly buffer pool sizing.
    pub buffer: BufferConfig,

    /// Per-session flow limits.
    pub session: SessionConfig,
}

/// Sizing of the shared reassembly pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes per slot; the largest protocol unit a binding can parse.
    pub slot_capacity: usize,
    /// Number of slots shared by every session of a gateway.
    pub slot_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cap on translated bytes waiting for target window, per flow.
    pub max_held_bytes: usize,
    /// Upper bound on any window the session grants to a sender.
    pub max_window: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            buffer: BufferConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            slot_capacity: default_slot_capacity(),
            slot_count: 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_held_bytes: default_slot_capacity(),
            max_window: 64 * 1024,
        }
    }
}

fn default_slot_capacity() -> usize {
    64 * 1024
}

impl RelayConfig {
    /// Load and validate a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        let data = fs::read_to_string(&path).map_err(RelayError::from)?;
        Self::from_toml_str(&data)
    }

    /// Parse and validate configuration held in memory.
    pub fn from_toml_str(data: &str) -> RelayResult<Self> {
        let cfg = toml::from_str::<RelayConfig>(data).map_err(RelayError::ConfigParse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the stream layer cannot operate with.
    pub fn validate(&self) -> RelayResult<()> {
        if self.buffer.slot_capacity == 0 {
            return Err(RelayError::InvalidConfig("buffer.slot_capacity must be non-zero".into()));
        }
        if self.buffer.slot_count == 0 {
            return Err(RelayError::InvalidConfig("buffer.slot_count must be non-zero".into()));
        }
        if self.session.max_window == 0 {
            return Err(RelayError::InvalidConfig("session.max_window must be non-zero".into()));
        }
        let pool_bytes = self.buffer.slot_capacity.saturating_mul(self.buffer.slot_count);
        if self.session.max_held_bytes > pool_bytes {
            return Err(RelayError::InvalidConfig(format!(
                "session.max_held_bytes {} exceeds pool capacity {}",
                self.session.max_held_bytes, pool_bytes
            )));
        }
        Ok(())
    }

    /// Watch the configuration file for changes and receive updates through a watch channel.
    ///
    /// Returns the initial configuration and a [`watch::Receiver`] that yields a new
    /// [`RelayConfig`] wrapped in [`Arc`] every time the file is modified on disk. Updates that
    /// fail to parse or validate are logged and skipped; the previous configuration stays current.
    pub fn watch_file<P: AsRef<Path>>(
        path: P,
    ) -> RelayResult<(Arc<RelayConfig>, watch::Receiver<Arc<RelayConfig>>)> {
        let path_buf = path.as_ref().to_path_buf();
        let initial_cfg = Arc::new(Self::from_file(&path_buf)?);
        let path_in_closure = path_buf.clone();
        let (tx, rx) = watch::channel::<Arc<RelayConfig>>(initial_cfg.clone());

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: NotifyResult<Event>| {
                let Ok(event) = res else { return };
                if !matches!(event.kind, EventKind::Modify(_)) {
                    return;
                }
                let shown = path_in_closure.display();
                match Self::from_file(&path_in_closure) {
                    Ok(updated) => {
                        debug!("configuration reloaded from {}", shown);
                        let _ = tx.send(Arc::new(updated));
                    }
                    Err(e) => warn!("ignoring configuration update from {}: {}", shown, e),
                }
            })?;

        watcher.watch(&path_buf, RecursiveMode::NonRecursive)?;
        // The watcher must outlive this call for events to keep flowing.
        std::mem::forget(watcher);

        Ok((initial_cfg, rx))
    }
}
