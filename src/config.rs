//! # Store Configuration
//!
//! Settings are layered, lowest priority first:
//!
//! 1. Hardcoded defaults ([`StoreConfig::default`])
//! 2. An optional TOML file
//! 3. `KVSQL__*` environment variables (e.g. `KVSQL__DSN=/var/lib/kvsql.db`)
//!
//! The driver and DSN are handed to the backend unmodified; everything else
//! tunes the pool and the watch hub.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::watch::{DEFAULT_EVENT_QUEUE_SIZE, DEFAULT_WATCHER_BUFFER_SIZE};
use crate::{Error, Result};

/// DSN that selects a private in-memory database.
pub const IN_MEMORY_DSN: &str = ":memory:";

// =============================================================================
// Backend
// =============================================================================

/// Relational backends this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Embedded SQLite (`sqlite` / `sqlite3`).
    Sqlite,
}

impl Backend {
    /// Resolves a driver identifier.
    pub fn from_driver(driver: &str) -> Result<Self> {
        match driver.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Backend::Sqlite),
            other => Err(Error::Config(format!("unsupported driver '{other}'"))),
        }
    }
}

// =============================================================================
// StoreConfig
// =============================================================================

/// Everything needed to open a store.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend driver identifier.
    pub driver: String,

    /// Connection string, passed through to the driver.
    pub dsn: String,

    /// Prepended to every key; lets several logical stores share a table.
    pub key_prefix: String,

    /// Maximum pooled connections. Forced to 1 for in-memory databases.
    pub pool_size: u32,

    /// How long a writer waits for the write lock before failing.
    pub busy_timeout_ms: u64,

    /// Capacity of the queue between commits and watch dispatch.
    pub event_queue_size: usize,

    /// Per-watcher delivery buffer; a watcher that falls this far behind is
    /// evicted.
    pub watcher_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            dsn: IN_MEMORY_DSN.to_string(),
            key_prefix: String::new(),
            pool_size: 8,
            busy_timeout_ms: 5_000,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            watcher_buffer_size: DEFAULT_WATCHER_BUFFER_SIZE,
        }
    }
}

impl StoreConfig {
    /// Creates a config for the given driver and DSN with default tuning.
    pub fn new(driver: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            dsn: dsn.into(),
            ..Self::default()
        }
    }

    /// SQLite database file at `path`.
    pub fn sqlite(path: impl AsRef<std::path::Path>) -> Self {
        Self::new("sqlite", path.as_ref().to_string_lossy())
    }

    /// Private in-memory SQLite database.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the per-watcher buffer size.
    pub fn with_watcher_buffer_size(mut self, size: usize) -> Self {
        self.watcher_buffer_size = size;
        self
    }

    /// Sets the event queue capacity.
    pub fn with_event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = size;
        self
    }

    /// Loads defaults, then `path` (if given), then `KVSQL__*` variables.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the file is missing or malformed, a value has the
    /// wrong type, or the merged result fails [`validate`](Self::validate).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("KVSQL")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: StoreConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads defaults overridden by `KVSQL__*` variables only.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Checks the config and resolves the backend.
    pub fn validate(&self) -> Result<Backend> {
        let backend = Backend::from_driver(&self.driver)?;

        if self.dsn.trim().is_empty() {
            return Err(Error::Config("no DSN configured".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.event_queue_size == 0 {
            return Err(Error::Config("event_queue_size must be at least 1".into()));
        }
        if self.watcher_buffer_size == 0 {
            return Err(Error::Config("watcher_buffer_size must be at least 1".into()));
        }

        Ok(backend)
    }

    /// Busy timeout as a `Duration`.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// True if the DSN names a private in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.dsn == IN_MEMORY_DSN
    }
}

// =============================================================================
// Tests
// =============================================================================
