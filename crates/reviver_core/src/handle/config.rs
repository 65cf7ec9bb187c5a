//! Per-handle configuration chains.
//!
//! A [`Configs`] list is applied to every handle a pool hands out. Each
//! [`HandleConfig`] knows how to invoke itself on a handle and, where the
//! engine allows it, how to undo itself. Lists compare by value, so a
//! handle whose chain already equals the requested one is not touched.

use crate::error::{CoreError, CoreResult};
use crate::handle::connection::Handle;
use crate::repair::quote_identifier;
use std::path::PathBuf;
use std::time::Duration;

/// Journal modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalMode {
    /// Rollback journal deleted at commit.
    Delete,
    /// Rollback journal truncated at commit.
    Truncate,
    /// Rollback journal header zeroed at commit.
    Persist,
    /// Rollback journal in memory.
    Memory,
    /// Write-ahead log.
    Wal,
    /// No journal.
    Off,
}

impl JournalMode {
    /// Returns the pragma value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::Persist => "persist",
            Self::Memory => "memory",
            Self::Wal => "wal",
            Self::Off => "off",
        }
    }
}

/// Synchronous levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Synchronous {
    /// No syncs.
    Off,
    /// Sync at critical moments.
    Normal,
    /// Sync at every commit.
    Full,
    /// Like `Full`, also syncing the directory.
    Extra,
}

impl Synchronous {
    /// Returns the pragma value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
            Self::Extra => "EXTRA",
        }
    }
}

/// One configuration step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleConfig {
    /// How long statements wait on a locked database.
    BusyTimeout(Duration),
    /// Journal mode of the main schema.
    JournalMode(JournalMode),
    /// Synchronous level.
    Synchronous(Synchronous),
    /// Pages after which the WAL is checkpointed automatically.
    AutoCheckpoint(u32),
    /// Any other pragma.
    Pragma {
        /// Pragma name.
        name: String,
        /// Value, passed as SQL text.
        value: String,
    },
    /// Another database attached under `schema`.
    AttachDatabase {
        /// Schema name.
        schema: String,
        /// Database file.
        path: PathBuf,
    },
    /// Caller-defined SQL.
    Custom {
        /// Unique name of the step.
        name: String,
        /// SQL run when the step is invoked.
        invoke_sql: String,
        /// SQL run when the step is removed.
        uninvoke_sql: Option<String>,
    },
}

impl HandleConfig {
    /// Returns the name identifying the step within a [`Configs`].
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::BusyTimeout(_) => "busy_timeout".to_string(),
            Self::JournalMode(_) => "journal_mode".to_string(),
            Self::Synchronous(_) => "synchronous".to_string(),
            Self::AutoCheckpoint(_) => "wal_autocheckpoint".to_string(),
            Self::Pragma { name, .. } => format!("pragma:{name}"),
            Self::AttachDatabase { schema, .. } => format!("attach:{schema}"),
            Self::Custom { name, .. } => name.clone(),
        }
    }

    /// Applies the step to `handle`.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the step.
    pub fn invoke(&self, handle: &Handle) -> CoreResult<()> {
        let connection = handle.connection();
        let applied = match self {
            Self::BusyTimeout(timeout) => connection.busy_timeout(*timeout),
            Self::JournalMode(mode) => {
                let actual: String = connection
                    .pragma_update_and_check(None, "journal_mode", mode.as_str(), |row| row.get(0))
                    .map_err(|error| self.error(&error))?;
                if !actual.eq_ignore_ascii_case(mode.as_str()) {
                    return Err(self.error(&format!("engine kept journal mode {actual}")));
                }
                Ok(())
            }
            Self::Synchronous(level) => connection.pragma_update(None, "synchronous", level.as_str()),
            Self::AutoCheckpoint(pages) => connection.pragma_update(None, "wal_autocheckpoint", pages),
            Self::Pragma { name, value } => connection.pragma_update(None, name, value),
            Self::AttachDatabase { schema, path } => connection
                .execute(
                    &format!("ATTACH DATABASE ?1 AS {}", quote_identifier(schema)),
                    [path.to_string_lossy().into_owned()],
                )
                .map(|_| ()),
            Self::Custom { invoke_sql, .. } => connection.execute_batch(invoke_sql),
        };
        applied.map_err(|error| self.error(&error))
    }

    /// Undoes the step on `handle` where that is possible.
    ///
    /// Journal mode, synchronous level and plain pragmas stay as they are.
    ///
    /// # Errors
    ///
    /// Returns a config error naming the step.
    pub fn uninvoke(&self, handle: &Handle) -> CoreResult<()> {
        let connection = handle.connection();
        let undone = match self {
            Self::BusyTimeout(_) => connection.busy_timeout(Duration::ZERO),
            Self::AutoCheckpoint(_) => connection.pragma_update(None, "wal_autocheckpoint", 1000),
            Self::AttachDatabase { schema, .. } => {
                connection.execute_batch(&format!("DETACH DATABASE {}", quote_identifier(schema)))
            }
            Self::Custom {
                uninvoke_sql: Some(sql),
                ..
            } => connection.execute_batch(sql),
            Self::JournalMode(_) | Self::Synchronous(_) | Self::Pragma { .. } | Self::Custom { .. } => {
                Ok(())
            }
        };
        undone.map_err(|error| self.error(&error))
    }

    fn error(&self, message: &dyn std::fmt::Display) -> CoreError {
        CoreError::config(self.name(), message.to_string())
    }
}

/// Priority of steps that must run before the defaults.
pub const PRIORITY_HIGH: i32 = -100;
/// Default priority.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Priority of steps that must run after the defaults.
pub const PRIORITY_LOW: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: i32,
    config: HandleConfig,
}

/// An ordered chain of configuration steps.
///
/// Steps run by ascending priority, then in insertion order. Inserting a
/// step whose name is already present replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configs {
    entries: Vec<Entry>,
}

impl Configs {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `config` at the default priority.
    #[must_use]
    pub fn with(mut self, config: HandleConfig) -> Self {
        self.insert(config, PRIORITY_DEFAULT);
        self
    }

    /// Adds `config` at `priority`.
    #[must_use]
    pub fn with_priority(mut self, config: HandleConfig, priority: i32) -> Self {
        self.insert(config, priority);
        self
    }

    /// Inserts or replaces `config`.
    pub fn insert(&mut self, config: HandleConfig, priority: i32) {
        self.remove(&config.name());
        let position = self
            .entries
            .iter()
            .position(|entry| entry.priority > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, Entry { priority, config });
    }

    /// Removes the step named `name`. Returns true if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.config.name() != name);
        self.entries.len() != before
    }

    /// Returns the step named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HandleConfig> {
        self.iter().find(|config| config.name() == name)
    }

    /// Iterates over the steps in invocation order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HandleConfig> {
        self.entries.iter().map(|entry| &entry.config)
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
