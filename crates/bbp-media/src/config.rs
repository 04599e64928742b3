//! Typed medium configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};

/// Default persistence interval of a medium.
pub const DEFAULT_PERSISTENCE_INTERVAL: Duration = Duration::from_secs(300);
/// Default number of deltas between full snapshots.
pub const DEFAULT_CONSOLIDATION_PERIOD: u32 = 10;
/// Default bounded wait before a stale ownership lock is stolen.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Which medium implementation to instantiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediumKind {
    /// Direct synchronous file writes, fsync on close.
    File,
    /// File writes routed through the background writer.
    QueuedFile,
    /// One redb table per agent.
    Database,
    /// Discards everything.
    Noop,
}

impl MediumKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::QueuedFile => "queued-file",
            Self::Database => "database",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for MediumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediumKind {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(Self::File),
            "queued-file" => Ok(Self::QueuedFile),
            "database" => Ok(Self::Database),
            "noop" => Ok(Self::Noop),
            other => Err(MediaError::Configuration(format!("unknown medium kind: {other}"))),
        }
    }
}

/// Configuration of one storage medium.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    pub kind: MediumKind,
    pub name: String,
    /// Archived full snapshots to keep. `None` keeps them all.
    pub archive_count: Option<u32>,
    /// Overrides the engine-wide interval for this medium.
    #[serde(rename = "persistence_interval_ms", with = "millis::option")]
    pub persistence_interval: Option<Duration>,
    /// Overrides the engine-wide consolidation period for this medium.
    pub consolidation_period: Option<u32>,
    pub writable: bool,
    /// Persistence root of the file media. Agent directories live below it.
    pub root: Option<PathBuf>,
    /// redb file of the database medium.
    pub database: Option<PathBuf>,
    /// How long a lock holder may stay unchanged before its lock is stolen.
    #[serde(rename = "lock_timeout_ms", with = "millis")]
    pub lock_timeout: Duration,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            kind: MediumKind::File,
            name: String::new(),
            archive_count: None,
            persistence_interval: None,
            consolidation_period: None,
            writable: true,
            root: None,
            database: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl MediumConfig {
    /// A file medium rooted at `root`.
    pub fn file(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: Some(root.into()),
            ..Default::default()
        }
    }

    /// A queued-file medium rooted at `root`.
    pub fn queued_file(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            kind: MediumKind::QueuedFile,
            ..Self::file(name, root)
        }
    }

    /// A database medium stored in the redb file at `path`.
    pub fn database(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: MediumKind::Database,
            name: name.into(),
            database: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn noop(name: impl Into<String>) -> Self {
        Self {
            kind: MediumKind::Noop,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Reject configurations no medium can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MediaError::Configuration(format!("{} medium without a name", self.kind)));
        }
        if self.name.contains(['/', '\\']) {
            return Err(MediaError::Configuration(format!("invalid medium name: {}", self.name)));
        }
        if self.kind == MediumKind::Database && self.database.is_none() {
            return Err(MediaError::Configuration(format!(
                "database medium {} needs a database path",
                self.name
            )));
        }
        if self.consolidation_period == Some(0) {
            return Err(MediaError::Configuration(format!(
                "medium {}: consolidation period must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&(d.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = MediumConfig::default();
        assert_eq!(c.kind, MediumKind::File);
        assert!(c.writable);
        assert_eq!(c.lock_timeout, Duration::from_secs(60));
        assert_eq!(c.archive_count, None);
    }

    #[test]
    fn kind_parses() {
        assert_eq!("queued-file".parse::<MediumKind>().unwrap(), MediumKind::QueuedFile);
        assert!(matches!(
            "ldap".parse::<MediumKind>(),
            Err(MediaError::Configuration(_))
        ));
    }

    #[test]
    fn validation() {
        assert!(MediumConfig::file("", "/tmp").validate().is_err());
        assert!(MediumConfig::file("a/b", "/tmp").validate().is_err());
        assert!(MediumConfig::file("p", "/tmp").validate().is_ok());
        let mut db = MediumConfig::database("db", "/tmp/x.redb");
        assert!(db.validate().is_ok());
        db.database = None;
        assert!(db.validate().is_err());
    }

    #[test]
    fn toml_shape() {
        let c: MediumConfig = toml::from_str(
            r#"
            kind = "queued-file"
            name = "P"
            root = "/var/bbp"
            archive_count = 3
            persistence_interval_ms = 60000
            lock_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(c.kind, MediumKind::QueuedFile);
        assert_eq!(c.persistence_interval, Some(Duration::from_secs(60)));
        assert_eq!(c.lock_timeout, Duration::from_millis(500));
        assert_eq!(c.archive_count, Some(3));
        assert!(c.writable);
    }
}
