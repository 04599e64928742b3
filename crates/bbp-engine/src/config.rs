//! Engine configuration.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use bbp_media::config::millis;
use bbp_media::{MediumConfig, DEFAULT_CONSOLIDATION_PERIOD, DEFAULT_PERSISTENCE_INTERVAL};
use serde::{Deserialize, Serialize};

use crate::error::{PersistError, Result};

/// Shortest persistence interval a medium can be set to at runtime.
pub const MIN_PERSISTENCE_INTERVAL: Duration = Duration::from_secs(5);
/// Longest persistence interval; also the interval of the fallback medium.
pub const MAX_PERSISTENCE_INTERVAL: Duration = Duration::from_secs(20 * 60);
pub const MIN_CONSOLIDATION_PERIOD: u32 = 1;
pub const MAX_CONSOLIDATION_PERIOD: u32 = 20;
/// Schedules further than this from the wall clock are shifted back to it.
pub const DRIFT_THRESHOLD: Duration = Duration::from_secs(10);
/// Name of the no-op medium added when nothing else is writable.
pub const DUMMY_MEDIUM_NAME: &str = "dummy";

/// Configuration of one agent's persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Agent name; selects the per-agent directory or table of every medium.
    pub agent: String,
    /// Default interval for media that do not set their own.
    #[serde(rename = "persistence_interval_ms", with = "millis")]
    pub persistence_interval: Duration,
    /// Default consolidation period for media that do not set their own.
    pub consolidation_period: u32,
    /// `false` makes every medium read-only.
    pub writable: bool,
    /// Rehydrate from this archive (`_NNNNN`) only. Forces read-only.
    pub archive: Option<String>,
    /// Delete all persisted deltas of the agent at startup.
    pub clear_on_start: bool,
    pub media: Vec<MediumConfig>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            agent: String::new(),
            persistence_interval: DEFAULT_PERSISTENCE_INTERVAL,
            consolidation_period: DEFAULT_CONSOLIDATION_PERIOD,
            writable: true,
            archive: None,
            clear_on_start: false,
            media: Vec::new(),
        }
    }
}

impl PersistenceConfig {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Default::default()
        }
    }

    pub fn with_medium(mut self, medium: MediumConfig) -> Self {
        self.media.push(medium);
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| PersistError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Whether media may be written at all.
    pub fn is_writable(&self) -> bool {
        self.writable && self.archive.is_none()
    }

    /// Suffix passed to media when listing rehydration candidates.
    pub fn archive_suffix(&self) -> &str {
        self.archive.as_deref().unwrap_or("")
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.is_empty() {
            return Err(PersistError::Config("agent name is empty".into()));
        }
        if self.consolidation_period == 0 {
            return Err(PersistError::Config("consolidation period must be at least 1".into()));
        }
        if self.persistence_interval.is_zero() {
            return Err(PersistError::Config("persistence interval must be positive".into()));
        }
        if let Some(archive) = &self.archive {
            bbp_types::parse_delta_suffix(archive)?;
        }
        let mut names = BTreeSet::new();
        for medium in &self.media {
            medium.validate()?;
            if medium.name == DUMMY_MEDIUM_NAME {
                return Err(PersistError::Config(format!("medium name {DUMMY_MEDIUM_NAME} is reserved")));
            }
            if !names.insert(medium.name.as_str()) {
                return Err(PersistError::Config(format!("duplicate medium name: {}", medium.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbp_media::MediumKind;

    #[test]
    fn defaults_match_documented_values() {
        let c = PersistenceConfig::default();
        assert_eq!(c.persistence_interval, Duration::from_secs(300));
        assert_eq!(c.consolidation_period, 10);
        assert!(c.is_writable());
        assert_eq!(c.archive_suffix(), "");
    }

    #[test]
    fn parses_toml() {
        let c = PersistenceConfig::from_toml_str(
            r#"
            agent = "planner-1"
            persistence_interval_ms = 60000
            consolidation_period = 4

            [[media]]
            kind = "file"
            name = "P"
            root = "/var/lib/bbp"
            archive_count = 2

            [[media]]
            kind = "database"
            name = "db"
            database = "/var/lib/bbp/p.redb"
            persistence_interval_ms = 600000
            "#,
        )
        .unwrap();
        assert_eq!(c.agent, "planner-1");
        assert_eq!(c.persistence_interval, Duration::from_secs(60));
        assert_eq!(c.media.len(), 2);
        assert_eq!(c.media[1].kind, MediumKind::Database);
        assert_eq!(c.media[1].persistence_interval, Some(Duration::from_secs(600)));
    }

    #[test]
    fn archive_forces_read_only() {
        let mut c = PersistenceConfig::new("a");
        c.archive = Some("_00003".into());
        assert!(!c.is_writable());
        assert_eq!(c.archive_suffix(), "_00003");
        c.validate().unwrap();
        c.archive = Some("3".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_and_reserved_names() {
        let dup = PersistenceConfig::new("a")
            .with_medium(MediumConfig::noop("x"))
            .with_medium(MediumConfig::noop("x"));
        assert!(matches!(dup.validate(), Err(PersistError::Config(_))));
        let reserved = PersistenceConfig::new("a").with_medium(MediumConfig::noop(DUMMY_MEDIUM_NAME));
        assert!(reserved.validate().is_err());
        assert!(PersistenceConfig::default().validate().is_err());
    }
}
