//! Build media from configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::buffered::BufferedFileSystem;
use crate::config::{MediumConfig, MediumKind};
use crate::database::DatabaseMedium;
use crate::error::Result;
use crate::file::FileMedium;
use crate::fsops::DirectFs;
use crate::medium::{MediumSettings, StorageMedium};
use crate::noop::NoOpMedium;

/// Persistence root used when a file medium names none.
pub const DEFAULT_ROOT: &str = "./workspace/P";

/// Open the medium `config` describes for `agent`.
///
/// `interval` and `consolidation` are the engine-wide values applied where
/// the medium does not override them. `clear` deletes existing deltas.
pub fn open_medium(
    config: &MediumConfig,
    agent: &str,
    interval: Duration,
    consolidation: u32,
    clear: bool,
) -> Result<Box<dyn StorageMedium>> {
    config.validate()?;
    let settings = MediumSettings::from_config(config, interval, consolidation);
    let root = || config.root.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
    info!(medium = %config.name, kind = %config.kind, agent, "opening medium");

    let medium: Box<dyn StorageMedium> = match config.kind {
        MediumKind::File => Box::new(FileMedium::open(
            settings,
            &root(),
            agent,
            DirectFs,
            config.lock_timeout,
            clear,
        )?),
        MediumKind::QueuedFile => Box::new(FileMedium::open(
            settings,
            &root(),
            agent,
            BufferedFileSystem::new()?,
            config.lock_timeout,
            clear,
        )?),
        MediumKind::Database => {
            let path = config.database.clone().unwrap_or_default();
            Box::new(DatabaseMedium::open(settings, &path, agent, clear)?)
        }
        MediumKind::Noop => Box::new(NoOpMedium::new(settings)),
    };
    Ok(medium)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;

    #[test]
    fn opens_each_kind() {
        let dir = tempfile::tempdir().unwrap();
        let i = Duration::from_secs(30);
        let configs = [
            MediumConfig::file("F", dir.path()),
            MediumConfig::queued_file("Q", dir.path().join("q")),
            MediumConfig::database("D", dir.path().join("p.redb")),
            MediumConfig::noop("N"),
        ];
        for c in &configs {
            let m = open_medium(c, "agent", i, 3, false).unwrap();
            assert_eq!(m.name(), c.name);
            assert_eq!(m.persistence_interval(), i);
            assert_eq!(m.consolidation_period(), 3);
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut c = MediumConfig::database("D", "/nowhere");
        c.database = None;
        assert!(matches!(
            open_medium(&c, "a", Duration::from_secs(1), 1, false),
            Err(MediaError::Configuration(_))
        ));
    }
}
