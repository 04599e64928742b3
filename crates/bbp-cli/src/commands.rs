use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bbp_codec::{peek_header, DeltaHeader};
use bbp_engine::{PersistenceConfig, RehydrationSet};
use bbp_media::{inspect_directory, DirectoryListing, MediumKind, DEFAULT_ROOT};
use bbp_types::format_delta_number;
use chrono::DateTime;
use colored::Colorize;
use serde::Serialize;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Sets(args) => cmd_sets(&args, &cli.format),
        Command::Deltas(args) => cmd_deltas(&args, &cli.format),
        Command::Header(args) => cmd_header(&args.file, &cli.format),
    }
}

/// One agent directory to inspect.
#[derive(Debug, PartialEq)]
struct Target {
    medium: String,
    dir: PathBuf,
}

fn resolve_targets(args: &TargetArgs) -> anyhow::Result<Vec<Target>> {
    if let Some(dir) = &args.dir {
        return Ok(vec![Target {
            medium: dir.display().to_string(),
            dir: dir.clone(),
        }]);
    }
    let Some(path) = &args.config else {
        bail!("either --dir or --config is required");
    };
    let config = PersistenceConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let targets: Vec<Target> = config
        .media
        .iter()
        .filter(|m| matches!(m.kind, MediumKind::File | MediumKind::QueuedFile))
        .filter(|m| args.medium.as_deref().map_or(true, |name| name == m.name))
        .map(|m| Target {
            medium: m.name.clone(),
            dir: m.root.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT)).join(&config.agent),
        })
        .collect();
    if targets.is_empty() {
        bail!("no matching file medium in {}", path.display());
    }
    Ok(targets)
}

fn listings(targets: &[Target]) -> anyhow::Result<Vec<DirectoryListing>> {
    targets
        .iter()
        .map(|t| inspect_directory(&t.dir).with_context(|| format!("inspecting {}", t.dir.display())))
        .collect()
}

fn format_millis(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[derive(Debug, Serialize)]
struct SetView {
    medium: String,
    file: String,
    archive: bool,
    first: u32,
    current: u32,
    timestamp: i64,
}

/// Every sequence file of every target, in the order rehydration tries them.
fn set_views(targets: &[Target], listings: &[DirectoryListing]) -> Vec<SetView> {
    let mut sets: Vec<(RehydrationSet, String, bool)> = Vec::new();
    for (slot, (target, listing)) in targets.iter().zip(listings).enumerate() {
        for file in &listing.sequences {
            let set = RehydrationSet {
                slot,
                medium: target.medium.clone(),
                sequence: file.sequence,
            };
            sets.push((set, file.name.clone(), file.archive));
        }
    }
    sets.sort_by(|a, b| a.0.replay_order(&b.0));
    sets.into_iter()
        .map(|(set, file, archive)| SetView {
            medium: set.medium,
            file,
            archive,
            first: set.sequence.first,
            current: set.sequence.current,
            timestamp: set.sequence.timestamp,
        })
        .collect()
}

fn cmd_sets(args: &TargetArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let targets = resolve_targets(args)?;
    let listings = listings(&targets)?;
    let views = set_views(&targets, &listings);
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    for (target, listing) in targets.iter().zip(&listings) {
        let owner = listing.owner.as_deref().unwrap_or("none");
        println!("{} {} (owner {})", target.medium.bold(), target.dir.display(), owner.dimmed());
    }
    if views.is_empty() {
        println!("No rehydration sets.");
        return Ok(());
    }
    for (i, v) in views.iter().enumerate() {
        let marker = if i == 0 { "→".green().bold() } else { " ".normal() };
        let kind = if v.archive { "archive".cyan() } else { "live".green() };
        println!(
            "{} {} {}..{} ({} deltas) {} {} [{}]",
            marker,
            v.medium.bold(),
            format_delta_number(v.first).yellow(),
            format_delta_number(v.current).yellow(),
            v.current.saturating_sub(v.first),
            format_millis(v.timestamp),
            kind,
            v.file.dimmed()
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HeaderView {
    version: u32,
    next_ref_id: u32,
    associations: usize,
    inline_objects: usize,
    body_len: usize,
}

impl From<DeltaHeader> for HeaderView {
    fn from(h: DeltaHeader) -> Self {
        Self {
            version: h.version,
            next_ref_id: h.next_ref_id.value(),
            associations: h.associations,
            inline_objects: h.inline_objects,
            body_len: h.body_len,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeltaView {
    medium: String,
    delta: String,
    size: u64,
    protected: bool,
    /// `live`, `archive`, or `orphan` when no sequence file covers it.
    status: &'static str,
    header: Option<HeaderView>,
    error: Option<String>,
}

fn delta_status(delta: u32, listing: &DirectoryListing) -> &'static str {
    let covering = |archive: bool| {
        listing
            .sequences
            .iter()
            .any(|s| s.archive == archive && s.sequence.contains(delta))
    };
    if covering(false) {
        "live"
    } else if covering(true) {
        "archive"
    } else {
        "orphan"
    }
}

fn read_header(path: &Path) -> Result<HeaderView, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    peek_header(&bytes).map(HeaderView::from).map_err(|e| e.to_string())
}

fn delta_views(targets: &[Target], listings: &[DirectoryListing]) -> Vec<DeltaView> {
    let mut views = Vec::new();
    for (target, listing) in targets.iter().zip(listings) {
        for file in &listing.deltas {
            debug!(path = %file.path.display(), "reading delta header");
            // Protected deltas are opaque without their key.
            let (header, error) = match read_header(&file.path) {
                Ok(h) => (Some(h), None),
                Err(_) if file.has_key => (None, None),
                Err(e) => (None, Some(e)),
            };
            views.push(DeltaView {
                medium: target.medium.clone(),
                delta: format_delta_number(file.delta),
                size: file.size,
                protected: file.has_key,
                status: delta_status(file.delta, listing),
                header,
                error,
            });
        }
    }
    views
}

fn cmd_deltas(args: &TargetArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let targets = resolve_targets(args)?;
    let listings = listings(&targets)?;
    let views = delta_views(&targets, &listings);
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("No deltas.");
    }
    for v in &views {
        let status = match v.status {
            "live" => v.status.green(),
            "archive" => v.status.cyan(),
            _ => v.status.red(),
        };
        let detail = match (&v.header, &v.error) {
            (Some(h), _) => format!(
                "{} associations, {} inline, next id {}",
                h.associations, h.inline_objects, h.next_ref_id
            ),
            (None, Some(e)) => format!("{} {}", "unreadable:".red(), e),
            (None, None) => "protected".dimmed().to_string(),
        };
        println!(
            "{} {} {:>10} bytes {:<7} {}",
            v.medium.bold(),
            v.delta.yellow(),
            v.size,
            status,
            detail
        );
    }
    Ok(())
}

fn cmd_header(file: &Path, format: &OutputFormat) -> anyhow::Result<()> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let header = HeaderView::from(peek_header(&bytes).with_context(|| format!("decoding {}", file.display()))?);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&header)?),
        OutputFormat::Text => {
            println!("{} {}", "Delta".bold(), file.display());
            println!("  Version: {}", header.version);
            println!("  Next reference id: {}", header.next_ref_id.to_string().yellow());
            println!("  Associations: {}", header.associations);
            println!("  Inline objects: {}", header.inline_objects);
            println!("  Body: {} bytes", header.body_len);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbp_codec::testing::{registry, Counter};
    use bbp_codec::PersistObject;
    use bbp_engine::{Envelope, PersistenceClient, PersistenceEngine, PersistenceItem};
    use bbp_media::MediumConfig;
    use bbp_types::PersistenceIdentity;
    use std::sync::{Arc, Mutex};

    struct Client {
        id: PersistenceIdentity,
        items: Mutex<Vec<PersistenceItem>>,
    }

    impl PersistenceClient for Client {
        fn identity(&self) -> &PersistenceIdentity {
            &self.id
        }

        fn persistence_data(&self) -> Vec<PersistenceItem> {
            std::mem::take(&mut *self.items.lock().unwrap())
        }
    }

    /// Persist one full and one incremental delta below `root`.
    fn populate(root: &Path) -> PathBuf {
        let config = PersistenceConfig::new("agent").with_medium(MediumConfig::file("P", root));
        let mut engine = PersistenceEngine::open(config, registry()).unwrap();
        let x: Arc<dyn PersistObject> = Counter::new("x", 1);
        let mut env = Envelope::new();
        env.add(Arc::clone(&x));
        let client = Arc::new(Client {
            id: PersistenceIdentity::new("c").unwrap(),
            items: Mutex::new(vec![env.into()]),
        });
        engine.register_client(client);
        engine.persist(false, false).unwrap();
        engine.persist(false, false).unwrap();
        root.join("agent")
    }

    #[test]
    fn targets_come_from_dir_or_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = TargetArgs {
            dir: Some(dir.path().to_path_buf()),
            config: None,
            medium: None,
        };
        assert_eq!(resolve_targets(&args).unwrap()[0].dir, dir.path());

        let path = dir.path().join("bbp.toml");
        fs::write(
            &path,
            r#"
agent = "planner"

[[media]]
kind = "file"
name = "P"
root = "/var/bbp"

[[media]]
kind = "noop"
name = "N"
"#,
        )
        .unwrap();
        let args = TargetArgs {
            dir: None,
            config: Some(path.clone()),
            medium: None,
        };
        assert_eq!(
            resolve_targets(&args).unwrap(),
            vec![Target {
                medium: "P".into(),
                dir: PathBuf::from("/var/bbp/planner"),
            }]
        );
        let args = TargetArgs {
            dir: None,
            config: Some(path),
            medium: Some("N".into()),
        };
        assert!(resolve_targets(&args).is_err());
    }

    #[test]
    fn sets_are_listed_in_replay_order() {
        let root = tempfile::tempdir().unwrap();
        let dir = populate(root.path());
        let targets = vec![Target {
            medium: "P".into(),
            dir,
        }];
        let listings = listings(&targets).unwrap();
        let views = set_views(&targets, &listings);
        assert_eq!(views.len(), 2);
        assert_eq!((views[0].archive, views[0].first, views[0].current), (false, 0, 2));
        assert_eq!((views[1].archive, views[1].first, views[1].current), (true, 0, 1));
    }

    #[test]
    fn deltas_show_headers_and_status() {
        let root = tempfile::tempdir().unwrap();
        let dir = populate(root.path());
        fs::write(dir.join("delta_00007"), b"junk").unwrap();
        let targets = vec![Target {
            medium: "P".into(),
            dir: dir.clone(),
        }];
        let listings = listings(&targets).unwrap();
        let views = delta_views(&targets, &listings);
        let summary: Vec<_> = views.iter().map(|v| (v.delta.as_str(), v.status, v.header.is_some())).collect();
        assert_eq!(
            summary,
            vec![("_00000", "live", true), ("_00001", "live", true), ("_00007", "orphan", false)]
        );
        assert_eq!(views[0].header.as_ref().unwrap().associations, 1);
        assert!(views[2].error.is_some());
        assert!(cmd_header(&dir.join("delta_00000"), &OutputFormat::Json).is_ok());
        assert!(cmd_header(&dir.join("delta_00007"), &OutputFormat::Text).is_err());
    }
}
