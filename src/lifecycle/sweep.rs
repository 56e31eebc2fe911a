//! Expiry of channel artifacts nobody is going to clean up.
//!
//! Covers the two ways a directory accumulates leftovers: a producer that died between
//! writing its temp file and renaming it, and a handoff that ended in `Failed` or was
//! abandoned altogether.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::HandoffConfig;
use crate::lifecycle::coordinator::remove_channel;
use crate::lifecycle::status::file_age;
use crate::location::{parse_temp_name, ChannelLocation, DEFAULT_TAG_PREFIX};
use crate::publish_lock::{owner_alive, read_lock_owner};
use crate::Result;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Artifacts older than this are stale.
    pub max_staleness: Duration,

    /// Remove stale channels instead of only reporting them.
    pub remove_stale_bundles: bool,

    /// File name prefixes that mark a bundle file as a channel even without a lock file,
    /// e.g. `tempest_` for bundles written by plain JSON producers.
    pub channel_prefixes: Vec<String>,
}

impl SweepConfig {
    pub fn from_config(config: &HandoffConfig) -> Self {
        Self {
            max_staleness: config.max_staleness,
            remove_stale_bundles: false,
            channel_prefixes: vec![DEFAULT_TAG_PREFIX.to_string()],
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Directory entries looked at.
    pub scanned_count: usize,

    /// Temp files removed because their writer is gone or they are too old.
    pub removed_temp_count: usize,

    /// Channels whose bundle outlived `max_staleness`.
    pub stale_channels: Vec<PathBuf>,

    /// Stale channels removed.
    pub removed_channel_count: usize,

    /// Lock files of channels that never got a bundle, removed.
    pub removed_orphan_count: usize,

    pub errors: Vec<String>,

    pub duration: Duration,
}

impl SweepReport {
    pub fn record_error(&mut self, error: String) {
        warn!("sweep: {error}");
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Scanned: {}, Temp removed: {}, Stale: {}, Channels removed: {}, Orphans removed: {}, Errors: {}, Duration: {:?}",
            self.scanned_count,
            self.removed_temp_count,
            self.stale_channels.len(),
            self.removed_channel_count,
            self.removed_orphan_count,
            self.errors.len(),
            self.duration
        )
    }
}

/// Sweep one directory. Per-path failures are collected in the report, not returned.
///
/// Channels are found through their lock file, their receipt directory, or a bundle file
/// named with one of `channel_prefixes`.
pub fn sweep(dir: &Path, config: &SweepConfig) -> Result<SweepReport> {
    let start = Instant::now();
    let mut report = SweepReport::default();

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        paths.push(entry?.path());
    }
    paths.sort();
    report.scanned_count = paths.len();

    let mut channels = BTreeMap::new();
    for path in paths {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some((_, pid, start_time)) = parse_temp_name(name) {
            sweep_temp(&path, pid, start_time, config, &mut report);
            continue;
        }
        let location = ChannelLocation::from_lock_path(&path)
            .or_else(|| ChannelLocation::from_acks_dir(&path).filter(|_| path.is_dir()))
            .or_else(|| {
                let prefixed = config
                    .channel_prefixes
                    .iter()
                    .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()));
                (prefixed && path.is_file())
                    .then(|| ChannelLocation::new(path.clone()).ok())
                    .flatten()
            });
        if let Some(location) = location {
            channels.insert(location.path().to_path_buf(), location);
        }
    }
    for location in channels.values() {
        sweep_channel(location, config, &mut report);
    }

    report.duration = start.elapsed();
    info!("sweep of {}: {}", dir.display(), report.summary());
    Ok(report)
}

fn sweep_temp(path: &Path, pid: u32, start_time: u64, config: &SweepConfig, report: &mut SweepReport) {
    let too_old = file_age(path).map_or(false, |age| age > config.max_staleness);
    if owner_alive(pid, start_time) && !too_old {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => report.removed_temp_count += 1,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => report.record_error(format!("{}: {err}", path.display())),
    }
}

fn sweep_channel(location: &ChannelLocation, config: &SweepConfig, report: &mut SweepReport) {
    if location.path().exists() {
        let stale = file_age(location.path()).map_or(false, |age| age > config.max_staleness);
        if !stale {
            return;
        }
        report.stale_channels.push(location.path().to_path_buf());
        if config.remove_stale_bundles {
            match remove_channel(location) {
                Ok(()) => report.removed_channel_count += 1,
                Err(err) => report.record_error(err.to_string()),
            }
        }
        return;
    }

    // No bundle: whatever is left is a lock or receipts nobody will read again.
    let lock_path = location.lock_path();
    let acks = location.acks_dir();
    let owner_running = match read_lock_owner(&lock_path) {
        Ok(owner) => owner.map_or(false, |owner| owner.is_alive()),
        Err(err) => {
            report.record_error(format!("{}: {err}", lock_path.display()));
            return;
        }
    };
    let too_old = file_age(&lock_path)
        .or_else(|| file_age(&acks))
        .map_or(false, |age| age > config.max_staleness);
    if owner_running && !too_old {
        return;
    }
    match remove_leftovers(&lock_path, &acks) {
        Ok(true) => report.removed_orphan_count += 1,
        Ok(false) => {}
        Err(err) => report.record_error(format!("{location}: {err}")),
    }
}

fn remove_leftovers(lock_path: &Path, acks: &Path) -> io::Result<bool> {
    let lock = removed(std::fs::remove_file(lock_path))?;
    let receipts = removed(std::fs::remove_dir_all(acks))?;
    Ok(lock || receipts)
}

fn removed(result: io::Result<()>) -> io::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::publisher::publish;
    use serde_json::json;

    fn config(max_staleness: Duration, remove: bool) -> SweepConfig {
        SweepConfig {
            max_staleness,
            remove_stale_bundles: remove,
            channel_prefixes: vec!["tempest_".to_string()],
        }
    }

    #[test]
    fn fresh_channels_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        publish(&Bundle::builder(1).resource("server", json!({"id": "s1"})).build(), &location)
            .unwrap();
        std::fs::write(location.temp_path(), b"{").unwrap();

        let report = sweep(dir.path(), &config(Duration::from_secs(3600), true)).unwrap();
        assert_eq!(report.scanned_count, 3);
        assert!(report.stale_channels.is_empty());
        assert_eq!(report.removed_temp_count, 0);
        assert!(location.path().exists());
        assert!(location.temp_path().exists());
    }

    #[test]
    fn stale_channel_is_reported_and_optionally_removed() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        publish(&Bundle::builder(1).resource("server", json!({"id": "s1"})).build(), &location)
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let report = sweep(dir.path(), &config(Duration::from_millis(1), false)).unwrap();
        assert_eq!(report.stale_channels, vec![location.path().to_path_buf()]);
        assert_eq!(report.removed_channel_count, 0);
        assert!(location.path().exists());

        let report = sweep(dir.path(), &config(Duration::from_millis(1), true)).unwrap();
        assert_eq!(report.removed_channel_count, 1);
        assert!(!location.path().exists());
        assert!(!location.lock_path().exists());
        assert!(!report.has_errors());
    }

    #[test]
    fn temp_file_of_dead_writer_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        // pid 0 is never a live publisher.
        let orphan = dir.path().join(".bundle.0.0.tmp");
        std::fs::write(&orphan, b"{\"server\"").unwrap();

        let report = sweep(dir.path(), &config(Duration::from_secs(3600), false)).unwrap();
        assert_eq!(report.removed_temp_count, 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn orphaned_lock_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        std::fs::write(location.lock_path(), b"0 0\n").unwrap();
        std::fs::create_dir_all(location.acks_dir()).unwrap();

        let report = sweep(dir.path(), &config(Duration::from_secs(3600), false)).unwrap();
        assert_eq!(report.removed_orphan_count, 1);
        assert!(!location.lock_path().exists());
        assert!(!location.acks_dir().exists());
    }

    #[test]
    fn summary_mentions_counts() {
        let report = SweepReport {
            scanned_count: 4,
            removed_temp_count: 1,
            ..SweepReport::default()
        };
        assert!(report.summary().starts_with("Scanned: 4, Temp removed: 1"));
    }

    #[test]
    fn stale_bundle_without_lock_is_found_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("tempest_0f6e3c1a");
        std::fs::write(&legacy, br#"{"server": {"id": "s1"}}"#).unwrap();
        let unrelated = dir.path().join("notes.json");
        std::fs::write(&unrelated, b"{}").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let report = sweep(dir.path(), &config(Duration::from_millis(1), false)).unwrap();
        assert_eq!(report.stale_channels, vec![legacy.clone()]);

        let report = sweep(dir.path(), &config(Duration::from_millis(1), true)).unwrap();
        assert_eq!(report.removed_channel_count, 1);
        assert!(!report.has_errors());
        assert!(!legacy.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn receipts_left_after_cleanup_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        let bundle = Bundle::builder(1).resource("server", json!({"id": "s1"})).build();
        publish(&bundle, &location).unwrap();
        remove_channel(&location).unwrap();
        // A late waiter that read the bundle before cleanup writes its receipt afterwards.
        crate::ack::acknowledge(&location, "runner-c", &bundle).unwrap();
        assert!(location.acks_dir().exists());

        let report = sweep(dir.path(), &config(Duration::from_secs(3600), false)).unwrap();
        assert_eq!(report.removed_orphan_count, 1);
        assert!(!location.acks_dir().exists());
        assert!(report.stale_channels.is_empty());
        assert!(!report.has_errors());
    }

    #[test]
    fn channel_seen_through_several_artifacts_is_swept_once() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::tagged(dir.path(), "img").unwrap();
        let bundle = Bundle::builder(1).resource("server", json!({"id": "s1"})).build();
        publish(&bundle, &location).unwrap();
        crate::ack::acknowledge(&location, "runner-b", &bundle).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let sweep_config = SweepConfig {
            channel_prefixes: vec![DEFAULT_TAG_PREFIX.to_string()],
            ..config(Duration::from_millis(1), true)
        };
        let report = sweep(dir.path(), &sweep_config).unwrap();
        assert_eq!(report.stale_channels, vec![location.path().to_path_buf()]);
        assert_eq!(report.removed_channel_count, 1);
        assert!(!report.has_errors());
        assert!(!location.acks_dir().exists());
    }
}
