//! Atomic publication of a bundle at a channel location.
//!
//! The bundle is written to a private temp file next to the final path, synced, and renamed
//! into place. Waiters only ever look at the final path, so they see either nothing or the
//! complete bundle.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::{debug, info, warn};

use crate::bundle::Bundle;
use crate::location::ChannelLocation;
use crate::publish_lock::PublishLock;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Written,
    /// The same bundle was already observable; nothing was written.
    AlreadyPublished,
}

pub fn publish(bundle: &Bundle, location: &ChannelLocation) -> Result<PublishOutcome> {
    std::fs::create_dir_all(location.dir())?;
    let _lock = PublishLock::acquire(location)?;

    match read_published(location) {
        Ok(Some(existing)) if existing == *bundle => {
            debug!("bundle generation {} already at {location}", bundle.generation());
            return Ok(PublishOutcome::AlreadyPublished);
        }
        Ok(Some(existing)) => {
            warn!(
                "refusing to replace generation {} at {location} with generation {}",
                existing.generation(),
                bundle.generation()
            );
            return Err(Error::ChannelOccupied {
                location: location.path().to_path_buf(),
            });
        }
        Ok(None) => {}
        Err(Error::MalformedBundle { source, .. }) => {
            warn!("refusing to replace malformed bundle at {location}: {source}");
            return Err(Error::ChannelOccupied {
                location: location.path().to_path_buf(),
            });
        }
        Err(err) => return Err(err),
    }

    let data = bundle.encode()?;
    let tmp_path = location.temp_path();
    if let Err(err) = write_and_rename(&tmp_path, location.path(), &data) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    sync_dir(location.dir())?;

    info!(
        "published generation {} ({} resources, {} bytes) at {location}",
        bundle.generation(),
        bundle.len(),
        data.len()
    );
    Ok(PublishOutcome::Written)
}

/// The bundle observable at `location`, if any. Never looks at temp files.
pub fn read_published(location: &ChannelLocation) -> Result<Option<Bundle>> {
    let data = match std::fs::read(location.path()) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Bundle::decode(&data)
        .map(Some)
        .map_err(|source| Error::MalformedBundle {
            location: location.path().to_path_buf(),
            source,
        })
}

fn write_and_rename(tmp_path: &Path, final_path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp_path, final_path)?;
    Ok(())
}

pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(id: &str) -> Bundle {
        Bundle::builder(1).resource("server", json!({ "id": id })).build()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn publish_makes_bundle_observable() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();

        assert_eq!(read_published(&location).unwrap(), None);
        assert_eq!(publish(&bundle("s1"), &location).unwrap(), PublishOutcome::Written);
        assert_eq!(read_published(&location).unwrap(), Some(bundle("s1")));
        assert_eq!(dir_entries(dir.path()), vec!["bundle", "bundle.lock"]);
    }

    #[test]
    fn publish_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("nested/run/bundle")).unwrap();
        publish(&bundle("s1"), &location).unwrap();
        assert!(location.path().exists());
    }

    #[test]
    fn republishing_same_bundle_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        publish(&bundle("s1"), &location).unwrap();
        let before = std::fs::read(location.path()).unwrap();

        assert_eq!(
            publish(&bundle("s1"), &location).unwrap(),
            PublishOutcome::AlreadyPublished
        );
        assert_eq!(std::fs::read(location.path()).unwrap(), before);
    }

    #[test]
    fn float_descriptors_survive_publish_and_republish() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        let volumes = Bundle::builder(1)
            .resource("volume1", json!({"size": 367.00160478027277_f64}))
            .resource("volume2", json!({"size": 0.1_f64, "iops": 1e-300_f64}))
            .build();

        publish(&volumes, &location).unwrap();
        assert_eq!(read_published(&location).unwrap(), Some(volumes.clone()));
        assert_eq!(
            publish(&volumes, &location).unwrap(),
            PublishOutcome::AlreadyPublished
        );
    }

    #[test]
    fn different_bundle_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        publish(&bundle("s1"), &location).unwrap();

        let err = publish(&bundle("s2"), &location).unwrap_err();
        assert!(matches!(err, Error::ChannelOccupied { .. }));
        assert_eq!(read_published(&location).unwrap(), Some(bundle("s1")));
    }

    #[test]
    fn malformed_occupant_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        std::fs::write(location.path(), b"{\"server\": ").unwrap();

        let err = publish(&bundle("s1"), &location).unwrap_err();
        assert!(matches!(err, Error::ChannelOccupied { .. }));
        assert_eq!(std::fs::read(location.path()).unwrap(), b"{\"server\": ");
    }

    #[test]
    fn read_published_reports_malformed_contents() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        std::fs::write(location.path(), b"not json").unwrap();
        let err = read_published(&location).unwrap_err();
        assert!(matches!(err, Error::MalformedBundle { .. }));
    }
}
