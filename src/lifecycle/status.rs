//! Read-only view of a channel for operators.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::ack;
use crate::location::{parse_temp_name, ChannelLocation};
use crate::publisher::read_published;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub location: PathBuf,
    pub published: bool,
    pub generation: Option<u64>,
    pub checksum: Option<u32>,
    pub resources: Vec<String>,
    /// Seconds since the bundle file was last written.
    pub age_secs: Option<f64>,
    /// Why the artifact at the location does not decode, if it does not.
    pub malformed: Option<String>,
    /// Consumers with a receipt for the bundle currently published.
    pub consumers: Vec<String>,
    /// Receipts left over from other generations.
    pub stale_acks: usize,
    pub temp_files: Vec<PathBuf>,
}

pub fn inspect(location: &ChannelLocation) -> Result<ChannelStatus> {
    let mut status = ChannelStatus {
        location: location.path().to_path_buf(),
        published: false,
        generation: None,
        checksum: None,
        resources: Vec::new(),
        age_secs: None,
        malformed: None,
        consumers: Vec::new(),
        stale_acks: 0,
        temp_files: temp_files(location)?,
    };

    let acks = ack::load_acks(location)?;
    match read_published(location) {
        Ok(Some(bundle)) => {
            status.published = true;
            status.generation = Some(bundle.generation());
            status.checksum = Some(bundle.checksum());
            status.resources = bundle.names().map(str::to_string).collect();
            for ack in &acks {
                if ack.matches(&bundle) {
                    status.consumers.push(ack.consumer.clone());
                } else {
                    status.stale_acks += 1;
                }
            }
        }
        Ok(None) => status.stale_acks = acks.len(),
        Err(Error::MalformedBundle { source, .. }) => {
            status.published = true;
            status.malformed = Some(source.to_string());
            status.stale_acks = acks.len();
        }
        Err(err) => return Err(err),
    }
    if status.published {
        status.age_secs = file_age(location.path()).map(|age| age.as_secs_f64());
    }
    Ok(status)
}

/// Temp files other processes left for this channel.
pub(crate) fn temp_files(location: &ChannelLocation) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(location.dir()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if matches!(parse_temp_name(name), Some((bundle, _, _)) if bundle == location.name()) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

pub(crate) fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}
