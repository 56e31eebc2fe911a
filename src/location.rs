use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Prefix `ChannelLocation::tagged` puts in front of the tag.
pub const DEFAULT_TAG_PREFIX: &str = "handoff_";
const TEMP_SUFFIX: &str = ".tmp";
const LOCK_SUFFIX: &str = ".lock";
const ACKS_SUFFIX: &str = ".acks";

/// The single slot a publisher and its waiters agree on before the handoff starts.
///
/// Every artifact of the channel lives next to the bundle file so that the final rename
/// never crosses a filesystem boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelLocation {
    path: PathBuf,
}

impl ChannelLocation {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match path.file_name().and_then(OsStr::to_str) {
            Some(name) if !name.starts_with('.') && !is_sibling_name(name) => Ok(Self { path }),
            _ => Err(Error::InvalidLocation(format!(
                "{} does not name a bundle file",
                path.display()
            ))),
        }
    }

    /// `<dir>/handoff_<tag>`, for callers that share a tag instead of a path.
    pub fn tagged(dir: impl AsRef<Path>, tag: &str) -> Result<Self> {
        Self::tagged_with_prefix(dir, DEFAULT_TAG_PREFIX, tag)
    }

    /// `<dir>/<prefix><tag>`. Producers that predate this crate wrote to
    /// `/tmp/tempest_<image_ref>`; pass `"tempest_"` to meet them there.
    pub fn tagged_with_prefix(dir: impl AsRef<Path>, prefix: &str, tag: &str) -> Result<Self> {
        if !is_valid_tag(tag) {
            return Err(Error::InvalidLocation(format!("invalid tag {tag:?}")));
        }
        if !(prefix.is_empty() || is_valid_tag(prefix)) {
            return Err(Error::InvalidLocation(format!("invalid prefix {prefix:?}")));
        }
        Self::new(dir.as_ref().join(format!("{prefix}{tag}")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    pub fn name(&self) -> &str {
        // Checked in `new`.
        self.path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
    }

    /// Private temp file of the calling process. Never observed by waiters.
    pub fn temp_path(&self) -> PathBuf {
        let (pid, start_time) = crate::publish_lock::process_identity();
        self.dir()
            .join(format!(".{}.{pid}.{start_time}{TEMP_SUFFIX}", self.name()))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir().join(format!("{}{LOCK_SUFFIX}", self.name()))
    }

    pub fn acks_dir(&self) -> PathBuf {
        self.dir().join(format!("{}{ACKS_SUFFIX}", self.name()))
    }

    /// The location a lock file belongs to, if `path` is one.
    pub fn from_lock_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let bundle = name.strip_suffix(LOCK_SUFFIX)?;
        Self::new(path.with_file_name(bundle)).ok()
    }

    /// The location a receipt directory belongs to, if `path` is one.
    pub fn from_acks_dir(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let bundle = name.strip_suffix(ACKS_SUFFIX)?;
        Self::new(path.with_file_name(bundle)).ok()
    }
}

impl fmt::Display for ChannelLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// A temp file left by a publisher: `(bundle name, pid, process start time)`.
pub(crate) fn parse_temp_name(name: &str) -> Option<(&str, u32, u64)> {
    let inner = name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    let mut parts = inner.rsplitn(3, '.');
    let start_time = parts.next()?.parse().ok()?;
    let pid = parts.next()?.parse().ok()?;
    let bundle = parts.next()?;
    if bundle.is_empty() {
        return None;
    }
    Some((bundle, pid, start_time))
}

fn is_sibling_name(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX) || name.ends_with(ACKS_SUFFIX) || name.ends_with(TEMP_SUFFIX)
}

pub(crate) fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with('.')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
