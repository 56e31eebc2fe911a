use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::location::ChannelLocation;
use crate::{Error, Result};

/// Exclusive write authority over one channel, held for the duration of a publish.
///
/// Backed by `flock` on `<name>.lock`, so the kernel drops it if the publisher dies.
#[derive(Debug)]
pub struct PublishLock {
    file: File,
}

/// Who last held a publish lock, as recorded in the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub start_time: u64,
}

impl LockOwner {
    pub fn is_alive(&self) -> bool {
        owner_alive(self.pid, self.start_time)
    }
}

impl PublishLock {
    /// Take the channel's lock without blocking and stamp it with this process.
    pub fn acquire(location: &ChannelLocation) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(location.lock_path())?;

        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.kind() {
                std::io::ErrorKind::WouldBlock => Error::ChannelOccupied {
                    location: location.path().to_path_buf(),
                },
                _ => Error::Io(err),
            });
        }

        // Only the holder writes the record, so a positional write needs no seek.
        let (pid, start_time) = process_identity();
        let record = format!("{pid} {start_time}\n");
        file.set_len(0)?;
        file.write_all_at(record.as_bytes(), 0)?;
        file.sync_data()?;
        Ok(Self { file })
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor stays open until `self.file` drops after this.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

pub fn read_lock_owner(path: &Path) -> Result<Option<LockOwner>> {
    let mut contents = String::new();
    match File::open(path) {
        Ok(mut file) => file.read_to_string(&mut contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut parts = contents.split_whitespace();
    let pid = parts.next().and_then(|p| p.parse::<u32>().ok());
    let start_time = parts.next().and_then(|s| s.parse::<u64>().ok());
    Ok(match (pid, start_time) {
        (Some(pid), Some(start_time)) if pid != 0 => Some(LockOwner { pid, start_time }),
        _ => None,
    })
}

/// `(pid, start time)` of the current process. The start time tells a live process apart
/// from a later one that reused the pid.
pub fn process_identity() -> (u32, u64) {
    let pid = std::process::id();
    (pid, proc_start_time(pid).unwrap_or(0))
}

/// Whether the process recorded as `(pid, start_time)` still runs.
///
/// Off Linux the start time is unknown and every owner is treated as alive.
pub fn owner_alive(pid: u32, start_time: u64) -> bool {
    if pid == 0 {
        return false;
    }
    if !cfg!(target_os = "linux") {
        return true;
    }
    match proc_start_time(pid) {
        Some(current) => start_time == 0 || current == start_time,
        None => false,
    }
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let end = contents.rfind(')')?;
    // Field 22 of stat; the comm field before ')' may itself contain spaces.
    contents[end + 1..].split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn proc_start_time(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_channel_is_occupied() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();

        let first = PublishLock::acquire(&location).unwrap();
        let err = PublishLock::acquire(&location).unwrap_err();
        assert!(matches!(err, Error::ChannelOccupied { .. }));

        drop(first);
        assert!(PublishLock::acquire(&location).is_ok());
    }

    #[test]
    fn lock_records_current_process() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        let _lock = PublishLock::acquire(&location).unwrap();

        let owner = read_lock_owner(&location.lock_path()).unwrap().unwrap();
        assert_eq!(owner.pid, std::process::id());
        assert!(owner.is_alive());
    }

    #[test]
    fn relocking_replaces_a_longer_record() {
        let dir = tempfile::tempdir().unwrap();
        let location = ChannelLocation::new(dir.path().join("bundle")).unwrap();
        std::fs::write(location.lock_path(), b"4294967295 18446744073709551615 trailing\n").unwrap();

        let _lock = PublishLock::acquire(&location).unwrap();
        let owner = read_lock_owner(&location.lock_path()).unwrap().unwrap();
        assert_eq!(owner.pid, std::process::id());
        let record = std::fs::read_to_string(location.lock_path()).unwrap();
        assert_eq!(record.lines().count(), 1);
        assert!(!record.contains("trailing"));
    }

    #[test]
    fn missing_or_empty_lock_file_has_no_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.lock");
        assert_eq!(read_lock_owner(&path).unwrap(), None);
        std::fs::write(&path, b"").unwrap();
        assert_eq!(read_lock_owner(&path).unwrap(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reused_pid_is_not_the_owner() {
        let (pid, start_time) = process_identity();
        assert!(start_time > 0);
        assert!(owner_alive(pid, start_time));
        assert!(!owner_alive(pid, start_time + 1));
        assert!(!owner_alive(0, 0));
    }
}
