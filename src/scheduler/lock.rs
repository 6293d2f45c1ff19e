//! Advisory lock electing the single scheduler process

use crate::WatchResult;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive `flock` held for as long as this value lives
#[derive(Debug)]
pub struct SchedulerLock {
    file: File,
    path: PathBuf,
}

impl SchedulerLock {
    /// Take the lock without blocking; `None` when another holder has it
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> WatchResult<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if !flock_exclusive(&file)? {
            debug!("Scheduler lock {} is held elsewhere", path.display());
            return Ok(None);
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        info!("Acquired scheduler lock {}", path.display());
        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        unlock(&self.file);
        debug!("Released scheduler lock {}", self.path.display());
    }
}

/// Whether some other open file currently holds the lock
pub fn probe_lock<P: AsRef<Path>>(path: P) -> WatchResult<bool> {
    if !path.as_ref().exists() {
        return Ok(false);
    }
    let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
    if flock_exclusive(&file)? {
        unlock(&file);
        Ok(false)
    } else {
        Ok(true)
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> WatchResult<bool> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK => Ok(false),
        _ => Err(err.into()),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> WatchResult<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        assert!(!probe_lock(&path).unwrap());
        let first = SchedulerLock::try_acquire(&path).unwrap().expect("first acquire");
        assert_eq!(first.path(), path.as_path());
        assert!(probe_lock(&path).unwrap());
        assert!(SchedulerLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(!probe_lock(&path).unwrap());
        assert!(SchedulerLock::try_acquire(&path).unwrap().is_some());
    }
}
