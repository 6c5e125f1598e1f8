use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use turbfetch_observe::time::unix_time_ms;

use crate::StoreError;

/// Exclusive claim on one (session, variable) pair. Removes the lock file on drop.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the heartbeat so long runs are not mistaken for stale ones.
    pub fn touch(&self) -> Result<(), StoreError> {
        crate::write_atomic(&self.path, lock_file_content(unix_time_ms()).as_bytes())?;
        Ok(())
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Takes the run lock at `path`, reaping it first if its heartbeat is older than
/// `stale_after`. A zero `stale_after` never reaps.
///
/// Reaping moves the stale file aside under a unique name and only proceeds if the
/// moved file is still the one judged stale, so two reapers never both win.
pub fn acquire_run_lock(path: &Path, stale_after: Duration) -> Result<RunLockGuard, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let now_ms = unix_time_ms();

    match create_lock_file(path, now_ms) {
        Ok(guard) => return Ok(guard),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(StoreError::Io(err)),
    }
    if stale_after.is_zero() {
        return Err(StoreError::Locked(path.to_path_buf()));
    }

    if let Some(seen) = read_lock(path)? {
        if !is_lock_stale(&seen, stale_after, now_ms) || !set_aside(path, &seen)? {
            return Err(StoreError::Locked(path.to_path_buf()));
        }
        tracing::warn!(
            target: "turbfetch_store",
            event = "run_lock_reaped",
            path = %path.display(),
            "reaping stale run lock"
        );
    }
    match create_lock_file(path, now_ms) {
        Ok(guard) => Ok(guard),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(StoreError::Locked(path.to_path_buf()))
        }
        Err(err) => Err(StoreError::Io(err)),
    }
}

/// Moves the lock at `path` aside and discards it if it still holds `seen`.
///
/// Returns `false` when the file changed in between (a fresh lock or a heartbeat); that
/// file is linked back into place unless another lock already took its spot.
fn set_aside(path: &Path, seen: &str) -> Result<bool, StoreError> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let mut aside = OsString::from(path.as_os_str());
    aside.push(format!(
        ".reaped-{}-{}-{}",
        std::process::id(),
        unix_time_ms(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let aside = PathBuf::from(aside);

    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        // Someone else reaped it first; the create_new race decides.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(StoreError::Io(err)),
    }
    let moved = std::fs::read_to_string(&aside);
    if matches!(&moved, Ok(content) if content == seen) {
        let _ = std::fs::remove_file(&aside);
        return Ok(true);
    }
    let _ = std::fs::hard_link(&aside, path);
    let _ = std::fs::remove_file(&aside);
    Ok(false)
}

fn read_lock(path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io(err)),
    }
}

fn create_lock_file(path: &Path, now_ms: u64) -> Result<RunLockGuard, std::io::Error> {
    let mut f = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    f.write_all(lock_file_content(now_ms).as_bytes())?;
    f.sync_all()?;
    Ok(RunLockGuard {
        path: path.to_path_buf(),
    })
}

fn lock_file_content(unix_time_ms: u64) -> String {
    format!("unix_time_ms={unix_time_ms}\npid={}\n", std::process::id())
}

fn is_lock_stale(content: &str, stale_after: Duration, now_ms: u64) -> bool {
    let lock_ms = content.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == "unix_time_ms")
            .then(|| v.trim().parse::<u64>().ok())
            .flatten()
    });
    let Some(lock_ms) = lock_ms else {
        // Unreadable heartbeat: leave it for an operator.
        return false;
    };

    let age_ms = now_ms.saturating_sub(lock_ms);
    age_ms >= stale_after.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_root;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn run_lock_allows_single_winner() -> anyhow::Result<()> {
        let root = temp_root("lock-single-winner")?;
        let path = Arc::new(root.join("velocity").join("run.lock"));

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..threads {
            let path = path.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                match acquire_run_lock(&path, Duration::from_secs(60)) {
                    Ok(_guard) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(StoreError::Locked(_)) => {}
                    Err(other) => panic!("unexpected lock error: {other}"),
                }
            }));
        }
        for h in handles {
            h.join().expect("thread join");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn stale_lock_is_reaped_and_guard_cleans_up() -> anyhow::Result<()> {
        let root = temp_root("lock-stale")?;
        let path = root.join("run.lock");
        std::fs::write(&path, lock_file_content(0))?;

        let guard = acquire_run_lock(&path, Duration::from_millis(1))?;
        guard.touch()?;
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn fresh_lock_is_refused() -> anyhow::Result<()> {
        let root = temp_root("lock-fresh")?;
        let path = root.join("run.lock");
        let _held = acquire_run_lock(&path, Duration::from_secs(3600))?;
        assert!(matches!(
            acquire_run_lock(&path, Duration::from_secs(3600)),
            Err(StoreError::Locked(_))
        ));
        Ok(())
    }

    #[test]
    fn stale_lock_has_a_single_reaper() -> anyhow::Result<()> {
        let root = temp_root("lock-stale-contended")?;
        let path = Arc::new(root.join("run.lock"));
        std::fs::write(path.as_ref(), lock_file_content(0))?;

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..threads {
            let path = path.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                match acquire_run_lock(&path, Duration::from_secs(60)) {
                    Ok(_guard) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(StoreError::Locked(_)) => {}
                    Err(other) => panic!("unexpected lock error: {other}"),
                }
            }));
        }
        for h in handles {
            h.join().expect("thread join");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        let leftovers: Vec<_> = std::fs::read_dir(&root)?
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".reaped-"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[test]
    fn lock_that_changed_since_judged_stale_is_put_back() -> anyhow::Result<()> {
        let root = temp_root("lock-put-back")?;
        let path = root.join("run.lock");
        let fresh = lock_file_content(unix_time_ms());
        std::fs::write(&path, &fresh)?;

        assert!(!set_aside(&path, &lock_file_content(0))?);
        assert_eq!(std::fs::read_to_string(&path)?, fresh);
        assert_eq!(std::fs::read_dir(&root)?.count(), 1);
        Ok(())
    }
}
