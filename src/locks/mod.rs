//! # Advisory PID Locks
//!
//! Cross-process coordination over a shared table directory uses plain lock
//! files, one per protected resource:
//!
//! ```text
//! resource          lock file            protects
//! --------          ---------            --------
//! table metadata    info.lock            info.db / info.bak shuffle
//! digestion         stomache.lock        ingest/ → block compaction
//! query cache       cache.lock           cache/ population and pruning
//! one block         <block name>.lock    block save / delete / swap
//! ```
//!
//! A lock file holds the owner's PID in decimal. Grabbing retries up to
//! `LOCK_TRIES` times with a short sleep, writing our own PID and then
//! re-reading it to catch a concurrent writer that won the race.
//!
//! ## Liveness and recovery
//!
//! A lock whose owner PID no longer responds to signal 0 is *stale*. The
//! holder check is abstracted behind the [`Liveness`] trait so tests can
//! simulate dead owners without forking. A stale or unparseable lock is not
//! silently stolen: `grab` reports [`GrabResult::NeedsRecovery`] and the
//! table layer runs a per-resource recovery routine (reload info from
//! backup, restore uningested files, verify or quarantine the block, sweep
//! the cache) before force-clearing the lock file. Unparseable lock files
//! must be seen `MAX_LOCK_BREAKS` times before recovery is attempted.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{CACHE_DIR, LOCK_RETRY_SLEEP, LOCK_TRIES, MAX_LOCK_BREAKS, STOMACHE_DIR};

/// How long a dead-looking owner gets to refresh its lock file before we
/// conclude it is really gone.
const STALE_RECHECK_SLEEP: Duration = Duration::from_millis(100);

/// Answers "is this PID a running process?".
pub trait Liveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real PID probing via signal 0. EPERM means the process exists but is
/// owned by someone else, which still counts as alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLiveness;

impl Liveness for OsLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        // INVARIANT: signal 0 never delivers, it only error-checks.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Test liveness with a fixed answer for every foreign PID. Our own PID is
/// always alive.
#[derive(Debug, Clone, Copy)]
pub struct FixedLiveness {
    pub alive: bool,
}

impl Liveness for FixedLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        pid == process::id() || self.alive
    }
}

/// A lockable resource of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Info,
    Digest,
    Cache,
    /// A single block, identified by its directory path; the lock file name
    /// is derived from the path's final component.
    Block(PathBuf),
}

impl Resource {
    pub fn lock_name(&self) -> String {
        match self {
            Resource::Info => "info".to_string(),
            Resource::Digest => STOMACHE_DIR.to_string(),
            Resource::Cache => CACHE_DIR.to_string(),
            Resource::Block(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Outcome of a grab attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabResult {
    Grabbed,
    /// A live owner holds the lock; the caller should skip or retry later.
    Failed,
    /// The lock looks abandoned; the caller must run the resource's
    /// recovery routine and then force-clear the lock.
    NeedsRecovery,
}

/// Lock bookkeeping for one table directory.
pub struct LockManager {
    dir: PathBuf,
    liveness: Arc<dyn Liveness>,
    breaks: Mutex<HashMap<PathBuf, u32>>,
    tries: usize,
    retry_sleep: Duration,
}

impl LockManager {
    pub fn new(dir: PathBuf, liveness: Arc<dyn Liveness>) -> Self {
        Self {
            dir,
            liveness,
            breaks: Mutex::new(HashMap::new()),
            tries: LOCK_TRIES,
            retry_sleep: LOCK_RETRY_SLEEP,
        }
    }

    /// Override retry counts and sleeps, mainly so tests fail fast.
    pub fn with_timing(mut self, tries: usize, retry_sleep: Duration) -> Self {
        self.tries = tries;
        self.retry_sleep = retry_sleep;
        self
    }

    pub fn lock_path(&self, resource: &Resource) -> PathBuf {
        self.dir.join(format!("{}.lock", resource.lock_name()))
    }

    pub fn grab(&self, resource: &Resource) -> GrabResult {
        let lockfile = self.lock_path(resource);
        let mut broken = false;

        for _ in 0..self.tries {
            thread::sleep(self.retry_sleep);

            if !self.check_pid(&lockfile, &mut broken) {
                if broken {
                    debug!(lock = %lockfile.display(), "lock marked for recovery");
                    return GrabResult::NeedsRecovery;
                }
                continue;
            }

            if fs::write(&lockfile, process::id().to_string()).is_err() {
                continue;
            }

            // Re-check after writing to catch a racing writer.
            if self.check_pid(&lockfile, &mut broken) {
                debug!(lock = %lockfile.display(), "locked");
                return GrabResult::Grabbed;
            }
        }

        debug!(lock = %lockfile.display(), "lock grab failed");
        GrabResult::Failed
    }

    /// Delete the lock file if we own it. Releasing a lock we do not hold
    /// is a no-op.
    pub fn release(&self, resource: &Resource) -> bool {
        let lockfile = self.lock_path(resource);
        match fs::read_to_string(&lockfile) {
            Ok(val) if is_our_pid(&val) => {
                debug!(lock = %lockfile.display(), "unlocking");
                let _ = fs::remove_file(&lockfile);
            }
            Ok(_) | Err(_) => {}
        }
        true
    }

    /// Recovery helper: stamp the lock file with an arbitrary PID without
    /// going through the grab protocol.
    pub fn force_make(&self, resource: &Resource, pid: u32) {
        let lockfile = self.lock_path(resource);
        debug!(lock = %lockfile.display(), "force making");
        if let Err(err) = fs::write(&lockfile, pid.to_string()) {
            warn!(lock = %lockfile.display(), %err, "could not force-make lock");
        }
    }

    /// Recovery helper: delete the lock file regardless of owner.
    pub fn force_delete(&self, resource: &Resource) {
        let lockfile = self.lock_path(resource);
        debug!(lock = %lockfile.display(), "force deleting");
        let _ = fs::remove_file(&lockfile);
        self.breaks.lock().remove(&lockfile);
    }

    /// Can the lock be taken? True when the file is absent or already ours.
    /// Sets `broken` when the lock looks abandoned. Reads once; the grab
    /// loop owns the retry schedule.
    fn check_pid(&self, lockfile: &Path, broken: &mut bool) -> bool {
        if self.check_if_broken(lockfile, broken) {
            return true;
        }

        match fs::read_to_string(lockfile) {
            Ok(val) => is_our_pid(&val),
            Err(_) => true,
        }
    }

    /// Stale-lock detection. A lock whose content never parses as a PID
    /// accrues strikes; past `MAX_LOCK_BREAKS` it is marked broken. A
    /// parseable PID that fails the liveness probe is re-read after a grace
    /// sleep, and marked broken only if the file did not change underneath
    /// us. The second sighting of an already-broken lock within one grab
    /// reports it claimable instead of looping forever.
    fn check_if_broken(&self, lockfile: &Path, broken: &mut bool) -> bool {
        let val = match fs::read_to_string(lockfile) {
            Ok(v) => v,
            Err(_) => return false,
        };

        let pid: u32 = match val.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                let mut breaks = self.breaks.lock();
                let count = breaks.entry(lockfile.to_path_buf()).or_insert(0);
                *count += 1;
                warn!(lock = %lockfile.display(), strikes = *count, "unreadable pid in lock");
                if *count > MAX_LOCK_BREAKS as u32 {
                    *broken = true;
                }
                return false;
            }
        };

        if pid != 0 && !self.liveness.is_alive(pid) {
            thread::sleep(STALE_RECHECK_SLEEP);
            if let Ok(next) = fs::read_to_string(lockfile) {
                if next == val {
                    if *broken {
                        *broken = false;
                        return true;
                    }
                    warn!(lock = %lockfile.display(), owner = pid, "lock owner is dead");
                    *broken = true;
                }
            }
        }

        false
    }
}

fn is_our_pid(val: &str) -> bool {
    val.trim() == process::id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(dir: &Path, alive: bool) -> LockManager {
        LockManager::new(dir.to_path_buf(), Arc::new(FixedLiveness { alive }))
            .with_timing(3, Duration::from_millis(1))
    }

    #[test]
    fn grab_writes_own_pid_and_release_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), true);

        assert_eq!(locks.grab(&Resource::Info), GrabResult::Grabbed);
        let lockfile = locks.lock_path(&Resource::Info);
        assert_eq!(
            fs::read_to_string(&lockfile).unwrap(),
            process::id().to_string()
        );

        assert!(locks.release(&Resource::Info));
        assert!(!lockfile.exists());
    }

    #[test]
    fn live_foreign_owner_blocks_the_grab() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), true);
        fs::write(locks.lock_path(&Resource::Cache), "999999").unwrap();

        assert_eq!(locks.grab(&Resource::Cache), GrabResult::Failed);
    }

    #[test]
    fn blocked_grab_waits_one_sleep_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let locks =
            LockManager::new(dir.path().to_path_buf(), Arc::new(FixedLiveness { alive: true }))
                .with_timing(20, Duration::from_millis(5));
        fs::write(locks.lock_path(&Resource::Cache), "999999").unwrap();

        let start = std::time::Instant::now();
        assert_eq!(locks.grab(&Resource::Cache), GrabResult::Failed);
        // 20 attempts at 5ms each; anything near tries-squared means a
        // retry loop is nested inside the per-attempt check.
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
    }

    #[test]
    fn dead_owner_is_flagged_for_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), false);
        fs::write(locks.lock_path(&Resource::Digest), "999999").unwrap();

        assert_eq!(locks.grab(&Resource::Digest), GrabResult::NeedsRecovery);
    }

    #[test]
    fn garbage_lock_needs_repeated_strikes_before_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), true);
        let resource = Resource::Block(PathBuf::from("block0001"));
        fs::write(locks.lock_path(&resource), "not a pid").unwrap();

        // Each grab attempt strikes the lock a few times; eventually the
        // strike count crosses the break threshold.
        let mut outcome = locks.grab(&resource);
        for _ in 0..MAX_LOCK_BREAKS {
            if outcome == GrabResult::NeedsRecovery {
                break;
            }
            outcome = locks.grab(&resource);
        }
        assert_eq!(outcome, GrabResult::NeedsRecovery);

        locks.force_delete(&resource);
        assert_eq!(locks.grab(&resource), GrabResult::Grabbed);
    }

    #[test]
    fn release_leaves_foreign_locks_alone() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path(), true);
        let lockfile = locks.lock_path(&Resource::Info);
        fs::write(&lockfile, "999999").unwrap();

        locks.release(&Resource::Info);
        assert!(lockfile.exists());
    }
}
