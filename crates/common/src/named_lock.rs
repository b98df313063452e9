//! Named exclusive locks with process lifetime.
//!
//! Each lock is an advisory `flock`/`LockFileEx` on a file inside a shared
//! scope directory. The OS drops the lock when the holding process exits,
//! so a crashed server never leaves a stale "running" marker behind.
//!
//! A server identity owns three locks, all named after the handshake
//! fingerprint:
//! - `server-running-<hash>`: held for the whole server lifetime.
//! - `server-busy-<hash>`: held while one build is in flight.
//! - `server-launch-<hash>`: held by a client while it spawns a server, so
//!   racing clients launch at most one process.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, trace};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};

const LOCK_DIR_NAME: &str = "buildhost";
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long the server keeps retrying a lock that a status probe may hold.
const PROBE_GRACE: Duration = Duration::from_millis(50);
const PROBE_RETRY_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to prepare lock directory {}: {source}", .path.display())]
    Directory { path: PathBuf, source: io::Error },
    #[error("failed to open lock {name}: {source}")]
    Open { name: String, source: io::Error },
    #[error("failed to lock {name}: {source}")]
    Lock { name: String, source: io::Error },
}

/// Directory in which lock names resolve. Visible to every session on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockScope {
    dir: PathBuf,
}

impl LockScope {
    /// Host-wide scope: `/tmp/buildhost` on Unix, `%ProgramData%\buildhost` on Windows.
    pub fn global() -> Self {
        Self {
            dir: default_lock_dir(),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Settings override or the global scope.
    pub fn from_override(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => Self::at(dir),
            None => Self::global(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    fn ensure_dir(&self) -> Result<(), LockError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        create_shared_dir(&self.dir).map_err(|source| LockError::Directory {
            path: self.dir.clone(),
            source,
        })
    }

    fn open(&self, name: &str) -> Result<File, LockError> {
        self.ensure_dir()?;
        open_lock_file(&self.lock_path(name)).map_err(|source| LockError::Open {
            name: name.to_string(),
            source,
        })
    }

    /// Try to take `name` without blocking. `Ok(None)` means another holder has it.
    pub fn try_acquire(&self, name: &str) -> Result<Option<NamedLock>, LockError> {
        let file = self.open(name)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!(lock = name, "acquired named lock");
                Ok(Some(NamedLock {
                    name: name.to_string(),
                    file,
                }))
            }
            Err(err) if is_contended(&err) => Ok(None),
            Err(source) => Err(LockError::Lock {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Non-blocking probe; does not keep the lock.
    ///
    /// Probes take the lock shared, so concurrent probes never see each other
    /// as a holder. Only an exclusive holder reads as held.
    pub fn is_held(&self, name: &str) -> Result<bool, LockError> {
        let file = self.open(name)?;
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                if let Err(err) = FileExt::unlock(&file) {
                    debug!(lock = name, "failed to drop probe lock: {}", err);
                }
                Ok(false)
            }
            Err(err) if is_contended(&err) => Ok(true),
            Err(source) => Err(LockError::Lock {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// [`LockScope::try_acquire`] that rides out a concurrent [`LockScope::is_held`]
    /// probe, which holds the lock shared for an instant. Blocks the calling
    /// thread for up to the probe grace.
    pub fn try_acquire_past_probes(&self, name: &str) -> Result<Option<NamedLock>, LockError> {
        let deadline = Instant::now() + PROBE_GRACE;
        loop {
            if let Some(lock) = self.try_acquire(name)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(PROBE_RETRY_INTERVAL);
        }
    }

    /// Poll for `name` until `timeout` elapses.
    pub async fn acquire_within(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<NamedLock>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = self.try_acquire(name)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
        }
    }
}

/// A held lock. Released on drop (and by the OS on process exit).
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    file: File,
}

impl NamedLock {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        // The lock file stays: deleting it would let a second holder lock a new inode.
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(lock = %self.name, "failed to unlock named lock: {}", err);
        } else {
            trace!(lock = %self.name, "released named lock");
        }
    }
}

/// What the two server locks say about a server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    NotRunning,
    Idle,
    Busy,
}

/// The running/busy/launch locks of one server identity.
#[derive(Debug, Clone)]
pub struct ServerLocks {
    scope: LockScope,
    fingerprint: String,
}

impl ServerLocks {
    pub fn new(scope: LockScope, fingerprint: impl Into<String>) -> Self {
        Self {
            scope,
            fingerprint: fingerprint.into(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn scope(&self) -> &LockScope {
        &self.scope
    }

    pub fn running_lock_name(&self) -> String {
        format!("server-running-{}", self.fingerprint)
    }

    pub fn busy_lock_name(&self) -> String {
        format!("server-busy-{}", self.fingerprint)
    }

    pub fn launch_lock_name(&self) -> String {
        format!("server-launch-{}", self.fingerprint)
    }

    /// `None` when another server already owns this identity.
    pub fn try_become_the_server(&self) -> Result<Option<NamedLock>, LockError> {
        self.scope.try_acquire_past_probes(&self.running_lock_name())
    }

    /// `None` when a build is already in flight.
    pub fn try_mark_busy(&self) -> Result<Option<NamedLock>, LockError> {
        self.scope.try_acquire_past_probes(&self.busy_lock_name())
    }

    pub async fn acquire_launch_lock(
        &self,
        timeout: Duration,
    ) -> Result<Option<NamedLock>, LockError> {
        self.scope
            .acquire_within(&self.launch_lock_name(), timeout)
            .await
    }

    pub fn status(&self) -> Result<ServerStatus, LockError> {
        if !self.scope.is_held(&self.running_lock_name())? {
            return Ok(ServerStatus::NotRunning);
        }
        if self.scope.is_held(&self.busy_lock_name())? {
            Ok(ServerStatus::Busy)
        } else {
            Ok(ServerStatus::Idle)
        }
    }
}

fn default_lock_dir() -> PathBuf {
    #[cfg(unix)]
    {
        PathBuf::from("/tmp").join(LOCK_DIR_NAME)
    }
    #[cfg(not(unix))]
    {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join(LOCK_DIR_NAME)
    }
}

#[cfg(unix)]
fn create_shared_dir(dir: &Path) -> io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o777)
        .create(dir)?;
    // umask trims the mode above; other users must still be able to create lock files.
    let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o1777));
    Ok(())
}

#[cfg(not(unix))]
fn create_shared_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
}

#[cfg(not(unix))]
fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempdir().expect("tempdir");
        let scope = LockScope::at(dir.path());

        let first = scope.try_acquire("server-running-abc").expect("lock");
        assert!(first.is_some());
        assert!(scope
            .try_acquire("server-running-abc")
            .expect("lock")
            .is_none());
        assert!(scope.is_held("server-running-abc").expect("probe"));

        drop(first);
        assert!(!scope.is_held("server-running-abc").expect("probe"));
        assert!(scope
            .try_acquire("server-running-abc")
            .expect("lock")
            .is_some());
    }

    #[test]
    fn probe_does_not_keep_the_lock() {
        let dir = tempdir().expect("tempdir");
        let scope = LockScope::at(dir.path());
        assert!(!scope.is_held("x").expect("probe"));
        assert!(scope.try_acquire("x").expect("lock").is_some());
    }

    /// A shared hold on `name`, as a status probe takes it.
    fn hold_shared(scope: &LockScope, name: &str) -> File {
        let file = scope.open(name).expect("open");
        FileExt::try_lock_shared(&file).expect("shared lock");
        file
    }

    #[test]
    fn server_lock_survives_a_concurrent_probe() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "abba");
        // A probe caught mid-flight.
        let probe = hold_shared(locks.scope(), &locks.busy_lock_name());
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            drop(probe);
        });
        assert!(locks.try_mark_busy().expect("lock").is_some());
        releaser.join().expect("join");
    }

    #[test]
    fn status_checks_do_not_read_each_other_as_a_server() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "d00d");
        let _check_in_flight = hold_shared(locks.scope(), &locks.running_lock_name());
        let _busy_check_in_flight = hold_shared(locks.scope(), &locks.busy_lock_name());
        assert_eq!(locks.status().expect("status"), ServerStatus::NotRunning);
    }

    #[test]
    fn concurrent_status_callers_agree_nothing_is_running() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "0ddba11");
        let rounds = 2_000;
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..rounds)
                        .filter(|_| locks.status().expect("status") != ServerStatus::NotRunning)
                        .count()
                })
            })
            .collect();

        let misread: usize = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert_eq!(misread, 0);
    }

    #[test]
    fn status_checks_never_block_out_the_server() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "5ca1ab1e");
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let prober = {
            let locks = locks.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let _ = locks.status().expect("status");
                }
            })
        };

        for _ in 0..200 {
            let running = locks.try_become_the_server().expect("lock");
            assert!(running.is_some());
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        prober.join().expect("join");
    }

    #[test]
    fn concurrent_contenders_get_exactly_one_winner() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "f00d");
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let held = locks.try_become_the_server().expect("lock attempt");
                    let won = held.is_some();
                    // Keep the winner's lock alive until every contender has tried.
                    std::thread::sleep(Duration::from_millis(100));
                    drop(held);
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn status_reflects_running_and_busy_locks() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "beef");
        assert_eq!(locks.status().expect("status"), ServerStatus::NotRunning);

        let running = locks.try_become_the_server().expect("lock");
        assert!(running.is_some());
        assert_eq!(locks.status().expect("status"), ServerStatus::Idle);

        let busy = locks.try_mark_busy().expect("lock");
        assert!(busy.is_some());
        assert_eq!(locks.status().expect("status"), ServerStatus::Busy);
        assert!(locks.try_mark_busy().expect("lock").is_none());

        drop(busy);
        assert_eq!(locks.status().expect("status"), ServerStatus::Idle);
        drop(running);
        assert_eq!(locks.status().expect("status"), ServerStatus::NotRunning);
    }

    #[test]
    fn lock_names_embed_fingerprint() {
        let locks = ServerLocks::new(LockScope::at("/nonexistent"), "1234abcd");
        assert_eq!(locks.running_lock_name(), "server-running-1234abcd");
        assert_eq!(locks.busy_lock_name(), "server-busy-1234abcd");
        assert_eq!(locks.launch_lock_name(), "server-launch-1234abcd");
    }

    #[tokio::test]
    async fn launch_lock_waits_for_release() {
        let dir = tempdir().expect("tempdir");
        let locks = ServerLocks::new(LockScope::at(dir.path()), "cafe");
        let held = locks
            .acquire_launch_lock(Duration::from_millis(10))
            .await
            .expect("lock")
            .expect("free lock");

        assert!(locks
            .acquire_launch_lock(Duration::from_millis(60))
            .await
            .expect("lock")
            .is_none());

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        });
        let acquired = locks
            .acquire_launch_lock(Duration::from_secs(2))
            .await
            .expect("lock");
        assert!(acquired.is_some());
        releaser.await.expect("join");
    }
}
