//! Locked, persistent rule databases.
//!
//! A [`RuleStore`] owns the backing file for the lifetime of the store and
//! holds an exclusive advisory lock on it, so concurrent invocations of the
//! admission tool serialize on the filesystem. The lock is released when the
//! store drops.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{chown, geteuid, User};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Database file name inside a db directory.
pub const DB_NAME: &str = "devices.proto";

/// Refuse to load database files larger than this.
pub const MAX_DB_SIZE: u64 = 64 * 1024 * 1024;

/// User that owns the database files when the tool runs as root.
const DB_USER: &str = "usb_bouncer";

/// Seconds and nanoseconds since the Unix epoch.
///
/// Derived `Ord` gives the lexicographic (seconds, nanos) comparison the
/// garbage collector relies on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }

    /// The moment `age` before now; saturates at the epoch.
    pub fn cutoff(age: Duration) -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_sub(age);
        Self {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }
}

/// One allow-list entry: the rules a device has presented (most-recent mode
/// last) plus when it was last seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub last_used: Timestamp,
}

/// Fingerprint → entry.
pub type EntryMap = BTreeMap<String, RuleEntry>;

/// The persisted database: the live allow-list plus a short-lived trash map
/// that coalesces mode-switch sequences. The per-user database reuses this
/// type with `trash` left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleDb {
    #[serde(default)]
    pub entries: EntryMap,
    #[serde(default)]
    pub trash: EntryMap,
}

/// Drops every entry in `map` whose `last_used` is older than `age`.
/// Returns the number removed.
pub fn remove_entries_older_than(age: Duration, map: &mut EntryMap) -> usize {
    let cutoff = Timestamp::cutoff(age);
    let before = map.len();
    map.retain(|_, entry| entry.last_used >= cutoff);
    before - map.len()
}

/// A [`RuleDb`] bound to its backing file with an exclusive advisory lock.
pub struct RuleStore {
    file: Flock<std::fs::File>,
    path: PathBuf,
    db: RuleDb,
}

impl RuleStore {
    /// Opens (creating if needed) `dir/devices.proto`, locks it exclusively,
    /// and loads its contents. Fails with [`Error::LockHeld`] when another
    /// process already holds the lock and [`Error::TooLarge`] past the size
    /// limit. Empty or corrupt contents yield an empty database.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;
        setup_permissions(dir, &path);

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => return Err(Error::LockHeld),
            Err((_, errno)) => return Err(Error::Io(std::io::Error::from(errno))),
        };

        let mut store = Self {
            file,
            path,
            db: RuleDb::default(),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &RuleDb {
        &self.db
    }

    pub fn get_mut(&mut self) -> &mut RuleDb {
        &mut self.db
    }

    /// Rewrites the backing file with the in-memory database and truncates
    /// to the written length.
    pub fn persist(&mut self) -> Result<()> {
        let serialized = serde_json::to_vec(&self.db).map_err(std::io::Error::other)?;

        let mut file: &std::fs::File = &self.file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&serialized)?;
        file.set_len(serialized.len() as u64)?;
        Ok(())
    }

    /// Re-reads the backing file, discarding in-memory edits. A file that
    /// fails to parse resets the database to empty with a warning.
    pub fn reload(&mut self) -> Result<()> {
        let mut file: &std::fs::File = &self.file;

        let len = file.metadata()?.len();
        if len > MAX_DB_SIZE {
            return Err(Error::TooLarge {
                len,
                max: MAX_DB_SIZE,
            });
        }

        file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::with_capacity(len as usize);
        file.read_to_end(&mut contents)?;

        if contents.is_empty() {
            self.db = RuleDb::default();
            return Ok(());
        }

        self.db = match serde_json::from_slice(&contents) {
            Ok(db) => db,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt database, regenerating");
                RuleDb::default()
            }
        };
        Ok(())
    }
}

/// When running as root, hand the database (and its directory) to the
/// unprivileged database user. Best-effort outside of root.
fn setup_permissions(dir: &Path, path: &Path) {
    if !geteuid().is_root() {
        return;
    }
    match User::from_name(DB_USER) {
        Ok(Some(user)) => {
            for target in [dir, path] {
                if let Err(e) = chown(target, Some(user.uid), Some(user.gid)) {
                    warn!(path = %target.display(), error = %e, "chown failed");
                }
            }
        }
        Ok(None) => warn!("no passwd entry for {}", DB_USER),
        Err(e) => warn!(error = %e, "failed to look up {}", DB_USER),
    }
}
