//! Session binding and login accounting
//!
//! [`SessionBinder::bind_controlling_terminal`] runs in a freshly forked
//! child and turns it into a session leader that owns the slave as its
//! controlling terminal. [`SessionBinder::record_login`] and
//! [`SessionBinder::record_logout`] maintain the login accounting entry for
//! the session from the parent side.

mod accounting;
#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod utmpx;

use std::os::fd::RawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::libc;
use nix::unistd::{setsid, Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use accounting::{Accounting, AccountingError, AccountingStore, FileStore, MemoryStore};
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub use utmpx::UtmpxStore;

/// Directory prefix stripped from device paths to form line names
pub const DEVICE_DIR: &str = "/dev/";

/// Accounting line name for a device path: `/dev/pts/4` becomes `pts/4`
///
/// Names that are already stripped come back unchanged.
pub fn line_name(path: &str) -> &str {
    path.strip_prefix(DEVICE_DIR).unwrap_or(path)
}

/// One live login session in the accounting store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Process id of the session leader (equal to its session id)
    pub session_id: i32,
    /// Terminal line, unique key of the record
    pub line_name: String,
    pub user: String,
    /// Login time, kept to microsecond precision
    #[serde(with = "timestamp")]
    pub timestamp: SystemTime,
}

impl SessionRecord {
    /// Create a record stamped with the current time
    pub fn new(session_id: i32, line: &str, user: &str) -> Self {
        Self {
            session_id,
            line_name: line_name(line).to_string(),
            user: user.to_string(),
            timestamp: timestamp::truncate(SystemTime::now()),
        }
    }

    /// Short id used by utmp-style stores: the last four bytes of the line
    pub fn id_fragment(&self) -> &[u8] {
        let bytes = self.line_name.as_bytes();
        &bytes[bytes.len().saturating_sub(4)..]
    }
}

/// Record timestamps as `{"secs": .., "micros": ..}` since the epoch, the
/// resolution of utmp entries
mod timestamp {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Stamp {
        secs: u64,
        micros: u32,
    }

    pub fn truncate(time: SystemTime) -> SystemTime {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        UNIX_EPOCH + Duration::new(since.as_secs(), since.subsec_micros() * 1000)
    }

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Stamp {
            secs: since.as_secs(),
            micros: since.subsec_micros(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let stamp = Stamp::deserialize(deserializer)?;
        if stamp.micros >= 1_000_000 {
            return Err(D::Error::custom(format!("micros out of range: {}", stamp.micros)));
        }
        UNIX_EPOCH
            .checked_add(Duration::new(stamp.secs, stamp.micros * 1000))
            .ok_or_else(|| D::Error::custom("timestamp out of range"))
    }
}

/// Failure to establish the controlling terminal in the child
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("Failed to create session: {0}")]
    NewSession(#[source] nix::Error),

    #[error("Failed to set controlling terminal: {0}")]
    ControllingTerminal(#[source] nix::Error),

    #[error("Failed to set foreground process group: {0}")]
    ForegroundGroup(#[source] nix::Error),
}

impl BindingError {
    /// The OS error behind the failed step
    pub fn errno(&self) -> Errno {
        match self {
            Self::NewSession(e) | Self::ControllingTerminal(e) | Self::ForegroundGroup(e) => *e,
        }
    }
}

/// Binds terminals to sessions and keeps the accounting store in step
#[derive(Debug, Clone, Default)]
pub struct SessionBinder {
    accounting: Option<Accounting>,
}

impl SessionBinder {
    /// A binder that records sessions in `accounting`
    pub fn new(accounting: Accounting) -> Self {
        Self {
            accounting: Some(accounting),
        }
    }

    /// A binder with login accounting turned off
    pub fn without_accounting() -> Self {
        Self { accounting: None }
    }

    pub fn accounting(&self) -> Option<&Accounting> {
        self.accounting.as_ref()
    }

    /// Make `slave` the controlling terminal of the calling process
    ///
    /// Only meant for the child between fork and exec: starts a new
    /// session, acquires the terminal with `TIOCSCTTY` and makes the new
    /// session the terminal's foreground process group. Returns the new
    /// session id. Uses async-signal-safe calls only, and does not log.
    pub fn bind_controlling_terminal(slave: RawFd) -> Result<Pid, BindingError> {
        let sid = setsid().map_err(BindingError::NewSession)?;

        // SAFETY: TIOCSCTTY takes an int; 0 means never steal the terminal
        // from another session
        let result = unsafe { libc::ioctl(slave, libc::TIOCSCTTY as _, 0) };
        Errno::result(result).map_err(BindingError::ControllingTerminal)?;

        // SAFETY: plain syscall on a descriptor the caller keeps open
        let result = unsafe { libc::tcsetpgrp(slave, sid.as_raw()) };
        Errno::result(result).map_err(BindingError::ForegroundGroup)?;

        Ok(sid)
    }

    /// Append a login record for `line`
    ///
    /// `line` may be a full device path or an already stripped line name.
    /// Accounting is best effort: failures are logged and `None` returned.
    pub fn record_login(&self, line: &str, user: &str, session_id: Pid) -> Option<SessionRecord> {
        let accounting = self.accounting.as_ref()?;
        let record = SessionRecord::new(session_id.as_raw(), line, user);

        match accounting.append(&record) {
            Ok(()) => {
                info!(line = %record.line_name, user, pid = session_id.as_raw(), "Recorded login");
                Some(record)
            }
            Err(e) => {
                warn!(line = %record.line_name, "Failed to record login: {}", e);
                None
            }
        }
    }

    /// Remove the login record for `line`
    ///
    /// Returns `true` if a record was removed. Only the record keyed by
    /// `line` is ever touched, so repeated calls are harmless.
    pub fn record_logout(&self, line: &str) -> bool {
        let Some(accounting) = self.accounting.as_ref() else {
            return false;
        };
        let line = line_name(line);

        match accounting.remove(line) {
            Ok(true) => {
                info!(line, "Recorded logout");
                true
            }
            Ok(false) => {
                debug!(line, "No login record to remove");
                false
            }
            Err(e) => {
                warn!(line, "Failed to record logout: {}", e);
                false
            }
        }
    }
}
