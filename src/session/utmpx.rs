//! System login accounting through the utmpx API (glibc)
//!
//! Login appends a `USER_PROCESS` entry for the line; logout rewrites the
//! matching entry as `DEAD_PROCESS`. Both also append the entry to the wtmp
//! history file.
//!
//! The utmpx functions keep a process-global cursor and database name, so
//! every call sequence selects its database and runs under one process-wide
//! lock in addition to the [`Accounting`] guard of whichever handle called
//! in.
//!
//! [`Accounting`]: super::Accounting

use std::ffi::{c_char, CString};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::libc;

use super::{AccountingError, AccountingStore, SessionRecord};

/// Default location of the utmp database
pub const UTMP_PATH: &str = "/var/run/utmp";

/// Default location of the wtmp history file
pub const WTMP_PATH: &str = "/var/log/wtmp";

static UTMPX_LOCK: Mutex<()> = Mutex::new(());

/// Store backed by the system utmp/wtmp files
#[derive(Debug, Clone)]
pub struct UtmpxStore {
    utmp_path: Option<PathBuf>,
    wtmp_path: Option<PathBuf>,
}

impl Default for UtmpxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UtmpxStore {
    /// Record in the system utmp and in the default wtmp file
    pub fn new() -> Self {
        Self::with_paths(None, Some(PathBuf::from(WTMP_PATH)))
    }

    /// Use a different wtmp file, or none to skip history entirely
    pub fn with_wtmp(wtmp_path: Option<PathBuf>) -> Self {
        Self::with_paths(None, wtmp_path)
    }

    /// Use another utmp database (`None` for the system one) and wtmp file
    pub fn with_paths(utmp_path: Option<PathBuf>, wtmp_path: Option<PathBuf>) -> Self {
        Self {
            utmp_path,
            wtmp_path,
        }
    }

    /// Point the utmpx functions at this store's database
    ///
    /// Must be called with `UTMPX_LOCK` held.
    fn select_database(&self, line: &str) -> Result<(), AccountingError> {
        let path = self
            .utmp_path
            .as_deref()
            .unwrap_or_else(|| Path::new(UTMP_PATH));
        let name = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
            AccountingError::Io(io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;

        // SAFETY: name is a valid C string; glibc copies it
        let result = unsafe { libc::utmpxname(name.as_ptr()) };
        if result < 0 {
            return Err(AccountingError::Rejected {
                line: line.to_string(),
                source: Errno::last(),
            });
        }
        Ok(())
    }

    fn append_history(&self, entry: &libc::utmpx) -> Result<(), AccountingError> {
        let Some(path) = &self.wtmp_path else {
            return Ok(());
        };
        // SAFETY: utmpx is plain old data; wtmp is an array of these records
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (entry as *const libc::utmpx).cast::<u8>(),
                std::mem::size_of::<libc::utmpx>(),
            )
        };
        OpenOptions::new().append(true).open(path)?.write_all(bytes)?;
        Ok(())
    }
}

impl AccountingStore for UtmpxStore {
    fn append(&mut self, record: &SessionRecord) -> Result<(), AccountingError> {
        let entry = to_entry(record, libc::USER_PROCESS);
        let _guard = UTMPX_LOCK.lock().map_err(|_| AccountingError::Poisoned)?;
        self.select_database(&record.line_name)?;

        // SAFETY: the cursor functions are serialised by UTMPX_LOCK and the
        // entry outlives the calls
        let (written, errno) = unsafe {
            libc::setutxent();
            let written = libc::pututxline(&entry);
            let errno = Errno::last();
            libc::endutxent();
            (written, errno)
        };
        if written.is_null() {
            return Err(AccountingError::Rejected {
                line: record.line_name.clone(),
                source: errno,
            });
        }
        self.append_history(&entry)
    }

    fn remove(&mut self, line: &str) -> Result<bool, AccountingError> {
        let key = line_key(line);
        let _guard = UTMPX_LOCK.lock().map_err(|_| AccountingError::Poisoned)?;
        self.select_database(line)?;

        // SAFETY: serialised by UTMPX_LOCK; the entry returned by
        // getutxline is copied before the next utmpx call
        let (dead, written, errno) = unsafe {
            libc::setutxent();
            let found = libc::getutxline(&key);
            if found.is_null() || (*found).ut_type != libc::USER_PROCESS {
                libc::endutxent();
                return Ok(false);
            }
            let mut dead = *found;
            dead.ut_type = libc::DEAD_PROCESS;
            dead.ut_user.fill(0);
            dead.ut_host.fill(0);
            set_time(&mut dead, SystemTime::now());
            let written = libc::pututxline(&dead);
            let errno = Errno::last();
            libc::endutxent();
            (dead, written, errno)
        };
        if written.is_null() {
            return Err(AccountingError::Rejected {
                line: line.to_string(),
                source: errno,
            });
        }
        self.append_history(&dead)?;
        Ok(true)
    }

    fn find(&mut self, line: &str) -> Result<Option<SessionRecord>, AccountingError> {
        let key = line_key(line);
        let _guard = UTMPX_LOCK.lock().map_err(|_| AccountingError::Poisoned)?;
        self.select_database(line)?;

        // SAFETY: serialised by UTMPX_LOCK; the result is converted before
        // endutxent invalidates it
        let record = unsafe {
            libc::setutxent();
            let found = libc::getutxline(&key);
            let record = if found.is_null() || (*found).ut_type != libc::USER_PROCESS {
                None
            } else {
                Some(from_entry(&*found))
            };
            libc::endutxent();
            record
        };
        Ok(record)
    }
}

fn blank_entry() -> libc::utmpx {
    // SAFETY: utmpx is a C struct of integers and char arrays; all zero is
    // its documented empty value
    unsafe { std::mem::zeroed() }
}

fn line_key(line: &str) -> libc::utmpx {
    let mut key = blank_entry();
    fill(&mut key.ut_line, line.as_bytes());
    key
}

/// Build the utmpx entry for a record
fn to_entry(record: &SessionRecord, ut_type: libc::c_short) -> libc::utmpx {
    let mut entry = blank_entry();
    entry.ut_type = ut_type;
    entry.ut_pid = record.session_id;
    fill(&mut entry.ut_line, record.line_name.as_bytes());
    fill(&mut entry.ut_id, record.id_fragment());
    fill(&mut entry.ut_user, record.user.as_bytes());
    set_time(&mut entry, record.timestamp);
    entry
}

fn from_entry(entry: &libc::utmpx) -> SessionRecord {
    let since_epoch = Duration::from_secs(entry.ut_tv.tv_sec as u64)
        + Duration::from_micros(entry.ut_tv.tv_usec as u64);
    SessionRecord {
        session_id: entry.ut_pid,
        line_name: field(&entry.ut_line),
        user: field(&entry.ut_user),
        timestamp: UNIX_EPOCH + since_epoch,
    }
}

fn set_time(entry: &mut libc::utmpx, time: SystemTime) {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    entry.ut_tv.tv_sec = since_epoch.as_secs() as _;
    entry.ut_tv.tv_usec = since_epoch.subsec_micros() as _;
}

/// strncpy into a fixed field: truncates, NUL-pads, no terminator when full
fn fill(dst: &mut [c_char], src: &[u8]) {
    dst.fill(0);
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *s as c_char;
    }
}

fn field(src: &[c_char]) -> String {
    let bytes: Vec<u8> = src
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
