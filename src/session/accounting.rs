//! Login accounting stores
//!
//! The store is shared by every session in the process. [`Accounting`]
//! wraps one behind a single mutex so appends and removals never
//! interleave; records are keyed by line name.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use super::SessionRecord;

/// Accounting store errors
#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    #[error("Accounting store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed accounting entry: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Accounting store rejected entry for {line}: {source}")]
    Rejected {
        line: String,
        #[source]
        source: nix::Error,
    },

    #[error("Accounting store lock poisoned")]
    Poisoned,
}

/// Persistent record of live terminal sessions
pub trait AccountingStore: Send {
    /// Add a record, replacing any live record on the same line
    fn append(&mut self, record: &SessionRecord) -> Result<(), AccountingError>;

    /// End the record for `line`; returns whether one existed
    fn remove(&mut self, line: &str) -> Result<bool, AccountingError>;

    /// Look up the live record for `line`
    fn find(&mut self, line: &str) -> Result<Option<SessionRecord>, AccountingError>;
}

/// Shared handle to an accounting store
///
/// Clones share the same store and the same lock.
#[derive(Clone)]
pub struct Accounting {
    store: Arc<Mutex<Box<dyn AccountingStore>>>,
}

impl Accounting {
    pub fn new(store: impl AccountingStore + 'static) -> Self {
        Self {
            store: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    pub fn append(&self, record: &SessionRecord) -> Result<(), AccountingError> {
        self.lock()?.append(record)
    }

    pub fn remove(&self, line: &str) -> Result<bool, AccountingError> {
        self.lock()?.remove(line)
    }

    pub fn find(&self, line: &str) -> Result<Option<SessionRecord>, AccountingError> {
        self.lock()?.find(line)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn AccountingStore>>, AccountingError> {
        self.store.lock().map_err(|_| AccountingError::Poisoned)
    }
}

impl std::fmt::Debug for Accounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accounting").finish_non_exhaustive()
    }
}

/// In-process store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<SessionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountingStore for MemoryStore {
    fn append(&mut self, record: &SessionRecord) -> Result<(), AccountingError> {
        self.records.retain(|r| r.line_name != record.line_name);
        self.records.push(record.clone());
        Ok(())
    }

    fn remove(&mut self, line: &str) -> Result<bool, AccountingError> {
        let before = self.records.len();
        self.records.retain(|r| r.line_name != line);
        Ok(self.records.len() != before)
    }

    fn find(&mut self, line: &str) -> Result<Option<SessionRecord>, AccountingError> {
        Ok(self.records.iter().find(|r| r.line_name == line).cloned())
    }
}

/// Per-file locks, shared by every `FileStore` in the process
static FILE_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

/// Suffix counter for temporary files
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The lock for `path`, keyed by its absolute location so that different
/// spellings of one file share a lock
fn file_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = lock_key(path);
    let mut locks = FILE_LOCKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(key).or_default().clone()
}

fn lock_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    // The file may not exist yet; its directory usually does
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (fs::canonicalize(parent), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// JSON-lines file store, for hosts without access to the system utmp
///
/// Every change rewrites the file through a temporary sibling and a rename,
/// so readers never observe a half-written file. All handles on the same
/// file in one process share a lock, so their read-modify-write cycles
/// never interleave.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = file_lock(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All live records in the file
    pub fn records(&self) -> Result<Vec<SessionRecord>, AccountingError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AccountingError::from))
            .collect()
    }

    fn exclusive(&self) -> Result<MutexGuard<'_, ()>, AccountingError> {
        self.lock.lock().map_err(|_| AccountingError::Poisoned)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(
            ".{}.{}.tmp",
            process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        self.path.with_file_name(name)
    }

    fn write_records(&self, records: &[SessionRecord]) -> Result<(), AccountingError> {
        let tmp = self.tmp_path();
        let result = Self::write_file(&tmp, records)
            .and_then(|_| fs::rename(&tmp, &self.path).map_err(AccountingError::from));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn write_file(tmp: &Path, records: &[SessionRecord]) -> Result<(), AccountingError> {
        let mut file = fs::File::create(tmp)?;
        for record in records {
            serde_json::to_writer(&mut file, record)?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(())
    }
}

impl AccountingStore for FileStore {
    fn append(&mut self, record: &SessionRecord) -> Result<(), AccountingError> {
        let _guard = self.exclusive()?;
        let mut records = self.records()?;
        records.retain(|r| r.line_name != record.line_name);
        records.push(record.clone());
        self.write_records(&records)
    }

    fn remove(&mut self, line: &str) -> Result<bool, AccountingError> {
        let _guard = self.exclusive()?;
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|r| r.line_name != line);
        if records.len() == before {
            return Ok(false);
        }
        self.write_records(&records)?;
        Ok(true)
    }

    fn find(&mut self, line: &str) -> Result<Option<SessionRecord>, AccountingError> {
        let _guard = self.exclusive()?;
        Ok(self.records()?.into_iter().find(|r| r.line_name == line))
    }
}
