//! Host configuration
//!
//! Loaded from JSON. Every field has a default, so a partial file (or no
//! file at all) is valid.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mux::DEFAULT_READ_BUFFER_SIZE;
use crate::pty::WindowSize;
use crate::session::{Accounting, FileStore, MemoryStore};

/// Shell used when neither the config nor `$SHELL` names a program
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Settings for one hosted child and its terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Program started by `spawn_default`
    pub program: String,
    /// Arguments passed after the program name
    pub args: Vec<String>,
    /// Value of `TERM` in the child environment
    pub term: String,
    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,
    /// Working directory of the child (inherited when unset)
    pub working_dir: Option<PathBuf>,
    /// Initial terminal size
    pub window: WindowSize,
    /// Upper bound on a single read from the master
    pub read_buffer_size: usize,
    /// How long to wait for the child to exec before giving up
    pub start_timeout_ms: u64,
    /// How long a child gets to exit after SIGHUP before SIGKILL
    pub terminate_grace_ms: u64,
    pub accounting: AccountingConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            term: "xterm-256color".to_string(),
            env: Vec::new(),
            working_dir: None,
            window: WindowSize::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            start_timeout_ms: 5000,
            terminate_grace_ms: 100,
            accounting: AccountingConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse a config from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

fn default_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Where login records go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountingBackend {
    /// The system utmp database (glibc Linux only)
    Utmpx {
        /// utmp database; `None` for the system one
        #[serde(default)]
        utmp: Option<PathBuf>,
        /// History file; `None` disables history entries
        #[serde(default = "default_wtmp")]
        wtmp: Option<PathBuf>,
    },
    /// A JSON-lines file
    File { path: PathBuf },
    /// Process memory
    Memory,
    Disabled,
}

fn default_wtmp() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/wtmp"))
}

impl Default for AccountingBackend {
    fn default() -> Self {
        Self::Utmpx {
            utmp: None,
            wtmp: default_wtmp(),
        }
    }
}

/// Login accounting settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub backend: AccountingBackend,
    /// User name written to login records; see [`resolved_user`](Self::resolved_user)
    pub user: Option<String>,
}

/// The in-memory store every host opened with [`AccountingBackend::Memory`]
/// shares
static MEMORY_STORE: OnceLock<Accounting> = OnceLock::new();

/// First candidate that is set and non-empty
fn first_non_empty(candidates: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|candidate| !candidate.is_empty())
}

impl AccountingConfig {
    /// The configured user, else `$USER`, else `$LOGNAME`, else `unknown`
    ///
    /// Empty values count as unset.
    pub fn resolved_user(&self) -> String {
        first_non_empty([
            self.user.clone(),
            env::var("USER").ok(),
            env::var("LOGNAME").ok(),
        ])
        .unwrap_or_else(|| "unknown".to_string())
    }

    /// Open the configured store; `None` when accounting is off
    ///
    /// Stores are process-wide: every host opened from a `Memory` config
    /// sees the same records, and `File` handles on one path share a lock.
    pub fn open(&self) -> Option<Accounting> {
        match &self.backend {
            AccountingBackend::Disabled => None,
            AccountingBackend::Memory => Some(
                MEMORY_STORE
                    .get_or_init(|| Accounting::new(MemoryStore::new()))
                    .clone(),
            ),
            AccountingBackend::File { path } => Some(Accounting::new(FileStore::new(path))),
            #[cfg(all(target_os = "linux", target_env = "gnu"))]
            AccountingBackend::Utmpx { utmp, wtmp } => Some(Accounting::new(
                crate::session::UtmpxStore::with_paths(utmp.clone(), wtmp.clone()),
            )),
            #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
            AccountingBackend::Utmpx { .. } => {
                tracing::warn!("utmpx accounting is not available on this platform, disabling");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRecord;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert!(!config.program.is_empty());
        assert_eq!(config.term, "xterm-256color");
        assert_eq!(config.window, WindowSize::new(80, 24));
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.start_timeout(), Duration::from_secs(5));
        assert_eq!(config.terminate_grace(), Duration::from_millis(100));
        assert!(matches!(
            config.accounting.backend,
            AccountingBackend::Utmpx {
                utmp: None,
                wtmp: Some(_)
            }
        ));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = HostConfig::from_json(
            r#"{
                "program": "/bin/bash",
                "args": ["-l"],
                "window": { "cols": 120, "rows": 40 },
                "accounting": { "backend": { "kind": "file", "path": "/tmp/s.jsonl" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.program, "/bin/bash");
        assert_eq!(config.args, vec!["-l"]);
        assert_eq!(config.window, WindowSize::new(120, 40));
        assert_eq!(config.term, "xterm-256color");
        assert_eq!(config.start_timeout_ms, 5000);
        assert_eq!(
            config.accounting.backend,
            AccountingBackend::File {
                path: PathBuf::from("/tmp/s.jsonl")
            }
        );
    }

    #[test]
    fn test_utmpx_without_wtmp() {
        let config =
            HostConfig::from_json(r#"{ "accounting": { "backend": { "kind": "utmpx", "wtmp": null } } }"#)
                .unwrap();
        assert_eq!(
            config.accounting.backend,
            AccountingBackend::Utmpx {
                utmp: None,
                wtmp: None
            }
        );

        let custom = HostConfig::from_json(
            r#"{ "accounting": { "backend": { "kind": "utmpx", "utmp": "/tmp/utmp" } } }"#,
        )
        .unwrap();
        assert_eq!(
            custom.accounting.backend,
            AccountingBackend::Utmpx {
                utmp: Some(PathBuf::from("/tmp/utmp")),
                wtmp: default_wtmp()
            }
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = HostConfig::from_json(r#"{ "accounting": { "backend": { "kind": "ldap" } } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        fs::write(&path, r#"{ "term": "vt100", "terminate_grace_ms": 250 }"#).unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.term, "vt100");
        assert_eq!(config.terminate_grace(), Duration::from_millis(250));

        let missing = HostConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn test_explicit_user_wins() {
        let accounting = AccountingConfig {
            backend: AccountingBackend::Disabled,
            user: Some("operator".to_string()),
        };
        assert_eq!(accounting.resolved_user(), "operator");
        assert!(!AccountingConfig::default().resolved_user().is_empty());
    }

    #[test]
    fn test_empty_user_falls_through() {
        assert_eq!(
            first_non_empty([Some(String::new()), Some("alice".to_string()), None]),
            Some("alice".to_string())
        );
        assert_eq!(
            first_non_empty([None, Some(String::new()), Some("bob".to_string())]),
            Some("bob".to_string())
        );
        assert_eq!(first_non_empty([Some(String::new()), None]), None);

        let blank = AccountingConfig {
            backend: AccountingBackend::Disabled,
            user: Some(String::new()),
        };
        let from_env = first_non_empty([env::var("USER").ok(), env::var("LOGNAME").ok()]);
        assert_eq!(
            blank.resolved_user(),
            from_env.unwrap_or_else(|| "unknown".to_string())
        );
    }

    #[test]
    fn test_memory_hosts_share_one_store() {
        let config = AccountingConfig {
            backend: AccountingBackend::Memory,
            user: None,
        };
        let first = config.open().unwrap();
        let second = config.clone().open().unwrap();

        first
            .append(&SessionRecord::new(31, "pts/shared-memory", "alice"))
            .unwrap();
        assert_eq!(
            second.find("pts/shared-memory").unwrap().map(|r| r.session_id),
            Some(31)
        );
        assert!(second.remove("pts/shared-memory").unwrap());
        assert!(first.find("pts/shared-memory").unwrap().is_none());
    }

    #[test]
    fn test_file_handles_from_one_config_do_not_lose_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.jsonl");
        let config = AccountingConfig {
            backend: AccountingBackend::File { path: path.clone() },
            user: None,
        };

        let handles: Vec<_> = (0..16)
            .map(|t| {
                let accounting = config.open().unwrap();
                std::thread::spawn(move || {
                    for n in 0..20 {
                        let line = format!("pts/{}-{}", t, n);
                        accounting
                            .append(&SessionRecord::new(t * 100 + n, &line, "user"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(FileStore::new(&path).records().unwrap().len(), 320);
    }

    #[test]
    fn test_open_backends() {
        let disabled = AccountingConfig {
            backend: AccountingBackend::Disabled,
            user: None,
        };
        assert!(disabled.open().is_none());

        let memory = AccountingConfig {
            backend: AccountingBackend::Memory,
            user: None,
        };
        let store = memory.open().unwrap();
        store.append(&SessionRecord::new(1, "pts/open-backends", "alice")).unwrap();
        assert!(store.find("pts/open-backends").unwrap().is_some());
        assert!(store.remove("pts/open-backends").unwrap());

        let dir = tempfile::tempdir().unwrap();
        let file = AccountingConfig {
            backend: AccountingBackend::File {
                path: dir.path().join("sessions.jsonl"),
            },
            user: None,
        };
        let store = file.open().unwrap();
        store.append(&SessionRecord::new(2, "pts/2", "bob")).unwrap();
        assert!(dir.path().join("sessions.jsonl").exists());
    }
}
