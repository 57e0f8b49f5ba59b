//! End-to-end tests of the child process host
//!
//! These run real programs on real pseudoterminals, with login records
//! going to a temporary JSON-lines file.

use std::time::{Duration, Instant};

use ptyhost::session::FileStore;
use ptyhost::{
    AccountingBackend, AccountingConfig, ChildProcessHost, ChildState, HostConfig, LifecycleEvent,
    Side, SpawnError,
};
use tempfile::TempDir;

struct Fixture {
    host: ChildProcessHost,
    store: FileStore,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("sessions.jsonl");
    let config = HostConfig {
        accounting: AccountingConfig {
            backend: AccountingBackend::File { path: path.clone() },
            user: Some("tester".to_string()),
        },
        ..HostConfig::default()
    };
    Fixture {
        host: ChildProcessHost::new(config),
        store: FileStore::new(path),
        _dir: dir,
    }
}

/// Pump until the child leaves Running, returning everything read from the
/// master
fn run_to_exit(host: &mut ChildProcessHost) -> Vec<u8> {
    let mut output = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while host.child().is_running() {
        assert!(Instant::now() < deadline, "child did not exit in time");
        host.pump(Duration::from_millis(20), &mut |side: Side, bytes: &[u8]| {
            if side == Side::Master {
                output.extend_from_slice(bytes);
            }
        })
        .expect("pump failed");
    }
    output
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_true_runs_to_exit_and_logs_out() {
    let mut fx = fixture();

    let child = fx.host.spawn("/bin/true", &[]).expect("Failed to spawn");
    assert_eq!(child.state, ChildState::Running);
    let pid = child.pid.expect("running child has a pid").as_raw();
    let line = fx.host.device().line_name().unwrap().to_string();

    let record = fx.store.records().unwrap();
    assert_eq!(record.len(), 1);
    assert_eq!(record[0].line_name, line);
    assert_eq!(record[0].session_id, pid);
    assert_eq!(record[0].user, "tester");

    run_to_exit(&mut fx.host);

    assert_eq!(fx.host.child().state, ChildState::Exited(0));
    assert!(!fx.host.device().is_open());
    assert!(fx.store.records().unwrap().is_empty());
    assert_eq!(
        fx.host.drain_events(),
        vec![
            LifecycleEvent::Started { pid },
            LifecycleEvent::Exited { code: 0 }
        ]
    );

    // Released exactly once: the host has nothing left to release
    assert!(!fx.host.release_device().unwrap());
}

#[test]
fn test_missing_program_fails_to_start() {
    let mut fx = fixture();

    let err = fx
        .host
        .spawn("/nonexistent/ptyhost-program", &[])
        .unwrap_err();
    let reason = match err {
        SpawnError::StartFailed(reason) => reason,
        other => panic!("expected StartFailed, got {}", other),
    };
    assert!(reason.starts_with("exec"), "{}", reason);

    assert!(matches!(fx.host.child().state, ChildState::Failed(_)));
    assert!(fx.host.device().is_open());
    assert!(fx.store.records().unwrap().is_empty());
    assert_eq!(
        fx.host.next_event(),
        Some(LifecycleEvent::Failed { reason })
    );

    // Caller releases; a retry on the same host then works
    assert!(fx.host.release_device().unwrap());
    fx.host.spawn("/bin/true", &[]).expect("retry failed");
    run_to_exit(&mut fx.host);
}

#[test]
fn test_terminate_stops_child_and_allows_reallocation() {
    let mut fx = fixture();

    fx.host.spawn("/bin/cat", &[]).expect("Failed to spawn");
    assert!(fx.host.child().is_running());

    let state = fx.host.terminate().expect("terminate failed");
    assert!(matches!(state, ChildState::Exited(code) if code != 0));
    assert!(!fx.host.child().is_running());
    assert!(!fx.host.device().is_open());
    assert!(fx.store.records().unwrap().is_empty());

    // Terminating again is harmless
    assert_eq!(fx.host.terminate().unwrap(), state);

    fx.host.open().expect("allocate after terminate failed");
    assert!(fx.host.device().is_open());
}

#[test]
fn test_output_is_relayed() {
    let mut fx = fixture();

    fx.host
        .spawn("/bin/echo", &["hello", "pty"])
        .expect("Failed to spawn");
    let output = run_to_exit(&mut fx.host);

    assert!(contains(&output, b"hello pty"), "{:?}", String::from_utf8_lossy(&output));
    assert_eq!(fx.host.child().state, ChildState::Exited(0));
}

#[test]
fn test_input_reaches_child() {
    let mut fx = fixture();

    fx.host
        .spawn("/bin/sh", &["-c", "read line && echo \"got:$line\""])
        .expect("Failed to spawn");
    fx.host.write(b"ping\n").unwrap();
    let output = run_to_exit(&mut fx.host);

    assert!(contains(&output, b"got:ping"), "{:?}", String::from_utf8_lossy(&output));
}

#[test]
fn test_child_has_controlling_terminal() {
    let mut fx = fixture();

    fx.host
        .spawn("/bin/sh", &["-c", "exec 3</dev/tty && test -t 0 && echo has-tty"])
        .expect("Failed to spawn");
    let output = run_to_exit(&mut fx.host);

    assert!(contains(&output, b"has-tty"), "{:?}", String::from_utf8_lossy(&output));
    assert_eq!(fx.host.child().state, ChildState::Exited(0));
}

#[test]
fn test_exit_code_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
        term: "vt220".to_string(),
        env: vec![("PTYHOST_GREETING".to_string(), "hi".to_string())],
        working_dir: Some(dir.path().to_path_buf()),
        accounting: AccountingConfig {
            backend: AccountingBackend::Disabled,
            user: None,
        },
        ..HostConfig::default()
    };
    let mut host = ChildProcessHost::new(config);

    host.spawn(
        "sh",
        &["-c", "echo \"$TERM $PTYHOST_GREETING $(pwd)\"; exit 3"],
    )
    .expect("Failed to spawn");
    let output = run_to_exit(&mut host);
    let text = String::from_utf8_lossy(&output);

    assert!(text.contains("vt220 hi"), "{}", text);
    let dir_name = dir.path().file_name().unwrap().to_string_lossy();
    assert!(text.contains(dir_name.as_ref()), "{}", text);
    assert_eq!(host.child().state, ChildState::Exited(3));
}

#[test]
fn test_signal_death_is_reported_as_128_plus_signal() {
    let mut fx = fixture();

    fx.host
        .spawn("/bin/sh", &["-c", "kill -KILL $$"])
        .expect("Failed to spawn");
    run_to_exit(&mut fx.host);

    assert_eq!(fx.host.child().state, ChildState::Exited(128 + 9));
}

#[test]
fn test_concurrent_hosts_keep_separate_records() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("shared.jsonl");
    let config = |user: &str| HostConfig {
        accounting: AccountingConfig {
            backend: AccountingBackend::File {
                path: shared.clone(),
            },
            user: Some(user.to_string()),
        },
        ..HostConfig::default()
    };
    let store = FileStore::new(&shared);

    let mut a = ChildProcessHost::new(config("alice"));
    let mut b = ChildProcessHost::new(config("bob"));
    a.spawn("/bin/cat", &[]).unwrap();
    b.spawn("/bin/cat", &[]).unwrap();
    let line_b = b.device().line_name().unwrap().to_string();
    assert_ne!(a.device().line_name(), b.device().line_name());
    assert_eq!(store.records().unwrap().len(), 2);

    a.terminate().unwrap();
    let remaining = store.records().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].line_name, line_b);
    assert_eq!(remaining[0].user, "bob");

    b.terminate().unwrap();
    assert!(store.records().unwrap().is_empty());
}
