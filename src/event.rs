//! Lifecycle notifications emitted by the child process host

use std::fmt;

use serde::{Deserialize, Serialize};

/// A change in the hosted child's lifecycle
///
/// Events are queued in the order the operating system reported them and
/// consumed with [`ChildProcessHost::next_event`].
///
/// [`ChildProcessHost::next_event`]: crate::child::ChildProcessHost::next_event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The child exec'd successfully
    Started { pid: i32 },
    /// The child terminated; signal deaths are reported as 128 + signal
    Exited { code: i32 },
    /// The child could not be started
    Failed { reason: String },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Started { pid } => write!(f, "started (pid {})", pid),
            LifecycleEvent::Exited { code } => write!(f, "exited with code {}", code),
            LifecycleEvent::Failed { reason } => write!(f, "failed to start: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            LifecycleEvent::Started { pid: 42 }.to_string(),
            "started (pid 42)"
        );
        assert_eq!(
            LifecycleEvent::Exited { code: 130 }.to_string(),
            "exited with code 130"
        );
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_string(&LifecycleEvent::Exited { code: 0 }).unwrap();
        assert_eq!(json, r#"{"event":"exited","code":0}"#);

        let back: LifecycleEvent =
            serde_json::from_str(r#"{"event":"failed","reason":"exec: ENOENT"}"#).unwrap();
        assert_eq!(
            back,
            LifecycleEvent::Failed {
                reason: "exec: ENOENT".to_string()
            }
        );
    }
}
