//! ptyhost: pseudoterminal hosting
//!
//! Allocates PTY pairs, runs a child program with the slave as its
//! controlling terminal, keeps login accounting in step and moves bytes
//! between the master and the hosting application without blocking.
//!
//! - `pty`: device pair allocation and release
//! - `session`: controlling terminal binding and login accounting
//! - `child`: the child process host tying everything together
//! - `mux`: readiness-driven I/O multiplexer
//! - `event`: lifecycle events for the consumer
//! - `config`: host configuration

pub mod child;
pub mod config;
pub mod event;
pub mod mux;
pub mod pty;
pub mod session;

pub use child::{ChildProcess, ChildProcessHost, ChildState, SpawnError};
pub use config::{AccountingBackend, AccountingConfig, ConfigError, HostConfig};
pub use event::LifecycleEvent;
pub use mux::{ByteSink, ChannelSink, IoMultiplexer, MuxError, Side};
pub use pty::{PtyBackend, PtyDevice, PtyError, WindowSize};
pub use session::{Accounting, AccountingStore, SessionBinder, SessionRecord};
