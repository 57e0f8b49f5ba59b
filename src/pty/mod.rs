//! PTY (pseudoterminal) device handling
//!
//! This module owns the master/slave descriptor pair: allocation in the
//! order the OS requires, close-on-exec hardening, the UTF-8 input mode and
//! release. The platform-specific sequence lives behind [`PtyBackend`] so
//! that unsupported platforms report [`PtyError::Unsupported`].

mod device;
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod unix;
mod unsupported;

use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use nix::libc;
use serde::{Deserialize, Serialize};

pub use device::PtyDevice;
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use unix::{is_cloexec, UnixBackend};
pub use unsupported::UnsupportedBackend;

/// Backend used by [`PtyDevice::new`] on this platform
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub type DefaultBackend = UnixBackend;

/// Backend used by [`PtyDevice::new`] on this platform
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
pub type DefaultBackend = UnsupportedBackend;

/// Value reported for a handle that is not currently open
pub const UNSET_HANDLE: RawFd = -1;

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to allocate PTY master ({step}): {source}")]
    AllocationFailed {
        step: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("PTY slave unavailable ({step}): {source}")]
    SlaveUnavailable {
        step: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to configure terminal attributes ({step}): {source}")]
    AttributeConfigFailed {
        step: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Pseudoterminals are not supported on this platform")]
    Unsupported,

    #[error("PTY device is not open")]
    NotOpen,

    #[error("Failed to set window size: {0}")]
    WindowSize(#[source] nix::Error),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// An open master/slave pair
///
/// Both descriptors are owned; dropping the pair closes each exactly once.
#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub slave_path: String,
}

/// Platform primitives needed by [`PtyDevice`]
pub trait PtyBackend {
    /// Open a new pair: control end, slave name, grant, unlock, slave open,
    /// close-on-exec on both ends, then the attribute update.
    ///
    /// Implementations must not leak descriptors when they fail partway.
    fn open_pair(&self) -> PtyResult<PtyPair>;

    /// Apply a window size to the master side
    fn set_window_size(&self, _master: BorrowedFd<'_>, _size: WindowSize) -> PtyResult<()> {
        Err(PtyError::Unsupported)
    }

    /// Read the window size currently set on the pair
    fn window_size(&self, _master: BorrowedFd<'_>) -> PtyResult<WindowSize> {
        Err(PtyError::Unsupported)
    }
}

/// Window size for PTY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub pixel_width: u16,
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size with just rows and columns
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a new window size with pixel dimensions
    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Convert to libc winsize structure
    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}
