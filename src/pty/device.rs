//! The PTY device: a master/slave pair with an explicit open/closed lifecycle

use std::os::fd::{AsFd, AsRawFd, IntoRawFd, RawFd};

use tracing::debug;

use super::{DefaultBackend, PtyBackend, PtyError, PtyPair, PtyResult, WindowSize, UNSET_HANDLE};
use crate::session::line_name;

/// A pseudoterminal device pair
///
/// Created closed. [`allocate`](Self::allocate) opens the pair,
/// [`release`](Self::release) closes it again. While closed both handle
/// accessors return [`UNSET_HANDLE`].
pub struct PtyDevice<B: PtyBackend = DefaultBackend> {
    backend: B,
    pair: Option<PtyPair>,
}

impl PtyDevice<DefaultBackend> {
    /// Create a closed device using the platform backend
    pub fn new() -> Self {
        Self::with_backend(DefaultBackend::default())
    }
}

impl Default for PtyDevice<DefaultBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: PtyBackend> PtyDevice<B> {
    /// Create a closed device using a specific backend
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            pair: None,
        }
    }

    /// Open the master/slave pair
    ///
    /// Calling this on an open device does nothing; live handles are never
    /// replaced. On failure the device stays closed and nothing leaks.
    pub fn allocate(&mut self) -> PtyResult<()> {
        if let Some(pair) = &self.pair {
            debug!(path = %pair.slave_path, "PTY already allocated");
            return Ok(());
        }

        let pair = self.backend.open_pair()?;
        debug!(
            path = %pair.slave_path,
            master = pair.master.as_raw_fd(),
            slave = pair.slave.as_raw_fd(),
            "Allocated PTY pair"
        );
        self.pair = Some(pair);
        Ok(())
    }

    /// Close both descriptors
    ///
    /// Returns `true` if the device was open. Safe to call any number of
    /// times, including on a device that was never allocated.
    pub fn release(&mut self) -> bool {
        match self.pair.take() {
            Some(pair) => {
                debug!(path = %pair.slave_path, "Releasing PTY pair");
                drop(pair);
                true
            }
            None => false,
        }
    }

    /// Forget the pair without closing its descriptors
    ///
    /// For a device that must outlive its owner, such as one still held by
    /// a child that could not be stopped.
    pub(crate) fn leak(&mut self) {
        if let Some(pair) = self.pair.take() {
            debug!(path = %pair.slave_path, "Leaking PTY pair");
            let _ = pair.master.into_raw_fd();
            let _ = pair.slave.into_raw_fd();
        }
    }

    /// Whether both descriptors are currently open
    pub fn is_open(&self) -> bool {
        self.pair.is_some()
    }

    /// The master descriptor, or [`UNSET_HANDLE`] when closed
    pub fn master_handle(&self) -> RawFd {
        self.pair
            .as_ref()
            .map_or(UNSET_HANDLE, |pair| pair.master.as_raw_fd())
    }

    /// The slave descriptor, or [`UNSET_HANDLE`] when closed
    pub fn slave_handle(&self) -> RawFd {
        self.pair
            .as_ref()
            .map_or(UNSET_HANDLE, |pair| pair.slave.as_raw_fd())
    }

    /// Path of the slave device node (e.g. `/dev/pts/4`)
    pub fn slave_path(&self) -> Option<&str> {
        self.pair.as_ref().map(|pair| pair.slave_path.as_str())
    }

    /// Accounting line name of the slave (e.g. `pts/4`)
    pub fn line_name(&self) -> Option<&str> {
        self.slave_path().map(line_name)
    }

    /// Set the window size of the open pair
    pub fn set_window_size(&self, size: WindowSize) -> PtyResult<()> {
        let pair = self.pair.as_ref().ok_or(PtyError::NotOpen)?;
        self.backend.set_window_size(pair.master.as_fd(), size)
    }

    /// Read the window size of the open pair
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        let pair = self.pair.as_ref().ok_or(PtyError::NotOpen)?;
        self.backend.window_size(pair.master.as_fd())
    }
}

impl<B: PtyBackend> std::fmt::Debug for PtyDevice<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyDevice")
            .field("master", &self.master_handle())
            .field("slave", &self.slave_handle())
            .field("slave_path", &self.slave_path())
            .finish()
    }
}
