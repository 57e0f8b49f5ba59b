//! Backend for platforms without a PTY implementation

use super::{PtyBackend, PtyError, PtyPair, PtyResult};

/// Backend that refuses every allocation with [`PtyError::Unsupported`]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl PtyBackend for UnsupportedBackend {
    fn open_pair(&self) -> PtyResult<PtyPair> {
        Err(PtyError::Unsupported)
    }
}
