//! Readiness-driven I/O between PTY descriptors and the hosting application
//!
//! The multiplexer never blocks the control loop on a read or write. Each
//! call to [`IoMultiplexer::poll_once`] waits (up to a timeout) for
//! readiness on the registered descriptors, performs one bounded read per
//! readable side and writes as much queued output as each writable side
//! accepts. Read data goes to a [`ByteSink`]; an empty delivery means the
//! far end closed.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::mpsc::Sender;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

/// Size of the bounded read performed on each read-ready notification
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Which end of the pair a descriptor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Master,
    Slave,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Master => 0,
            Side::Slave => 1,
        }
    }
}

/// Consumer of bytes read from a registered descriptor
pub trait ByteSink {
    /// Called once per read; `bytes` is empty at end of file
    fn deliver(&mut self, side: Side, bytes: &[u8]);
}

impl<F: FnMut(Side, &[u8])> ByteSink for F {
    fn deliver(&mut self, side: Side, bytes: &[u8]) {
        self(side, bytes)
    }
}

/// Forwards every delivery over a channel, for hosts that consume on
/// another thread
#[derive(Debug, Clone)]
pub struct ChannelSink(pub Sender<(Side, Vec<u8>)>);

impl ByteSink for ChannelSink {
    fn deliver(&mut self, side: Side, bytes: &[u8]) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.0.send((side, bytes.to_vec()));
    }
}

/// Multiplexer errors
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("Failed to register {side:?} descriptor: {source}")]
    Register {
        side: Side,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to poll: {0}")]
    Poll(#[source] nix::Error),

    #[error("Failed to read from {side:?}: {source}")]
    Read {
        side: Side,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to write to {side:?}: {source}")]
    Write {
        side: Side,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug)]
struct Registration {
    fd: RawFd,
    /// Status flags before registration, restored when the side is
    /// disabled or unregistered
    saved_flags: OFlag,
    enabled: bool,
    /// Cleared once end of file has been delivered
    readable: bool,
}

/// Non-blocking I/O pump for the master and (optionally) slave descriptor
#[derive(Debug)]
pub struct IoMultiplexer {
    buffer: Vec<u8>,
    sides: [Option<Registration>; 2],
    outbound: [VecDeque<u8>; 2],
}

impl Default for IoMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BUFFER_SIZE)
    }
}

impl IoMultiplexer {
    /// Create a multiplexer that reads at most `buffer_size` bytes per
    /// notification
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer: vec![0; buffer_size.max(1)],
            sides: [None, None],
            outbound: [VecDeque::new(), VecDeque::new()],
        }
    }

    /// Watch `fd` as `side`, replacing any previous registration
    ///
    /// The descriptor is switched to non-blocking mode. It stays owned by
    /// the caller, who must [`unregister`](Self::unregister) it before
    /// closing it.
    pub fn register(&mut self, side: Side, fd: BorrowedFd<'_>) -> Result<(), MuxError> {
        self.unregister(side);
        let fd = fd.as_raw_fd();
        let saved_flags = get_flags(fd).map_err(|source| MuxError::Register { side, source })?;
        set_flags(fd, saved_flags | OFlag::O_NONBLOCK)
            .map_err(|source| MuxError::Register { side, source })?;

        debug!(?side, fd, "Registered descriptor");
        self.sides[side.index()] = Some(Registration {
            fd,
            saved_flags,
            enabled: true,
            readable: true,
        });
        Ok(())
    }

    /// Stop watching `side`, restore its flags and drop its queued output
    pub fn unregister(&mut self, side: Side) {
        self.outbound[side.index()].clear();
        if let Some(reg) = self.sides[side.index()].take() {
            if reg.enabled {
                let _ = set_flags(reg.fd, reg.saved_flags);
            }
            debug!(?side, fd = reg.fd, "Unregistered descriptor");
        }
    }

    /// The descriptor currently registered for `side`
    pub fn registered(&self, side: Side) -> Option<RawFd> {
        self.sides[side.index()].as_ref().map(|reg| reg.fd)
    }

    /// Resume notifications for a registered side
    pub fn enable(&mut self, side: Side) -> Result<(), MuxError> {
        if let Some(reg) = self.sides[side.index()].as_mut() {
            if !reg.enabled {
                set_flags(reg.fd, reg.saved_flags | OFlag::O_NONBLOCK)
                    .map_err(|source| MuxError::Register { side, source })?;
                reg.enabled = true;
            }
        }
        Ok(())
    }

    /// Suspend notifications for `side` and put its descriptor back in
    /// its original blocking mode
    ///
    /// Used on the slave side once a child owns it: the child's standard
    /// streams share the slave's file description.
    pub fn disable(&mut self, side: Side) {
        if let Some(reg) = self.sides[side.index()].as_mut() {
            if reg.enabled {
                let _ = set_flags(reg.fd, reg.saved_flags);
                reg.enabled = false;
            }
        }
    }

    pub fn is_enabled(&self, side: Side) -> bool {
        self.sides[side.index()]
            .as_ref()
            .is_some_and(|reg| reg.enabled)
    }

    /// Queue bytes for writing to `side` on its next write-ready
    /// notification
    pub fn queue(&mut self, side: Side, bytes: &[u8]) {
        self.outbound[side.index()].extend(bytes);
    }

    /// Number of bytes still queued for `side`
    pub fn pending(&self, side: Side) -> usize {
        self.outbound[side.index()].len()
    }

    /// Wait up to `timeout` for readiness and service every ready side once
    ///
    /// Returns the number of bytes moved (read plus written). Write
    /// interest is only armed while a side has queued output.
    pub fn poll_once<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<usize, MuxError>
    where
        S: ByteSink + ?Sized,
    {
        let mut watched: Vec<(Side, RawFd, PollFlags)> = Vec::with_capacity(2);
        for side in [Side::Master, Side::Slave] {
            let Some(reg) = self.sides[side.index()].as_ref().filter(|r| r.enabled) else {
                continue;
            };
            let mut interest = PollFlags::empty();
            if reg.readable {
                interest |= PollFlags::POLLIN;
            }
            if !self.outbound[side.index()].is_empty() {
                interest |= PollFlags::POLLOUT;
            }
            if !interest.is_empty() {
                watched.push((side, reg.fd, interest));
            }
        }
        if watched.is_empty() {
            return Ok(0);
        }

        let ready: Vec<(Side, PollFlags)> = {
            let mut fds: Vec<PollFd<'_>> = watched
                .iter()
                // SAFETY: registered descriptors stay open until unregistered
                .map(|&(_, fd, interest)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, interest))
                .collect();

            match poll(&mut fds, poll_timeout(timeout)) {
                Ok(0) => return Ok(0),
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(0),
                Err(e) => return Err(MuxError::Poll(e)),
            }

            watched
                .iter()
                .zip(&fds)
                .map(|(&(side, _, _), pfd)| (side, pfd.revents().unwrap_or(PollFlags::empty())))
                .collect()
        };

        let mut moved = 0;
        for (side, revents) in ready {
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                moved += self.read_once(side, sink)?;
            }
            if revents.contains(PollFlags::POLLOUT) {
                moved += self.flush(side)?;
            }
        }
        Ok(moved)
    }

    /// Read everything currently available on `side` without waiting
    ///
    /// Used to collect a finished child's last output before the device
    /// is released.
    pub fn drain<S>(&mut self, side: Side, sink: &mut S) -> Result<usize, MuxError>
    where
        S: ByteSink + ?Sized,
    {
        let mut total = 0;
        loop {
            let readable = self.sides[side.index()]
                .as_ref()
                .is_some_and(|reg| reg.enabled && reg.readable);
            if !readable {
                return Ok(total);
            }
            match self.read_once(side, sink)? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }

    /// One bounded read; returns the byte count (0 for nothing or EOF)
    fn read_once<S>(&mut self, side: Side, sink: &mut S) -> Result<usize, MuxError>
    where
        S: ByteSink + ?Sized,
    {
        let Some(reg) = self.sides[side.index()].as_mut() else {
            return Ok(0);
        };

        match read_fd(reg.fd, &mut self.buffer) {
            Ok(0) | Err(Errno::EIO) => {
                // A pty master reports EIO instead of EOF once the slave
                // side has no open descriptors left
                debug!(?side, "End of file");
                reg.readable = false;
                sink.deliver(side, &[]);
                Ok(0)
            }
            Ok(n) => {
                trace!(?side, n, "Read");
                sink.deliver(side, &self.buffer[..n]);
                Ok(n)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(source) => Err(MuxError::Read { side, source }),
        }
    }

    /// Write as much queued output as the descriptor accepts
    fn flush(&mut self, side: Side) -> Result<usize, MuxError> {
        let Some(reg) = self.sides[side.index()].as_ref() else {
            return Ok(0);
        };
        let queue = &mut self.outbound[side.index()];
        if queue.is_empty() {
            return Ok(0);
        }

        match write_fd(reg.fd, queue.make_contiguous()) {
            Ok(n) => {
                trace!(?side, n, remaining = queue.len() - n, "Wrote");
                queue.drain(..n);
                Ok(n)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(source) => Err(MuxError::Write { side, source }),
        }
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis)
}

fn get_flags(fd: RawFd) -> nix::Result<OFlag> {
    fcntl(fd, FcntlArg::F_GETFL).map(OFlag::from_bits_truncate)
}

fn set_flags(fd: RawFd, flags: OFlag) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(flags)).map(drop)
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    Errno::result(n).map(|n| n as usize)
}

fn write_fd(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    // SAFETY: buf is valid for reads of buf.len() bytes
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    Errno::result(n).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use std::os::fd::{AsFd, AsRawFd};
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().expect("Failed to create socket pair")
    }

    /// Pump until `want` bytes have arrived on `side` or the deadline passes
    fn collect(mux: &mut IoMultiplexer, side: Side, want: usize) -> Vec<u8> {
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.len() < want && Instant::now() < deadline {
            mux.poll_once(Duration::from_millis(20), &mut |s: Side, bytes: &[u8]| {
                if s == side {
                    received.extend_from_slice(bytes);
                }
            })
            .unwrap();
        }
        received
    }

    #[test]
    fn test_register_sets_and_restores_nonblocking() {
        let (a, _b) = pair();
        let before = get_flags(a.as_raw_fd()).unwrap();
        assert!(!before.contains(OFlag::O_NONBLOCK));

        let mut mux = IoMultiplexer::default();
        mux.register(Side::Master, a.as_fd()).unwrap();
        let fd = mux.registered(Side::Master).unwrap();
        assert!(get_flags(fd).unwrap().contains(OFlag::O_NONBLOCK));

        mux.disable(Side::Master);
        assert!(!mux.is_enabled(Side::Master));
        assert!(!get_flags(fd).unwrap().contains(OFlag::O_NONBLOCK));

        mux.enable(Side::Master).unwrap();
        assert!(get_flags(fd).unwrap().contains(OFlag::O_NONBLOCK));

        mux.unregister(Side::Master);
        assert!(mux.registered(Side::Master).is_none());
        assert!(!get_flags(fd).unwrap().contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_bytes_cross_between_sides() {
        let (a, b) = pair();
        let mut mux = IoMultiplexer::default();
        mux.register(Side::Master, a.as_fd()).unwrap();
        mux.register(Side::Slave, b.as_fd()).unwrap();

        mux.queue(Side::Master, b"hello ");
        mux.queue(Side::Master, b"world");
        assert_eq!(mux.pending(Side::Master), 11);

        let received = collect(&mut mux, Side::Slave, 11);
        assert_eq!(received, b"hello world");
        assert_eq!(mux.pending(Side::Master), 0);
    }

    #[test]
    fn test_reads_are_bounded() {
        let (a, b) = pair();
        let mut mux = IoMultiplexer::new(4);
        mux.register(Side::Master, a.as_fd()).unwrap();
        mux.register(Side::Slave, b.as_fd()).unwrap();
        mux.queue(Side::Slave, b"0123456789");

        let mut chunks = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while chunks.iter().map(Vec::len).sum::<usize>() < 10 && Instant::now() < deadline {
            mux.poll_once(Duration::from_millis(20), &mut |side: Side, bytes: &[u8]| {
                if side == Side::Master && !bytes.is_empty() {
                    chunks.push(bytes.to_vec());
                }
            })
            .unwrap();
        }

        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.concat(), b"0123456789");
    }

    #[test]
    fn test_eof_is_delivered_as_empty_read() {
        let (a, b) = pair();
        let mut mux = IoMultiplexer::default();
        mux.register(Side::Master, a.as_fd()).unwrap();
        drop(b);

        let mut deliveries = Vec::new();
        mux.poll_once(Duration::from_secs(1), &mut |side: Side, bytes: &[u8]| {
            deliveries.push((side, bytes.to_vec()));
        })
        .unwrap();
        assert_eq!(deliveries, vec![(Side::Master, Vec::new())]);

        // No further read interest once EOF was seen
        deliveries.clear();
        let moved = mux
            .poll_once(Duration::from_millis(10), &mut |side: Side, bytes: &[u8]| {
                deliveries.push((side, bytes.to_vec()));
            })
            .unwrap();
        assert_eq!(moved, 0);
        assert!(deliveries.is_empty());
    }

    #[test]
    fn test_disabled_side_is_ignored() {
        let (a, b) = pair();
        let mut mux = IoMultiplexer::default();
        mux.register(Side::Slave, a.as_fd()).unwrap();
        mux.disable(Side::Slave);

        (&b).write_all(b"ignored").unwrap();
        let mut delivered = 0;
        let moved = mux
            .poll_once(Duration::from_millis(10), &mut |_: Side, _: &[u8]| {
                delivered += 1;
            })
            .unwrap();
        assert_eq!(moved, 0);
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut sink = ChannelSink(tx);
        sink.deliver(Side::Master, b"abc");
        assert_eq!(rx.recv().unwrap(), (Side::Master, b"abc".to_vec()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunked_writes_arrive_in_order(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..16)
        ) {
            let (a, b) = pair();
            let mut mux = IoMultiplexer::new(64);
            mux.register(Side::Master, a.as_fd()).unwrap();
            mux.register(Side::Slave, b.as_fd()).unwrap();

            let expected: Vec<u8> = chunks.concat();
            for chunk in &chunks {
                mux.queue(Side::Master, chunk);
            }

            let received = collect(&mut mux, Side::Slave, expected.len());
            prop_assert_eq!(received, expected);
        }
    }
}
