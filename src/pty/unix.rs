//! Unix PTY backend
//!
//! Implements pair allocation using the POSIX PTY functions.
//!
//! # References
//!
//! - posix_openpt(3): https://man7.org/linux/man-pages/man3/posix_openpt.3.html
//! - grantpt(3), unlockpt(3), ptsname(3)
//! - tty_ioctl(4): https://man7.org/linux/man-pages/man4/tty_ioctl.4.html

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::stat::Mode;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
use nix::sys::termios::{self, InputFlags, SetArg};

use super::{PtyBackend, PtyError, PtyPair, PtyResult, WindowSize};

/// POSIX pseudoterminal backend (Linux, macOS and the BSDs)
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixBackend;

impl PtyBackend for UnixBackend {
    fn open_pair(&self) -> PtyResult<PtyPair> {
        // Open PTY master. PtyMaster closes itself on drop, so every early
        // return below releases what was opened so far.
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(|source| {
            PtyError::AllocationFailed {
                step: "posix_openpt",
                source,
            }
        })?;

        let slave_path = slave_name(&master)?;

        grantpt(&master).map_err(|source| PtyError::SlaveUnavailable {
            step: "grantpt",
            source,
        })?;
        unlockpt(&master).map_err(|source| PtyError::SlaveUnavailable {
            step: "unlockpt",
            source,
        })?;

        let slave_fd = open(
            slave_path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .map_err(|source| PtyError::SlaveUnavailable {
            step: "open slave",
            source,
        })?;
        // SAFETY: open just returned this descriptor and nothing else owns it
        let slave = unsafe { OwnedFd::from_raw_fd(slave_fd) };
        // SAFETY: into_raw_fd hands over sole ownership of the master
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };

        set_cloexec(master.as_raw_fd()).map_err(|source| PtyError::AllocationFailed {
            step: "FD_CLOEXEC on master",
            source,
        })?;
        set_cloexec(slave.as_raw_fd()).map_err(|source| PtyError::SlaveUnavailable {
            step: "FD_CLOEXEC on slave",
            source,
        })?;

        enable_utf8_input(master.as_fd())?;

        Ok(PtyPair {
            master,
            slave,
            slave_path,
        })
    }

    fn set_window_size(&self, master: BorrowedFd<'_>, size: WindowSize) -> PtyResult<()> {
        let ws = size.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
        let result = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        Errno::result(result)
            .map(drop)
            .map_err(PtyError::WindowSize)
    }

    fn window_size(&self, master: BorrowedFd<'_>) -> PtyResult<WindowSize> {
        get_window_size(master)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    nix::pty::ptsname_r(master).map_err(|source| PtyError::SlaveUnavailable {
        step: "ptsname",
        source,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out before
    // any other PTY call can run on this thread
    unsafe { nix::pty::ptsname(master) }.map_err(|source| PtyError::SlaveUnavailable {
        step: "ptsname",
        source,
    })
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

/// Whether the close-on-exec flag is set on a descriptor
pub fn is_cloexec(fd: RawFd) -> nix::Result<bool> {
    let flags = fcntl(fd, FcntlArg::F_GETFD)?;
    Ok(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC))
}

/// Turn on IUTF8 and leave every other mode bit alone
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
fn enable_utf8_input(master: BorrowedFd<'_>) -> PtyResult<()> {
    let mut attrs = termios::tcgetattr(master).map_err(|source| {
        PtyError::AttributeConfigFailed {
            step: "tcgetattr",
            source,
        }
    })?;
    attrs.input_flags.insert(InputFlags::IUTF8);
    termios::tcsetattr(master, SetArg::TCSANOW, &attrs).map_err(|source| {
        PtyError::AttributeConfigFailed {
            step: "tcsetattr",
            source,
        }
    })
}

/// The BSD line disciplines have no IUTF8 flag
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn enable_utf8_input(_master: BorrowedFd<'_>) -> PtyResult<()> {
    Ok(())
}

/// Get the window size from a PTY file descriptor
fn get_window_size(fd: BorrowedFd<'_>) -> PtyResult<WindowSize> {
    let mut ws = WindowSize::new(0, 0).to_winsize();
    // SAFETY: TIOCGWINSZ writes into a winsize struct we own
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    Errno::result(result).map_err(PtyError::WindowSize)?;
    Ok(WindowSize::from(ws))
}
