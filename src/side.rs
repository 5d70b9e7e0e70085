//! One direction of a stream's transport
//!
//! A [`Side`] owns a single OS descriptor. A stream has two of them: the
//! receive side and the transmit side. They may refer to the same socket
//! (through a `dup`) or to two unrelated pipes, as with SSH where the
//! remote stdin and stdout are separate.

use crate::latch::lock;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

fn update_status_flags(fd: RawFd, update: impl FnOnce(libc::c_int) -> libc::c_int) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL only touch the descriptor's status flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, update(flags)) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    update_status_flags(fd, |flags| flags | libc::O_NONBLOCK)
}

/// Put a descriptor back into blocking mode
pub fn set_blocking(fd: RawFd) -> io::Result<()> {
    update_status_flags(fd, |flags| flags & !libc::O_NONBLOCK)
}

/// Mark a descriptor close-on-exec
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch the descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Take ownership of a raw descriptor inherited from a parent process
///
/// # Safety
///
/// `fd` must be open and not owned by anything else in this process.
pub unsafe fn adopt_fd(fd: RawFd) -> OwnedFd {
    OwnedFd::from_raw_fd(fd)
}

/// One readable or writable endpoint with its own lifecycle
#[derive(Debug)]
pub struct Side {
    label: &'static str,
    raw: RawFd,
    file: Mutex<Option<File>>,
}

impl Side {
    /// Wrap a descriptor, switching it to non-blocking mode
    pub fn new(label: &'static str, fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        set_nonblocking(raw)?;
        Ok(Self {
            label,
            raw,
            file: Mutex::new(Some(File::from(fd))),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// The descriptor number while open
    pub fn raw_fd(&self) -> Option<RawFd> {
        lock(&self.file).as_ref().map(|_| self.raw)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.file).is_none()
    }

    /// Read once. Closed sides report end of file.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = lock(&self.file);
        match guard.as_ref() {
            Some(mut file) => file.read(buf),
            None => Ok(0),
        }
    }

    /// Write once; the caller handles short writes
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = lock(&self.file);
        match guard.as_ref() {
            Some(mut file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "side is closed")),
        }
    }

    /// Close the descriptor. Safe to call any number of times.
    pub fn close(&self) -> bool {
        let closed = lock(&self.file).take();
        let was_open = closed.is_some();
        if was_open {
            tracing::trace!(side = self.label, fd = self.raw, "closing side");
        }
        drop(closed);
        was_open
    }
}
