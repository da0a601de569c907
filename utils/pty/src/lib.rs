//! PTY pair and pipe provisioning for processes attached inside
//! containers.
//!
//! A container process can only open the subordinate side of a PTY as its
//! controlling terminal if the node is owned by the container's root, so
//! [`open_pty`] takes the host-side uid/gid that uid 0 maps to inside the
//! container's user namespace and chowns the subordinate accordingly.

use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;


/// An allocated PTY pair, both ends open.
#[derive(Debug)]
pub struct PtyPair {
    /// The controlling (daemon) side.
    pub master: OwnedFd,
    /// The terminal side handed to the attached process as its stdio.
    pub subordinate: OwnedFd,
}

/// An unnamed pipe.
#[derive(Debug)]
pub struct PipePair {
    pub read_end: OwnedFd,
    pub write_end: OwnedFd,
}

/// Allocates a PTY pair and chowns the subordinate to `(uid, gid)`.
pub fn open_pty(uid: u32, gid: u32) -> io::Result<PtyPair> {
    let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if master < 0 {
        return Err(io::Error::last_os_error());
    }
    let master = unsafe { OwnedFd::from_raw_fd(master) };

    if unsafe { libc::grantpt(master.as_raw_fd()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::unlockpt(master.as_raw_fd()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut name = [0 as libc::c_char; 128];
    if unsafe { libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let subordinate =
        unsafe { libc::open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if subordinate < 0 {
        return Err(io::Error::last_os_error());
    }
    let subordinate = unsafe { OwnedFd::from_raw_fd(subordinate) };

    if unsafe { libc::fchown(subordinate.as_raw_fd(), uid, gid) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(PtyPair {
        master,
        subordinate,
    })
}

/// Allocates an unnamed pipe, close-on-exec on both ends.
pub fn open_pipe() -> io::Result<PipePair> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PipePair {
        read_end: unsafe { OwnedFd::from_raw_fd(fds[0]) },
        write_end: unsafe { OwnedFd::from_raw_fd(fds[1]) },
    })
}

/// Sets the terminal window size on a PTY master.
pub fn set_window_size(fd: BorrowedFd<'_>, cols: u16, rows: u16) -> io::Result<()> {
    let size = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &size) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Switches a descriptor to non-blocking mode.
///
/// Bridges that poll a shared PTY master need reads to return
/// `WouldBlock` instead of parking the thread, so a stop request can be
/// noticed between polls.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
