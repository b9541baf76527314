//! Scoped raw-mode terminal handling.
//!
//! The client puts the controlling terminal into raw mode for the lifetime
//! of the session; the guard restores the saved termios on every exit path,
//! including panics and early returns.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};

/// Puts `fd` into raw mode on construction and restores the previous
/// settings on drop.
pub struct RawTerminalGuard<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Termios,
}

impl<'fd> RawTerminalGuard<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> nix::Result<Self> {
        let saved = tcgetattr(fd)?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(fd, SetArg::TCSANOW, &raw)?;
        Ok(Self { fd, saved })
    }
}

impl Drop for RawTerminalGuard<'_> {
    fn drop(&mut self) {
        let _ = tcsetattr(self.fd, SetArg::TCSANOW, &self.saved);
    }
}

/// Current window size of `fd`, or `(0, 0)` when it is not a terminal.
pub fn window_size(fd: BorrowedFd<'_>) -> (u32, u32) {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
    if ret < 0 {
        return (0, 0);
    }
    (ws.ws_row as u32, ws.ws_col as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
    use nix::sys::termios::LocalFlags;
    use std::os::fd::AsFd;

    fn open_test_tty() -> std::fs::File {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let pts = ptsname_r(&master).unwrap();
        // Keep the master alive for the rest of the test process; the
        // kernel frees the pair on exit.
        std::mem::forget(master);
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(pts)
            .unwrap()
    }

    #[test]
    fn guard_sets_raw_and_restores_on_drop() {
        let tty = open_test_tty();
        let before = tcgetattr(tty.as_fd()).unwrap();
        assert!(before.local_flags.contains(LocalFlags::ICANON));

        {
            let _guard = RawTerminalGuard::new(tty.as_fd()).unwrap();
            let raw = tcgetattr(tty.as_fd()).unwrap();
            assert!(!raw.local_flags.contains(LocalFlags::ICANON));
            assert!(!raw.local_flags.contains(LocalFlags::ECHO));
        }

        let after = tcgetattr(tty.as_fd()).unwrap();
        assert!(after.local_flags.contains(LocalFlags::ICANON));
    }

    #[test]
    fn guard_restores_after_panic() {
        let tty = open_test_tty();
        let before = tcgetattr(tty.as_fd()).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = RawTerminalGuard::new(tty.as_fd()).unwrap();
            panic!("session blew up");
        }));
        assert!(result.is_err());

        let after = tcgetattr(tty.as_fd()).unwrap();
        assert_eq!(after.local_flags, before.local_flags);
        assert_eq!(after.input_flags, before.input_flags);
    }

    #[test]
    fn window_size_of_non_tty_is_zero() {
        let null = std::fs::File::open("/dev/null").unwrap();
        assert_eq!(window_size(null.as_fd()), (0, 0));
    }
}
