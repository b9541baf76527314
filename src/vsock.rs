//! Thin AF_VSOCK stream and listener wrappers.
//!
//! Both sides of the control plane speak the framed protocol over
//! `SOCK_STREAM` vsock sockets; these wrappers are just `libc::read`,
//! `libc::write`, and `setsockopt(SO_RCVTIMEO)` around a raw fd.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Bind address wildcard for the local context id.
pub const VMADDR_CID_ANY: u32 = 0xFFFF_FFFF;

/// The host's own context id on the vsock fabric.
pub const VMADDR_CID_HOST: u32 = 2;

#[repr(C)]
struct SockaddrVm {
    svm_family: libc::sa_family_t,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_zero: [u8; 4],
}

impl SockaddrVm {
    fn new(cid: u32, port: u32) -> Self {
        Self {
            svm_family: libc::AF_VSOCK as u16,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: cid,
            svm_zero: [0; 4],
        }
    }

    fn zeroed() -> Self {
        Self::new(0, 0)
    }
}

/// A connected vsock stream. Closes the fd on drop.
pub struct VsockStream {
    fd: RawFd,
}

impl VsockStream {
    /// Connect to `cid:port`.
    pub fn connect(cid: u32, port: u32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = SockaddrVm::new(cid, port);
        let ret = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd })
    }

    /// Wrap an fd accepted from a [`VsockListener`].
    fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Bound read timeout; `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Shut down the write half, preserving framing after a failed send
    /// while inbound messages continue to drain.
    pub fn shutdown_write(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for VsockStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A listening vsock socket.
pub struct VsockListener {
    fd: RawFd,
}

impl VsockListener {
    /// Bind `VMADDR_CID_ANY:port` and listen.
    pub fn bind(port: u32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = SockaddrVm::new(VMADDR_CID_ANY, port);
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let ret = unsafe { libc::listen(fd, 32) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd })
    }

    /// Accept one connection, returning the stream and the peer's
    /// `(cid, port)`.
    pub fn accept(&self) -> io::Result<(VsockStream, u32, u32)> {
        let mut addr = SockaddrVm::zeroed();
        let mut len = std::mem::size_of::<SockaddrVm>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((VsockStream::from_fd(fd), addr.svm_cid, addr.svm_port))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for VsockListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
