//! shell-agent - guest-side shell forwarder daemon.
//!
//! Listens on a well-known vsock port, forks a forwarder process per
//! accepted connection, and reaps finished forwarders through a signalfd so
//! the accept loop never takes a signal mid-syscall.

mod forwarder;

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use clap::Parser;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vm_relay_protocol::SHELL_PORT;

use crate::forwarder::Forwarder;

#[derive(Parser)]
#[command(name = "shell-agent", about = "vsock shell forwarder")]
struct Args {
    /// Vsock port to listen on.
    #[arg(long, default_value_t = SHELL_PORT)]
    port: u32,

    /// Pass the daemon's environment through to target processes
    /// (request env still overrides).
    #[arg(long)]
    inherit_env: bool,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let listener = match create_vsock_listener(args.port) {
        Ok(fd) => fd,
        Err(e) => {
            error!(port = args.port, "failed to create vsock listener: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };
    info!(port = args.port, "listening for shell connections");

    // Route SIGCHLD and SIGTERM through a signalfd; the original mask is
    // restored in each forked forwarder before it handles its own signals.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    let mut saved_mask = SigSet::empty();
    if let Err(e) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut saved_mask)) {
        error!("failed to block signals: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    let mut sigfd =
        match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => fd,
            Err(e) => {
                error!("failed to create signalfd: {}", e);
                return std::process::ExitCode::FAILURE;
            }
        };

    loop {
        let (signal_ready, accept_ready) = {
            let mut fds = [
                PollFd::new(sigfd.as_fd(), PollFlags::POLLIN),
                PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    error!("poll failed: {}", e);
                    return std::process::ExitCode::FAILURE;
                }
            }
            let ready = |fd: &PollFd| {
                fd.revents()
                    .map(|r| r.intersects(PollFlags::POLLIN))
                    .unwrap_or(false)
            };
            (ready(&fds[0]), ready(&fds[1]))
        };

        if signal_ready {
            match drain_signals(&mut sigfd) {
                SignalAction::Continue => {}
                SignalAction::Terminate => {
                    info!("SIGTERM, exiting");
                    return std::process::ExitCode::SUCCESS;
                }
            }
        }

        if accept_ready {
            let conn = match accept_connection(listener.as_raw_fd()) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    // The forwarder owns its own signal handling; hand back
                    // the mask it expects and drop the daemon's fds.
                    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&saved_mask), None);
                    drop(sigfd);
                    drop(listener);
                    let code = Forwarder::run(conn, args.inherit_env);
                    std::process::exit(code);
                }
                Ok(ForkResult::Parent { .. }) => {
                    // Connection fd closes here; the forwarder child keeps
                    // its duplicate.
                }
                Err(e) => warn!("fork failed: {}", e),
            }
        }
    }
}

enum SignalAction {
    Continue,
    Terminate,
}

fn drain_signals(sigfd: &mut SignalFd) -> SignalAction {
    while let Ok(Some(siginfo)) = sigfd.read_signal() {
        match siginfo.ssi_signo as i32 {
            libc::SIGCHLD => {
                // Reap every finished forwarder.
                while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    match status {
                        nix::sys::wait::WaitStatus::StillAlive => break,
                        _ => continue,
                    }
                }
            }
            libc::SIGTERM => return SignalAction::Terminate,
            other => warn!("unexpected signal {}", other),
        }
    }
    SignalAction::Continue
}

fn create_vsock_listener(port: u32) -> Result<OwnedFd, std::io::Error> {
    #[repr(C)]
    struct SockaddrVm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_zero: [u8; 4],
    }

    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let addr = SockaddrVm {
        svm_family: libc::AF_VSOCK as u16,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: 0xFFFF_FFFF, // VMADDR_CID_ANY
        svm_zero: [0; 4],
    };
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Generous backlog for a daemon that forks right after accept.
    if unsafe { libc::listen(fd.as_raw_fd(), 32) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn accept_connection(listener: RawFd) -> Result<OwnedFd, std::io::Error> {
    let fd = unsafe {
        libc::accept4(
            listener,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
