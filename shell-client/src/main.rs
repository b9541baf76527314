//! shell-client - interactive shell into a VM or container.
//!
//! Connects to the in-guest shell forwarder over vsock, puts the local
//! terminal into raw mode for the duration of the session, and exits with
//! the remote program's exit code.

mod client;
mod terminal;

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::process::ExitCode;

use clap::Parser;
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::error;
use tracing_subscriber::EnvFilter;
use vm_relay_protocol::SHELL_PORT;

use crate::client::{build_setup_request, ShellClient, DEFAULT_EXIT_CODE};
use crate::terminal::{window_size, RawTerminalGuard};

#[derive(Parser)]
#[command(
    name = "shell-client",
    about = "Shell into a VM or container",
    trailing_var_arg = true
)]
struct Args {
    /// Context id of the target VM.
    #[arg(long)]
    cid: u32,

    /// Vsock port of the shell forwarder.
    #[arg(long, default_value_t = SHELL_PORT)]
    port: u32,

    /// User to run as inside the target.
    #[arg(long, default_value = "")]
    user: String,

    /// Container to shell into; the VM itself when omitted.
    #[arg(long)]
    container: Option<String>,

    /// Use pipes instead of a pty.
    #[arg(long)]
    no_pty: bool,

    /// Leading KEY=VALUE pairs become environment overrides; the rest is
    /// the command to run (the login shell when empty).
    #[arg()]
    command: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let sock = match vsock_connect(args.cid, args.port) {
        Ok(fd) => File::from(fd),
        Err(e) => {
            error!(cid = args.cid, port = args.port, "connect failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Terminal signals and SIGWINCH arrive through a signalfd so the
    // message loop sees them as ordinary readiness events.
    let mut mask = SigSet::empty();
    for signal in [
        Signal::SIGWINCH,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ] {
        mask.add(signal);
    }
    if let Err(e) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) {
        error!("failed to block signals: {}", e);
        return ExitCode::FAILURE;
    }
    let sigfd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
    {
        Ok(fd) => fd,
        Err(e) => {
            error!("failed to create signalfd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let interactive = !args.no_pty;
    let tty = if interactive {
        match File::options().read(true).write(true).open("/dev/tty") {
            Ok(tty) => Some(tty),
            Err(_) => None,
        }
    } else {
        None
    };

    let window = tty
        .as_ref()
        .map(|t| window_size(t.as_fd()))
        .unwrap_or((0, 0));
    let request = build_setup_request(
        args.container.as_deref(),
        &args.user,
        interactive,
        &args.command,
        window,
    );

    // Raw mode lasts exactly as long as the guard; every return path below
    // restores the terminal before the process exits.
    let _raw_guard = match &tty {
        Some(tty) => match RawTerminalGuard::new(tty.as_fd()) {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("failed to enter raw mode: {}", e);
                None
            }
        },
        None => None,
    };

    let tty_fd = tty.as_ref().map(|t| t.as_raw_fd());
    let exit_code = match ShellClient::connect(sock, &request, sigfd, tty_fd) {
        Ok(mut session) => session.run(),
        Err(e) => {
            error!("{}", e);
            DEFAULT_EXIT_CODE
        }
    };

    ExitCode::from(exit_code.clamp(0, 255) as u8)
}

fn vsock_connect(cid: u32, port: u32) -> Result<OwnedFd, std::io::Error> {
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
        svm_cid: cid,
        svm_zero: [0; 4],
    };
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}
