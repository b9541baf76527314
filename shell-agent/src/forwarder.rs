//! The per-connection pty forwarder.
//!
//! One forwarder process serves one shell session: it reads the setup
//! request, resolves the target identity, forks the target under a pty (or
//! pipes for non-interactive sessions), and multiplexes stdio against the
//! framed vsock stream until the child is reaped and all output has
//! drained.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, fork, geteuid, initgroups, pipe2, setresgid, setresuid, setsid,
    ForkResult, User};
use tracing::{error, info, warn};
use vm_relay_protocol::{
    ConnectionStatus, ConnectionStatusMessage, DataMessage, Message, MessageType,
    SetupConnectionRequest, SetupConnectionResponse, StdioStream, MAX_DATA_SIZE, MAX_SHELL_FRAME,
    VM_SHELL_TARGET,
};

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

/// EOT delivered to the pty line discipline to signal EOF on stdin.
const EOT: u8 = 0x04;

const LSB_RELEASE_PATH: &str = "/etc/lsb-release";
const RELEASE_TRACK_KEY: &str = "CHROMEOS_RELEASE_TRACK";
const TEST_IMAGE_TRACK: &str = "testimage-channel";

/// The only user allowed on the VM shell outside of test images.
const VM_SHELL_USER: &str = "chronos";

enum Flow {
    Continue,
    Quit,
}

pub struct Forwarder {
    sock: File,
    ptm: Option<PtyMaster>,
    stdin_pipe: Option<OwnedFd>,
    stdout_pipe: Option<OwnedFd>,
    stderr_pipe: Option<OwnedFd>,
    sigfd: SignalFd,
    child: nix::unistd::Pid,
    interactive: bool,
    exit_code: i32,
    exit_pending: bool,
    stdout_watched: bool,
    stderr_watched: bool,
    write_closed: bool,
}

impl Forwarder {
    /// Serves one accepted connection to completion. Returns the process
    /// exit code for the forwarder process.
    pub fn run(sock: OwnedFd, inherit_env: bool) -> i32 {
        match Self::init(sock, inherit_env) {
            Ok(mut forwarder) => {
                forwarder.serve();
                0
            }
            Err(e) => {
                error!("session setup failed: {}", e);
                1
            }
        }
    }

    fn init(sock: OwnedFd, inherit_env: bool) -> Result<Self, String> {
        let mut sock = File::from(sock);

        let request: SetupConnectionRequest =
            match Message::read_from(&mut sock, MAX_SHELL_FRAME) {
                Ok(m) if m.tag == MessageType::SetupConnectionRequest => m
                    .decode()
                    .map_err(|e| format!("bad setup request: {}", e))?,
                Ok(m) => return Err(format!("expected setup request, got {:?}", m.tag)),
                Err(e) => return Err(format!("failed to read setup request: {}", e)),
            };

        let passwd = match resolve_user(&request, is_test_image()) {
            Ok(passwd) => passwd,
            Err(description) => {
                send_response(&mut sock, ConnectionStatus::Failed, &description);
                return Err(description);
            }
        };

        if let Err(description) = switch_user(&passwd) {
            send_response(&mut sock, ConnectionStatus::Failed, &description);
            return Err(description);
        }

        let interactive = !request.nopty;
        let mut ptm = None;
        let mut pts_path = None;
        let mut parent_pipes = (None, None, None);
        let mut child_pipes = (None, None, None);

        if interactive {
            let master = match open_pty(&request) {
                Ok(master) => master,
                Err(description) => {
                    send_response(&mut sock, ConnectionStatus::Failed, &description);
                    return Err(description);
                }
            };
            pts_path =
                Some(ptsname_r(&master).map_err(|e| format!("failed to find pts: {}", e))?);
            ptm = Some(master);
        } else {
            let (stdin_r, stdin_w) =
                pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("stdin pipe: {}", e))?;
            let (stdout_r, stdout_w) =
                pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("stdout pipe: {}", e))?;
            let (stderr_r, stderr_w) =
                pipe2(OFlag::O_CLOEXEC).map_err(|e| format!("stderr pipe: {}", e))?;
            parent_pipes = (Some(stdin_w), Some(stdout_r), Some(stderr_r));
            child_pipes = (Some(stdin_r), Some(stdout_w), Some(stderr_w));
        }

        // Block SIGCHLD before forking; the signalfd created below still
        // sees anything queued in between.
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .map_err(|e| format!("failed to block SIGCHLD: {}", e))?;

        let child = match unsafe { fork() }.map_err(|e| format!("fork: {}", e))? {
            ForkResult::Child => {
                drop(sock);
                drop(ptm);
                let error = prepare_exec(
                    pts_path.as_deref(),
                    child_pipes,
                    &passwd,
                    &request,
                    inherit_env,
                    &mask,
                );
                // Only reached when exec failed.
                eprintln!("exec failed: {}", error);
                std::process::exit(libc::EXIT_FAILURE);
            }
            ForkResult::Parent { child } => child,
        };

        let sigfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| format!("signalfd: {}", e))?;

        send_response(&mut sock, ConnectionStatus::Ready, "shell ready");
        info!(user = %passwd.name, interactive, "session started");

        let (stdin_pipe, stdout_pipe, stderr_pipe) = parent_pipes;
        Ok(Self {
            sock,
            ptm,
            stdin_pipe,
            stdout_pipe,
            stderr_pipe,
            sigfd,
            child,
            interactive,
            exit_code: 0,
            exit_pending: false,
            stdout_watched: true,
            stderr_watched: !interactive,
            write_closed: false,
        })
    }

    fn serve(&mut self) {
        loop {
            let (sock_ready, stdout_ready, stderr_ready, signal_ready) = {
                // The pty master is polled through its raw fd; it stays
                // alive for the whole block.
                let stdout_fd = self
                    .stdout_source()
                    .map(|raw| unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) });
                let mut fds = Vec::with_capacity(4);
                fds.push(PollFd::new(self.sock.as_fd(), PollFlags::POLLIN));
                fds.push(PollFd::new(self.sigfd.as_fd(), PollFlags::POLLIN));
                let mut stdout_index = None;
                if self.stdout_watched {
                    if let Some(fd) = stdout_fd {
                        stdout_index = Some(fds.len());
                        fds.push(PollFd::new(fd, PollFlags::POLLIN));
                    }
                }
                let mut stderr_index = None;
                if self.stderr_watched {
                    if let Some(pipe) = &self.stderr_pipe {
                        stderr_index = Some(fds.len());
                        fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLIN));
                    }
                }

                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        error!("poll failed: {}", e);
                        return;
                    }
                }

                let ready = |fd: &PollFd| {
                    fd.revents()
                        .map(|r| {
                            r.intersects(
                                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                            )
                        })
                        .unwrap_or(false)
                };
                (
                    ready(&fds[0]),
                    stdout_index.map(|i| ready(&fds[i])).unwrap_or(false),
                    stderr_index.map(|i| ready(&fds[i])).unwrap_or(false),
                    ready(&fds[1]),
                )
            };

            if stdout_ready {
                if let Flow::Quit = self.handle_target_readable(StdioStream::Stdout) {
                    return;
                }
            }
            if stderr_ready {
                if let Flow::Quit = self.handle_target_readable(StdioStream::Stderr) {
                    return;
                }
            }
            if sock_ready {
                if let Flow::Quit = self.handle_sock_readable() {
                    return;
                }
            }
            if signal_ready {
                if let Flow::Quit = self.handle_signals() {
                    return;
                }
            }
        }
    }

    fn stdout_source(&self) -> Option<RawFd> {
        if self.interactive {
            self.ptm.as_ref().map(|m| m.as_raw_fd())
        } else {
            self.stdout_pipe.as_ref().map(|p| p.as_raw_fd())
        }
    }

    fn stdin_target(&self) -> Option<RawFd> {
        if self.interactive {
            self.ptm.as_ref().map(|m| m.as_raw_fd())
        } else {
            self.stdin_pipe.as_ref().map(|p| p.as_raw_fd())
        }
    }

    fn handle_sock_readable(&mut self) -> Flow {
        let message = match Message::read_from(&mut self.sock, MAX_SHELL_FRAME) {
            Ok(m) => m,
            Err(e) => {
                // A closed peer is an immediate shutdown; anything already
                // buffered was consumed by earlier iterations.
                if !self.exit_pending {
                    warn!("failed to read from client: {}", e);
                }
                return Flow::Quit;
            }
        };

        match message.tag {
            MessageType::Data => {
                let data: DataMessage = match message.decode() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("bad data message: {}", e);
                        return Flow::Quit;
                    }
                };
                if data.stream != StdioStream::Stdin {
                    warn!("client sent non-stdin data: {:?}", data.stream);
                    return Flow::Continue;
                }

                if data.data.is_empty() {
                    // EOF on stdin.
                    if self.interactive {
                        if let Some(fd) = self.stdin_target() {
                            if write_all_fd(fd, &[EOT]).is_err() {
                                warn!("failed to write EOT to pty");
                            }
                        }
                    } else {
                        self.stdin_pipe = None;
                    }
                    return Flow::Continue;
                }

                match self.stdin_target() {
                    Some(fd) => {
                        if write_all_fd(fd, &data.data).is_err() {
                            warn!("failed to write to target stdin");
                        }
                    }
                    None => warn!("stdin data after EOF"),
                }
            }
            MessageType::WindowResize => {
                let resize: vm_relay_protocol::WindowResizeMessage = match message.decode() {
                    Ok(r) => r,
                    Err(_) => return Flow::Continue,
                };
                match &self.ptm {
                    Some(ptm) => {
                        if let Some((rows, cols)) = clamp_window_size(resize.rows, resize.cols) {
                            let ws = libc::winsize {
                                ws_row: rows,
                                ws_col: cols,
                                ws_xpixel: 0,
                                ws_ypixel: 0,
                            };
                            if let Err(e) = unsafe { tiocswinsz(ptm.as_raw_fd(), &ws) } {
                                warn!("failed to resize window: {}", e);
                            }
                        }
                    }
                    None => warn!("cannot resize window without a pty"),
                }
            }
            MessageType::ConnectionStatus => {
                let status: ConnectionStatusMessage = match message.decode() {
                    Ok(s) => s,
                    Err(_) => return Flow::Quit,
                };
                if status.status != ConnectionStatus::Ready {
                    return Flow::Quit;
                }
            }
            other => warn!("unexpected message from client: {:?}", other),
        }
        Flow::Continue
    }

    fn handle_target_readable(&mut self, stream: StdioStream) -> Flow {
        let fd = match stream {
            StdioStream::Stdout => match self.stdout_source() {
                Some(fd) => fd,
                None => return Flow::Continue,
            },
            StdioStream::Stderr => match &self.stderr_pipe {
                Some(pipe) => pipe.as_raw_fd(),
                None => return Flow::Continue,
            },
            StdioStream::Stdin => return Flow::Continue,
        };

        let mut buf = [0u8; MAX_DATA_SIZE];
        let count =
            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if count < 0 {
            let errno = std::io::Error::last_os_error();
            // The pty master raises EIO once the slave side is fully
            // closed, often before the SIGCHLD arrives. That is EOF.
            return match errno.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EIO) => self.cancel_watch(stream),
                _ => {
                    warn!("failed to read target {:?}: {}", stream, errno);
                    Flow::Continue
                }
            };
        }
        if count == 0 {
            // Propagate EOF so the peer can close its side of the stream.
            let _ = self.send(
                MessageType::Data,
                &DataMessage {
                    stream,
                    data: Vec::new(),
                },
            );
            return self.cancel_watch(stream);
        }

        let message = DataMessage {
            stream,
            data: buf[..count as usize].to_vec(),
        };
        if self.send(MessageType::Data, &message).is_err() {
            // Stop producing output; keep reading inbound messages until
            // the peer closes so framing is preserved.
            self.stdout_watched = false;
            self.stderr_watched = false;
        }
        Flow::Continue
    }

    fn handle_signals(&mut self) -> Flow {
        while let Ok(Some(siginfo)) = self.sigfd.read_signal() {
            match siginfo.ssi_signo as i32 {
                libc::SIGCHLD => {
                    if let Ok(status) = waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                        if let Some(code) = exit_code_for(&status) {
                            self.exit_code = code;
                        }
                    }
                    self.exit_pending = true;
                }
                libc::SIGTERM => {
                    info!("SIGTERM, shutting down session");
                    return Flow::Quit;
                }
                other => warn!("unexpected signal {}", other),
            }
        }

        if self.exit_pending && !self.stdout_watched && !self.stderr_watched {
            self.send_exit();
            return Flow::Quit;
        }
        Flow::Continue
    }

    /// EOF on an output stream: drop just that watch. The session ends once
    /// the child is reaped and both streams have drained.
    fn cancel_watch(&mut self, stream: StdioStream) -> Flow {
        match stream {
            StdioStream::Stdout => self.stdout_watched = false,
            StdioStream::Stderr => self.stderr_watched = false,
            StdioStream::Stdin => {}
        }
        if self.exit_pending && !self.stdout_watched && !self.stderr_watched {
            self.send_exit();
            return Flow::Quit;
        }
        Flow::Continue
    }

    fn send_exit(&mut self) {
        let message = ConnectionStatusMessage {
            status: ConnectionStatus::Exited,
            description: "target process has exited".to_string(),
            code: self.exit_code,
        };
        let _ = self.send(MessageType::ConnectionStatus, &message);
    }

    fn send<T: serde::Serialize>(&mut self, tag: MessageType, body: &T) -> Result<(), ()> {
        if self.write_closed {
            return Err(());
        }
        let frame = match Message::encode(tag, body) {
            Ok(f) => f,
            Err(_) => return Err(()),
        };
        if self.sock.write_all(&frame.serialize()).is_err() {
            // Never leave a partial frame behind: stop writing entirely.
            self.write_closed = true;
            unsafe { libc::shutdown(self.sock.as_raw_fd(), libc::SHUT_WR) };
            return Err(());
        }
        Ok(())
    }
}

fn send_response(sock: &mut File, status: ConnectionStatus, description: &str) {
    let response = SetupConnectionResponse {
        status,
        description: description.to_string(),
    };
    match Message::encode(MessageType::SetupConnectionResponse, &response) {
        Ok(frame) => {
            if sock.write_all(&frame.serialize()).is_err() {
                error!("failed to send connection response");
            }
        }
        Err(e) => error!("failed to encode connection response: {}", e),
    }
}

fn dup_to(oldfd: RawFd, newfd: RawFd) -> Result<(), String> {
    if unsafe { libc::dup2(oldfd, newfd) } < 0 {
        return Err(format!(
            "failed to dup fd {} into {}: {}",
            oldfd,
            newfd,
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn write_all_fd(fd: RawFd, mut data: &[u8]) -> Result<(), std::io::Error> {
    while !data.is_empty() {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(e);
        }
        data = &data[n as usize..];
    }
    Ok(())
}

fn is_test_image() -> bool {
    match std::fs::read_to_string(LSB_RELEASE_PATH) {
        Ok(contents) => is_test_image_from(&contents),
        Err(_) => false,
    }
}

/// An image is a test image only when the release track says so.
fn is_test_image_from(lsb_release: &str) -> bool {
    for line in lsb_release.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == RELEASE_TRACK_KEY && value.trim() == TEST_IMAGE_TRACK {
                return true;
            }
        }
    }
    false
}

/// Applies the target-user policy and looks up the passwd entry.
fn resolve_user(request: &SetupConnectionRequest, test_image: bool) -> Result<User, String> {
    let mut user = request.user.clone();
    if request.target == VM_SHELL_TARGET {
        if user.is_empty() {
            user = VM_SHELL_USER.to_string();
        }
        if user != VM_SHELL_USER && !test_image {
            return Err(format!(
                "only {} is allowed login on the VM shell",
                VM_SHELL_USER
            ));
        }
    }

    let current_uid = geteuid();
    let passwd = if user.is_empty() {
        User::from_uid(current_uid)
            .ok()
            .flatten()
            .ok_or_else(|| format!("could not find uid: {}", current_uid))?
    } else {
        User::from_name(&user)
            .ok()
            .flatten()
            .ok_or_else(|| format!("could not find user: {}", user))?
    };

    if passwd.uid != current_uid && !current_uid.is_root() {
        return Err(format!("cannot change to user: {}", passwd.name));
    }
    Ok(passwd)
}

/// Sets supplementary groups and switches real/effective/saved ids when the
/// session runs as a different user.
fn switch_user(passwd: &User) -> Result<(), String> {
    let current_uid = geteuid();
    if passwd.uid == current_uid {
        return Ok(());
    }

    let name = CString::new(passwd.name.as_str())
        .map_err(|_| "user name contains a NUL byte".to_string())?;
    initgroups(&name, passwd.gid)
        .map_err(|e| format!("could not set supplementary groups: {}", e))?;
    setresgid(passwd.gid, passwd.gid, passwd.gid)
        .map_err(|e| format!("could not set gid to {}: {}", passwd.gid, e))?;
    setresuid(passwd.uid, passwd.uid, passwd.uid)
        .map_err(|e| format!("could not set uid to {}: {}", passwd.uid, e))?;
    Ok(())
}

fn open_pty(request: &SetupConnectionRequest) -> Result<PtyMaster, String> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
        .map_err(|_| "could not allocate pty".to_string())?;
    grantpt(&master).map_err(|_| "could not grant pty".to_string())?;
    unlockpt(&master).map_err(|_| "could not unlock pty".to_string())?;

    if let Some((rows, cols)) = clamp_window_size(request.window_rows, request.window_cols) {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { tiocswinsz(master.as_raw_fd(), &ws) }
            .map_err(|_| "could not set initial window size".to_string())?;
    }
    Ok(master)
}

/// Child-side setup between fork and exec. Returns only on failure.
fn prepare_exec(
    pts: Option<&str>,
    child_pipes: (Option<OwnedFd>, Option<OwnedFd>, Option<OwnedFd>),
    passwd: &User,
    request: &SetupConnectionRequest,
    inherit_env: bool,
    blocked: &SigSet,
) -> String {
    match prepare_exec_inner(pts, child_pipes, passwd, request, inherit_env, blocked) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

fn prepare_exec_inner(
    pts: Option<&str>,
    child_pipes: (Option<OwnedFd>, Option<OwnedFd>, Option<OwnedFd>),
    passwd: &User,
    request: &SetupConnectionRequest,
    inherit_env: bool,
    blocked: &SigSet,
) -> Result<std::convert::Infallible, String> {
    if let Some(pts) = pts {
        let slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(pts)
            .map_err(|e| format!("failed to open pty slave: {}", e))?;
        for fd in 0..3 {
            dup_to(slave.as_raw_fd(), fd)?;
        }
        // Job control needs the shell to lead its own session with the pty
        // as controlling terminal.
        setsid().map_err(|e| format!("setsid: {}", e))?;
        unsafe { tiocsctty(0, 0) }.map_err(|e| format!("TIOCSCTTY: {}", e))?;
    } else {
        let (stdin_r, stdout_w, stderr_w) = child_pipes;
        let stdin_r = stdin_r.ok_or("missing stdin pipe")?;
        let stdout_w = stdout_w.ok_or("missing stdout pipe")?;
        let stderr_w = stderr_w.ok_or("missing stderr pipe")?;
        dup_to(stdin_r.as_raw_fd(), 0)?;
        dup_to(stdout_w.as_raw_fd(), 1)?;
        dup_to(stderr_w.as_raw_fd(), 2)?;
        setsid().map_err(|e| format!("setsid: {}", e))?;
    }

    if chdir(&passwd.dir).is_err() {
        // Fall back to the root directory if home is unavailable.
        chdir("/").map_err(|e| format!("chdir /: {}", e))?;
    }

    let env = compose_env(
        inherit_env.then(|| std::env::vars().collect()),
        &request.env,
        &passwd.shell.to_string_lossy(),
        &passwd.dir.to_string_lossy(),
    );
    let envp: Vec<CString> = env
        .iter()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect();

    let (executable, argv) = if request.argv.is_empty() {
        // A login shell announces itself with a leading dash in argv[0].
        (
            passwd.shell.to_string_lossy().to_string(),
            vec![login_shell_argv0(&passwd.shell)],
        )
    } else {
        (request.argv[0].clone(), request.argv.clone())
    };

    let executable =
        CString::new(executable).map_err(|_| "executable contains a NUL byte".to_string())?;
    let argv: Vec<CString> = argv
        .into_iter()
        .map(|a| CString::new(a).map_err(|_| "argument contains a NUL byte".to_string()))
        .collect::<Result<_, _>>()?;

    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(blocked), None)
        .map_err(|e| format!("failed to unblock signals: {}", e))?;

    nix::unistd::execvpe(&executable, &argv, &envp)
        .map_err(|e| format!("failed to exec {:?}: {}", executable, e))
}

/// Parent env (when inherited) overlaid by the request env, with `SHELL`
/// and `HOME` forced from the passwd entry and a `TERM` fallback.
fn compose_env(
    inherited: Option<BTreeMap<String, String>>,
    request_env: &BTreeMap<String, String>,
    shell: &str,
    home: &str,
) -> BTreeMap<String, String> {
    let mut env = inherited.unwrap_or_default();
    for (key, value) in request_env {
        env.insert(key.clone(), value.clone());
    }
    env.entry("TERM".to_string())
        .or_insert_with(|| "linux".to_string());
    env.insert("SHELL".to_string(), shell.to_string());
    env.insert("HOME".to_string(), home.to_string());
    env
}

fn login_shell_argv0(shell: &Path) -> String {
    let base = shell
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "sh".to_string());
    format!("-{}", base)
}

/// Valid pty dimensions fit in the kernel's u16 winsize fields.
fn clamp_window_size(rows: u32, cols: u32) -> Option<(u16, u16)> {
    if rows == 0 || cols == 0 || rows > u16::MAX as u32 || cols > u16::MAX as u32 {
        return None;
    }
    Some((rows as u16, cols as u16))
}

/// The wire exit code: the 0-255 exit value, or 128 + signal number.
fn exit_code_for(status: &WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(*code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + *signal as i32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn request(target: &str, user: &str) -> SetupConnectionRequest {
        SetupConnectionRequest {
            target: target.to_string(),
            user: user.to_string(),
            nopty: false,
            env: BTreeMap::new(),
            argv: vec![],
            window_rows: 24,
            window_cols: 80,
        }
    }

    #[test]
    fn test_image_detection_parses_release_track() {
        assert!(is_test_image_from(
            "CHROMEOS_RELEASE_NAME=Chrome OS\nCHROMEOS_RELEASE_TRACK=testimage-channel\n"
        ));
        assert!(!is_test_image_from(
            "CHROMEOS_RELEASE_TRACK=stable-channel\n"
        ));
        assert!(!is_test_image_from("CHROMEOS_RELEASE_NAME=Chrome OS\n"));
        assert!(!is_test_image_from(""));
    }

    #[test]
    fn vm_shell_restricts_users_on_release_images() {
        let err = resolve_user(&request(VM_SHELL_TARGET, "root"), false).unwrap_err();
        assert!(err.contains("chronos"));
    }

    #[test]
    fn vm_shell_allows_other_users_on_test_images() {
        // On a test image the policy gate passes; the lookup then depends
        // on the local passwd database, so use the current user.
        let me = User::from_uid(geteuid()).unwrap().unwrap();
        let resolved = resolve_user(&request(VM_SHELL_TARGET, &me.name), true);
        if me.name == VM_SHELL_USER || resolved.is_ok() {
            // Either way the chronos-only restriction did not fire.
            return;
        }
        panic!("unexpected rejection: {:?}", resolved.err());
    }

    #[test]
    fn empty_user_resolves_to_current_uid() {
        let passwd = resolve_user(&request("penguin", ""), false).unwrap();
        assert_eq!(passwd.uid, geteuid());
    }

    #[test]
    fn unknown_user_is_rejected() {
        let err = resolve_user(&request("penguin", "no-such-user-here"), false).unwrap_err();
        assert!(err.contains("could not find user"));
    }

    #[test]
    fn compose_env_forces_shell_and_home() {
        let mut request_env = BTreeMap::new();
        request_env.insert("SHELL".to_string(), "/bin/evil".to_string());
        request_env.insert("FOO".to_string(), "bar".to_string());

        let env = compose_env(None, &request_env, "/bin/bash", "/home/chronos");
        assert_eq!(env["SHELL"], "/bin/bash");
        assert_eq!(env["HOME"], "/home/chronos");
        assert_eq!(env["FOO"], "bar");
        assert_eq!(env["TERM"], "linux");
    }

    #[test]
    fn compose_env_request_overrides_inherited() {
        let mut inherited = BTreeMap::new();
        inherited.insert("TERM".to_string(), "xterm-256color".to_string());
        inherited.insert("LANG".to_string(), "C".to_string());
        let mut request_env = BTreeMap::new();
        request_env.insert("LANG".to_string(), "en_US.UTF-8".to_string());

        let env = compose_env(Some(inherited), &request_env, "/bin/sh", "/root");
        assert_eq!(env["TERM"], "xterm-256color");
        assert_eq!(env["LANG"], "en_US.UTF-8");
    }

    #[test]
    fn login_shell_gets_dash_prefix() {
        assert_eq!(login_shell_argv0(Path::new("/bin/bash")), "-bash");
        assert_eq!(login_shell_argv0(Path::new("/usr/bin/zsh")), "-zsh");
    }

    #[test]
    fn window_size_clamps_to_u16_range() {
        assert_eq!(clamp_window_size(24, 80), Some((24, 80)));
        assert_eq!(clamp_window_size(0, 80), None);
        assert_eq!(clamp_window_size(24, 0), None);
        assert_eq!(clamp_window_size(70000, 80), None);
        assert_eq!(clamp_window_size(u16::MAX as u32, 1), Some((u16::MAX, 1)));
    }

    #[test]
    fn exit_codes_follow_wait_status() {
        assert_eq!(
            exit_code_for(&WaitStatus::Exited(Pid::from_raw(1), 3)),
            Some(3)
        );
        assert_eq!(
            exit_code_for(&WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false)),
            Some(128 + 9)
        );
        assert_eq!(
            exit_code_for(&WaitStatus::StillAlive),
            None
        );
    }
}
