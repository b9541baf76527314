//! The shell session message loop on the host side.
//!
//! After a READY handshake the client forwards local stdin to the remote,
//! renders remote stdout/stderr, sends window resizes on SIGWINCH, and
//! exits with the remote's exit code.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signalfd::SignalFd;
use tracing::warn;
use vm_relay_protocol::{
    ConnectionStatus, ConnectionStatusMessage, DataMessage, Message, MessageType,
    SetupConnectionRequest, SetupConnectionResponse, StdioStream, WindowResizeMessage,
    MAX_DATA_SIZE, MAX_SHELL_FRAME, VM_SHELL_TARGET,
};

use crate::terminal::window_size;

/// Exit status reported when the connection ends without a proper EXITED
/// message, chosen to make an abnormal end obvious.
pub const DEFAULT_EXIT_CODE: i32 = 123;

/// Splits trailing command-line words into leading `KEY=VALUE` environment
/// overrides and the argv that follows them.
pub fn split_env_and_argv(args: &[String]) -> (BTreeMap<String, String>, Vec<String>) {
    let mut env = BTreeMap::new();
    let mut argv = Vec::new();
    let mut env_done = false;
    for arg in args {
        if !env_done {
            if let Some((key, value)) = arg.split_once('=') {
                if !key.is_empty() {
                    env.insert(key.to_string(), value.to_string());
                    continue;
                }
            }
            env_done = true;
        }
        argv.push(arg.clone());
    }
    (env, argv)
}

/// Builds the setup request for the session.
pub fn build_setup_request(
    container: Option<&str>,
    user: &str,
    interactive: bool,
    args: &[String],
    window: (u32, u32),
) -> SetupConnectionRequest {
    let (mut env, argv) = split_env_and_argv(args);
    // Forward the local TERM by default so remote programs draw correctly.
    if let Ok(term) = std::env::var("TERM") {
        env.entry("TERM".to_string()).or_insert(term);
    }
    SetupConnectionRequest {
        target: container.unwrap_or(VM_SHELL_TARGET).to_string(),
        user: user.to_string(),
        nopty: !interactive,
        env,
        argv,
        window_rows: window.0,
        window_cols: window.1,
    }
}

enum Flow {
    Continue,
    Quit,
}

pub struct ShellClient {
    sock: File,
    sigfd: SignalFd,
    tty_fd: Option<RawFd>,
    exit_code: i32,
    stdin_open: bool,
    stdout_open: bool,
    stderr_open: bool,
    write_closed: bool,
}

impl ShellClient {
    /// Performs the setup handshake. Anything but READY fails the session.
    pub fn connect(
        mut sock: File,
        request: &SetupConnectionRequest,
        sigfd: SignalFd,
        tty_fd: Option<RawFd>,
    ) -> Result<Self, String> {
        let frame = Message::encode(MessageType::SetupConnectionRequest, request)
            .map_err(|e| format!("failed to encode setup request: {}", e))?;
        sock.write_all(&frame.serialize())
            .map_err(|e| format!("failed to send setup request: {}", e))?;

        let response: SetupConnectionResponse =
            match Message::read_from(&mut sock, MAX_SHELL_FRAME) {
                Ok(m) if m.tag == MessageType::SetupConnectionResponse => m
                    .decode()
                    .map_err(|e| format!("bad setup response: {}", e))?,
                Ok(m) => return Err(format!("expected setup response, got {:?}", m.tag)),
                Err(e) => return Err(format!("failed to read setup response: {}", e)),
            };

        if response.status != ConnectionStatus::Ready {
            return Err(format!(
                "server was unable to set up the connection: {}",
                response.description
            ));
        }

        Ok(Self {
            sock,
            sigfd,
            tty_fd,
            exit_code: DEFAULT_EXIT_CODE,
            stdin_open: true,
            stdout_open: true,
            stderr_open: true,
            write_closed: false,
        })
    }

    /// Runs the message loop until the remote exits or the connection dies.
    /// Returns the exit code to report.
    pub fn run(&mut self) -> i32 {
        loop {
            let (sock_ready, stdin_ready, signal_ready) = {
                let stdin_fd = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
                let mut fds = Vec::with_capacity(3);
                fds.push(PollFd::new(self.sock.as_fd(), PollFlags::POLLIN));
                fds.push(PollFd::new(self.sigfd.as_fd(), PollFlags::POLLIN));
                let mut stdin_index = None;
                if self.stdin_open {
                    stdin_index = Some(fds.len());
                    fds.push(PollFd::new(stdin_fd, PollFlags::POLLIN));
                }

                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        warn!("poll failed: {}", e);
                        return self.exit_code;
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
                    stdin_index.map(|i| ready(&fds[i])).unwrap_or(false),
                    ready(&fds[1]),
                )
            };

            if signal_ready {
                if let Flow::Quit = self.handle_signals() {
                    return self.exit_code;
                }
            }
            if stdin_ready {
                self.handle_stdin_readable();
            }
            if sock_ready {
                if let Flow::Quit = self.handle_sock_readable() {
                    return self.exit_code;
                }
            }
        }
    }

    fn handle_signals(&mut self) -> Flow {
        while let Ok(Some(siginfo)) = self.sigfd.read_signal() {
            match siginfo.ssi_signo as i32 {
                libc::SIGWINCH => self.send_window_size(),
                libc::SIGINT | libc::SIGTERM | libc::SIGHUP | libc::SIGQUIT => {
                    return Flow::Quit;
                }
                other => warn!("unexpected signal {}", other),
            }
        }
        Flow::Continue
    }

    fn send_window_size(&mut self) {
        let (rows, cols) = match self.tty_fd {
            Some(fd) => window_size(unsafe { BorrowedFd::borrow_raw(fd) }),
            None => return,
        };
        let message = WindowResizeMessage { rows, cols };
        self.send(MessageType::WindowResize, &message);
    }

    fn handle_stdin_readable(&mut self) {
        let mut buf = [0u8; MAX_DATA_SIZE];
        let count = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if count < 0 {
            warn!("failed to read stdin: {}", std::io::Error::last_os_error());
            self.stdin_open = false;
            return;
        }
        if count == 0 {
            self.stdin_open = false;
        }

        // A zero-length data message tells the remote stdin hit EOF.
        let message = DataMessage {
            stream: StdioStream::Stdin,
            data: buf[..count as usize].to_vec(),
        };
        self.send(MessageType::Data, &message);
    }

    fn handle_sock_readable(&mut self) -> Flow {
        let message = match Message::read_from(&mut self.sock, MAX_SHELL_FRAME) {
            Ok(m) => m,
            Err(_) => return Flow::Quit,
        };

        match message.tag {
            MessageType::Data => {
                let data: DataMessage = match message.decode() {
                    Ok(d) => d,
                    Err(_) => return Flow::Quit,
                };
                let (fd, open) = match data.stream {
                    StdioStream::Stdout => (libc::STDOUT_FILENO, &mut self.stdout_open),
                    StdioStream::Stderr => (libc::STDERR_FILENO, &mut self.stderr_open),
                    StdioStream::Stdin => {
                        warn!("remote sent stdin data");
                        return Flow::Continue;
                    }
                };
                if !*open {
                    return Flow::Continue;
                }
                if data.data.is_empty() {
                    // EOF from the remote on this stream.
                    *open = false;
                    unsafe { libc::close(fd) };
                    return Flow::Continue;
                }
                if write_all_fd(fd, &data.data).is_err() {
                    warn!("failed to write to fd {}", fd);
                }
            }
            MessageType::ConnectionStatus => {
                let status: ConnectionStatusMessage = match message.decode() {
                    Ok(s) => s,
                    Err(_) => return Flow::Quit,
                };
                match status.status {
                    ConnectionStatus::Exited => {
                        self.exit_code = status.code;
                        return Flow::Quit;
                    }
                    ConnectionStatus::Ready => {}
                    ConnectionStatus::Failed => {
                        warn!("connection failed: {}", status.description);
                        return Flow::Quit;
                    }
                }
            }
            other => warn!("unexpected message from server: {:?}", other),
        }
        Flow::Continue
    }

    fn send<T: serde::Serialize>(&mut self, tag: MessageType, body: &T) {
        if self.write_closed {
            return;
        }
        let frame = match Message::encode(tag, body) {
            Ok(f) => f,
            Err(_) => return,
        };
        if self.sock.write_all(&frame.serialize()).is_err() {
            // A partial frame would break framing; stop writing but keep
            // reading queued messages until the server closes.
            self.write_closed = true;
            self.stdin_open = false;
            unsafe { libc::shutdown(self.sock.as_raw_fd(), libc::SHUT_WR) };
        }
    }
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
