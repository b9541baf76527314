//! The per-VM runtime directory and the VMM control socket.
//!
//! The VMM itself is launched by an external process. This module owns only
//! the filesystem contract: `/run/vm/<vm-name>/` holds the `crosvm.sock`
//! control socket, a `pid` file with the VMM's decimal pid, and the per-VM
//! allocation records written by the pools.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default runtime directory on a production host.
pub const RUNTIME_DIR: &str = "/run/vm";

/// Control socket name inside the per-VM directory.
pub const CONTROL_SOCKET: &str = "crosvm.sock";

/// Pid file name inside the per-VM directory.
pub const PID_FILE: &str = "pid";

/// Command written over the control socket for a graceful stop.
const STOP_COMMAND: &[u8] = b"stop\n";

/// Handle to one VM's runtime directory.
pub struct VmmHandle {
    instance_dir: PathBuf,
}

impl VmmHandle {
    pub fn new(runtime_dir: &Path, vm_name: &str) -> Self {
        Self {
            instance_dir: runtime_dir.join(vm_name),
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.instance_dir.join(CONTROL_SOCKET)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.instance_dir.join(PID_FILE)
    }

    pub fn create_instance_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.instance_dir)?;
        Ok(())
    }

    /// The VMM's pid as recorded by the launcher.
    pub fn read_pid(&self) -> Result<i32> {
        let contents = std::fs::read_to_string(self.pid_file_path())?;
        contents
            .trim()
            .parse()
            .map_err(|_| Error::BadInput(format!("malformed pid file for {:?}", self.instance_dir)))
    }

    /// True while the recorded pid names a live process.
    pub fn is_running(&self) -> bool {
        match self.read_pid() {
            Ok(pid) => kill(Pid::from_raw(pid), None).is_ok(),
            Err(_) => false,
        }
    }

    /// Asks the VMM to stop over its control socket, waiting up to
    /// `graceful_timeout` before falling back to SIGTERM on the pid.
    pub fn stop(&self, graceful_timeout: Duration) -> Result<()> {
        match UnixStream::connect(self.control_socket_path()) {
            Ok(mut sock) => {
                sock.write_all(STOP_COMMAND)?;
                info!(dir = %self.instance_dir.display(), "sent stop command");
            }
            Err(e) => {
                warn!(
                    dir = %self.instance_dir.display(),
                    error = %e,
                    "control socket unreachable, falling back to SIGTERM"
                );
            }
        }

        let deadline = Instant::now() + graceful_timeout;
        while Instant::now() < deadline {
            if !self.is_running() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        match self.read_pid() {
            Ok(pid) => {
                warn!(pid, "graceful stop timed out, sending SIGTERM");
                kill(Pid::from_raw(pid), Signal::SIGTERM)?;
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Removes the runtime directory after the VMM is gone.
    pub fn remove_instance_dir(&self) -> Result<()> {
        if self.instance_dir.exists() {
            std::fs::remove_dir_all(&self.instance_dir)?;
        }
        Ok(())
    }
}
