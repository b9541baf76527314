//! Shared wire-format types for vm-relay host ↔ guest communication.
//!
//! This crate is the single source of truth for the message protocol spoken
//! between the host control service (`vm-relay`), the in-guest agents, and
//! the shell forwarder/client pair. All of those crates depend on this one
//! to avoid struct duplication.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌──────────────┬───────────┬───────────────────┐
//! │ length (4 B) │ tag (1 B) │ payload (N bytes) │
//! └──────────────┴───────────┴───────────────────┘
//! ```
//!
//! - **length**: `u32` big-endian, size of the payload only (not including
//!   the 5-byte header).
//! - **tag**: one byte mapping to [`MessageType`].
//! - **payload**: JSON-encoded body (may be empty).
//!
//! Shell data payloads are bounded by [`MAX_DATA_SIZE`]; whole shell frames
//! by [`MAX_SHELL_FRAME`]; control-plane frames by [`MAX_CONTROL_FRAME`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during protocol message parsing.
#[derive(Debug)]
pub enum ProtocolError {
    /// Message buffer too short or incomplete.
    InvalidMessage(String),
    /// The tag byte does not map to a known [`MessageType`].
    UnknownMessageType(u8),
    /// Declared payload length exceeds the frame bound for this plane.
    FrameTooLarge { len: usize, max: usize },
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ProtocolError::UnknownMessageType(b) => write!(f, "Unknown message tag: {}", b),
            ProtocolError::FrameTooLarge { len, max } => {
                write!(f, "Frame too large: {} bytes (max {})", len, max)
            }
            ProtocolError::Io(e) => write!(f, "IO error: {}", e),
            ProtocolError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (length) + 1 (tag).
pub const HEADER_SIZE: usize = 5;

/// Largest `data` field carried by a single [`DataMessage`].
pub const MAX_DATA_SIZE: usize = 4096;

/// Largest whole shell frame. A full 4 KiB chunk encodes to several times
/// its size as a JSON byte array, so the frame bound is well above
/// [`MAX_DATA_SIZE`].
pub const MAX_SHELL_FRAME: usize = 32 * 1024;

/// Largest control-plane frame.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Vsock port the host container listener binds.
pub const CONTAINER_LISTENER_PORT: u32 = 8888;

/// Vsock port the host startup listener binds.
pub const STARTUP_LISTENER_PORT: u32 = 8889;

/// Vsock port the host tremplin listener binds, and the in-guest lifecycle
/// agent listens on inside the VM.
pub const TREMPLIN_LISTENER_PORT: u32 = 8890;

/// Vsock port the in-guest shell forwarder listens on.
pub const SHELL_PORT: u32 = 9001;

/// `SetupConnectionRequest.target` value selecting a shell in the VM itself
/// rather than in a container.
pub const VM_SHELL_TARGET: &str = "vm_shell";

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Message tags for host-guest communication.
///
/// Tags 1–5 are the shell plane, 16–22 the container plane, 32–37 the
/// tremplin plane, 48 the startup plane, and 64 the unary RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client requests a shell session.
    SetupConnectionRequest = 1,
    /// Forwarder replies whether the session is usable.
    SetupConnectionResponse = 2,
    /// Stdio bytes in either direction.
    Data = 3,
    /// Terminal window dimensions changed.
    WindowResize = 4,
    /// Connection status update (notably EXITED with the exit code).
    ConnectionStatus = 5,

    /// Container agent reports startup complete.
    ContainerReady = 16,
    /// Container agent reports orderly shutdown.
    ContainerShutdown = 17,
    /// Container agent pushes its installed-application list.
    UpdateApplicationList = 18,
    /// Container agent asks the host to open a URL.
    OpenUrl = 19,
    /// Container agent asks the host to open a terminal window.
    OpenTerminal = 20,
    /// Package install progress from the container agent.
    InstallPackageProgress = 21,
    /// Number of app-list updates the container agent still has queued.
    PendingAppListUpdates = 22,

    /// In-VM lifecycle agent is up and reachable.
    TremplinReady = 32,
    /// Incremental container-creation status.
    UpdateCreateStatus = 33,
    /// Incremental container-start status.
    UpdateStartStatus = 34,
    /// Incremental container-deletion status.
    UpdateDeleteStatus = 35,
    /// Incremental container-export status.
    UpdateExportStatus = 36,
    /// Incremental container-import status.
    UpdateImportStatus = 37,

    /// Container failed to start; fire-and-forget notification.
    ContainerStartupFailed = 48,

    /// Unary RPC reply carrying an [`RpcStatus`].
    RpcStatus = 64,

    /// Host asks the in-VM lifecycle agent to create a container.
    CreateContainer = 80,
    /// Host asks the in-VM lifecycle agent to start a container.
    StartContainer = 81,
    /// Host asks the in-VM lifecycle agent to delete a container.
    DeleteContainer = 82,
    /// Host asks the in-VM lifecycle agent to export a container image.
    ExportContainer = 83,
    /// Host asks the in-VM lifecycle agent to import a container image.
    ImportContainer = 84,
    /// Host queries container state from the in-VM lifecycle agent.
    GetContainerInfo = 85,
    /// Reply from the in-VM lifecycle agent; body depends on the request.
    TremplinReply = 95,

    /// Host asks the in-container agent to launch an application.
    LaunchApplication = 96,
    /// Host asks the in-container agent to install a package file.
    InstallPackage = 97,
    /// Host asks the in-container agent to start the shell forwarder.
    LaunchShellServer = 98,
    /// Reply from the in-container agent; body depends on the request.
    GarconReply = 111,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(MessageType::SetupConnectionRequest),
            2 => Ok(MessageType::SetupConnectionResponse),
            3 => Ok(MessageType::Data),
            4 => Ok(MessageType::WindowResize),
            5 => Ok(MessageType::ConnectionStatus),
            16 => Ok(MessageType::ContainerReady),
            17 => Ok(MessageType::ContainerShutdown),
            18 => Ok(MessageType::UpdateApplicationList),
            19 => Ok(MessageType::OpenUrl),
            20 => Ok(MessageType::OpenTerminal),
            21 => Ok(MessageType::InstallPackageProgress),
            22 => Ok(MessageType::PendingAppListUpdates),
            32 => Ok(MessageType::TremplinReady),
            33 => Ok(MessageType::UpdateCreateStatus),
            34 => Ok(MessageType::UpdateStartStatus),
            35 => Ok(MessageType::UpdateDeleteStatus),
            36 => Ok(MessageType::UpdateExportStatus),
            37 => Ok(MessageType::UpdateImportStatus),
            48 => Ok(MessageType::ContainerStartupFailed),
            64 => Ok(MessageType::RpcStatus),
            80 => Ok(MessageType::CreateContainer),
            81 => Ok(MessageType::StartContainer),
            82 => Ok(MessageType::DeleteContainer),
            83 => Ok(MessageType::ExportContainer),
            84 => Ok(MessageType::ImportContainer),
            85 => Ok(MessageType::GetContainerInfo),
            95 => Ok(MessageType::TremplinReply),
            96 => Ok(MessageType::LaunchApplication),
            97 => Ok(MessageType::InstallPackage),
            98 => Ok(MessageType::LaunchShellServer),
            111 => Ok(MessageType::GarconReply),
            _ => Err(ProtocolError::UnknownMessageType(byte)),
        }
    }
}

// ---------------------------------------------------------------------------
// Message (wire frame)
// ---------------------------------------------------------------------------

/// A framed protocol message consisting of a tag and a payload.
///
/// Use [`Message::serialize`] / [`Message::deserialize`] for in-memory
/// conversion and [`Message::read_from`] for streaming from a reader.
#[derive(Debug, Clone)]
pub struct Message {
    /// Type of message.
    pub tag: MessageType,
    /// Message payload (typically JSON-encoded).
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message by JSON-encoding `body` under `tag`.
    pub fn encode<T: Serialize>(tag: MessageType, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            tag,
            payload: serde_json::to_vec(body)?,
        })
    }

    /// Decode the payload as JSON into `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize this message into a byte buffer (header + payload).
    pub fn serialize(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.push(self.tag as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a message from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("Message too short".into()));
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let tag = MessageType::try_from(data[4])?;

        if data.len() < HEADER_SIZE + length {
            return Err(ProtocolError::InvalidMessage("Incomplete message".into()));
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        Ok(Self { tag, payload })
    }

    /// Read a complete message from a [`std::io::Read`] stream, rejecting
    /// frames whose declared payload exceeds `max_len`.
    pub fn read_from<R: std::io::Read>(
        reader: &mut R,
        max_len: usize,
    ) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let tag = MessageType::try_from(header[4])?;

        if length > max_len {
            return Err(ProtocolError::FrameTooLarge {
                len: length,
                max: max_len,
            });
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Self { tag, payload })
    }

    /// Write the whole frame to a [`std::io::Write`] stream.
    ///
    /// The frame is serialized first and written with a single `write_all`
    /// so a successful return never leaves a partial frame on the stream.
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.serialize())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data types: shell plane
// ---------------------------------------------------------------------------

/// Request from the shell client to set up a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConnectionRequest {
    /// [`VM_SHELL_TARGET`] for a VM shell, otherwise a container name.
    pub target: String,
    /// User to run the target program as. Empty selects the default for the
    /// target ("chronos" for the VM shell, the current user otherwise).
    #[serde(default)]
    pub user: String,
    /// If true, connect the child through pipes instead of a pty.
    #[serde(default)]
    pub nopty: bool,
    /// Environment overrides for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Program and arguments. Empty execs the user's login shell.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Initial terminal rows (0 when the client has no tty).
    #[serde(default)]
    pub window_rows: u32,
    /// Initial terminal columns (0 when the client has no tty).
    #[serde(default)]
    pub window_cols: u32,
}

/// Session status values shared by the setup response and status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Ready,
    Failed,
    Exited,
}

/// Forwarder's answer to a [`SetupConnectionRequest`].
///
/// Anything other than `READY` means the client must close and exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConnectionResponse {
    pub status: ConnectionStatus,
    pub description: String,
}

/// Which stdio stream a [`DataMessage`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StdioStream {
    Stdin,
    Stdout,
    Stderr,
}

/// Stdio bytes. An empty `data` signals EOF on that stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    pub stream: StdioStream,
    pub data: Vec<u8>,
}

/// Terminal dimensions, sent by the client on SIGWINCH.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowResizeMessage {
    pub rows: u32,
    pub cols: u32,
}

/// Connection status update. `code` carries the child's exit status when
/// `status` is `EXITED`: the 0–255 exit value, or 128 + signal number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatusMessage {
    pub status: ConnectionStatus,
    pub description: String,
    pub code: i32,
}

// ---------------------------------------------------------------------------
// Data types: container plane
// ---------------------------------------------------------------------------

/// Container agent reports that it finished starting up.
///
/// Either `garcon_vsock_port` is non-zero (vsock endpoint `cid:port`) or the
/// agent is reachable at `container_ipv4` on the well-known agent port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerReadyRequest {
    pub token: String,
    #[serde(default)]
    pub garcon_vsock_port: u32,
    /// Container IPv4 address in network byte order (0 when unused).
    #[serde(default)]
    pub container_ipv4: u32,
}

/// Container agent reports an orderly shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerShutdownRequest {
    pub token: String,
}

/// One installed application as reported by the container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub desktop_file_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub no_display: bool,
    #[serde(default)]
    pub mime_types: Vec<String>,
}

/// Full application list push from the container agent.
///
/// `vm_name`, `container_name`, and `owner_id` are always overwritten by the
/// control service before fan-out; values supplied by the guest are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateApplicationListRequest {
    pub token: String,
    #[serde(default)]
    pub vm_name: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub apps: Vec<App>,
}

/// Container agent asks the host to open a URL in the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenUrlRequest {
    pub token: String,
    pub url: String,
}

/// Container agent asks the host to open a terminal into the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTerminalRequest {
    pub token: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Progress states for an in-container package install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallPackageStatus {
    Succeeded,
    Failed,
    Downloading,
    Installing,
}

/// Package install progress from the container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPackageProgressRequest {
    pub token: String,
    pub status: InstallPackageStatus,
    #[serde(default)]
    pub progress_percent: u32,
    #[serde(default)]
    pub failure_details: String,
}

/// Number of app-list updates the agent still has queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAppListUpdatesRequest {
    pub token: String,
    pub count: u32,
}

// ---------------------------------------------------------------------------
// Data types: tremplin plane
// ---------------------------------------------------------------------------

/// In-VM lifecycle agent announces it is up; no payload beyond the frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TremplinReadyRequest {}

/// Creation progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateStatus {
    Unknown,
    Created,
    DownloadTimedOut,
    Cancelled,
    Failed,
    Downloading,
}

/// Incremental container-creation status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCreateStatusRequest {
    pub container_name: String,
    pub status: CreateStatus,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub download_progress: u32,
}

/// Start progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartStatus {
    Unknown,
    Started,
    Cancelled,
    Failed,
}

/// Incremental container-start status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStartStatusRequest {
    pub container_name: String,
    pub status: StartStatus,
    #[serde(default)]
    pub failure_reason: String,
}

/// Deletion progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteStatus {
    Unknown,
    Deleted,
    Cancelled,
    Failed,
}

/// Incremental container-deletion status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDeleteStatusRequest {
    pub container_name: String,
    pub status: DeleteStatus,
    #[serde(default)]
    pub failure_reason: String,
}

/// Export/import progress states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Unknown,
    InProgress,
    Done,
    Cancelled,
    Failed,
}

/// Incremental container-export status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateExportStatusRequest {
    pub container_name: String,
    pub status: TransferStatus,
    #[serde(default)]
    pub progress_percent: u32,
    #[serde(default)]
    pub progress_speed: u64,
    #[serde(default)]
    pub failure_reason: String,
}

/// Incremental container-import status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateImportStatusRequest {
    pub container_name: String,
    pub status: TransferStatus,
    #[serde(default)]
    pub progress_percent: u32,
    #[serde(default)]
    pub progress_speed: u64,
    #[serde(default)]
    pub failure_reason: String,
}

// ---------------------------------------------------------------------------
// Data types: startup plane
// ---------------------------------------------------------------------------

/// Container failed to start. Posted without waiting so VM boot is never
/// blocked on signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStartupFailedRequest {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Data types: host → in-VM lifecycle agent
// ---------------------------------------------------------------------------

/// Ask the in-VM lifecycle agent to create a container from an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub container_name: String,
    pub image_server: String,
    pub image_alias: String,
}

/// Creation outcome. `Creating` means progress arrives later through
/// [`MessageType::UpdateCreateStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreateContainerStatus {
    Creating,
    Exists,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerResponse {
    pub status: CreateContainerStatus,
    #[serde(default)]
    pub failure_reason: String,
}

/// Ask the in-VM lifecycle agent to start a container. `token` is the
/// per-container security token the container agent will present back to
/// the host once it is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartContainerRequest {
    pub container_name: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartContainerStatus {
    Starting,
    Started,
    Running,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartContainerResponse {
    pub status: StartContainerStatus,
    #[serde(default)]
    pub failure_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteContainerRequest {
    pub container_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteContainerStatus {
    Deleting,
    DoesNotExist,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteContainerResponse {
    pub status: DeleteContainerStatus,
    #[serde(default)]
    pub failure_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportContainerRequest {
    pub container_name: String,
    pub export_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportContainerRequest {
    pub container_name: String,
    pub import_path: String,
}

/// Outcome of starting an export or import; progress arrives later through
/// the matching update tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStartStatus {
    InProgress,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferContainerResponse {
    pub status: TransferStartStatus,
    #[serde(default)]
    pub failure_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContainerInfoRequest {
    pub container_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerInfoStatus {
    Running,
    Stopped,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetContainerInfoResponse {
    pub status: ContainerInfoStatus,
    /// Container IPv4 address in network byte order (0 when not running).
    #[serde(default)]
    pub ipv4_address: u32,
    #[serde(default)]
    pub failure_reason: String,
}

// ---------------------------------------------------------------------------
// Data types: host → in-container agent
// ---------------------------------------------------------------------------

/// Launch an application installed in the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchApplicationRequest {
    pub desktop_file_id: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchApplicationResponse {
    pub success: bool,
    #[serde(default)]
    pub failure_reason: String,
}

/// Install a package file already present in the container filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPackageRequest {
    pub file_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStartStatus {
    Started,
    Failed,
    InstallAlreadyActive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPackageResponse {
    pub status: InstallStartStatus,
    #[serde(default)]
    pub failure_reason: String,
}

/// Start the shell forwarder inside the container on the given vsock port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchShellServerRequest {
    pub port: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchShellServerResponse {
    pub success: bool,
    #[serde(default)]
    pub failure_reason: String,
}

// ---------------------------------------------------------------------------
// RPC status reply
// ---------------------------------------------------------------------------

/// Result codes for unary control-plane RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    Internal,
}

/// Reply to every unary control-plane RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
}

impl RpcStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::InvalidArgument,
            message: message.into(),
        }
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::FailedPrecondition,
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::ResourceExhausted,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Internal,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = Message {
            tag: MessageType::Data,
            payload: b"hello".to_vec(),
        };
        let bytes = msg.serialize();
        let decoded = Message::deserialize(&bytes).unwrap();
        assert_eq!(decoded.tag, MessageType::Data);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let msg = Message {
            tag: MessageType::Data,
            payload: vec![0u8; 0x0102],
        };
        let bytes = msg.serialize();
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn message_empty_payload() {
        let msg = Message {
            tag: MessageType::TremplinReady,
            payload: vec![],
        };
        let bytes = msg.serialize();
        let decoded = Message::deserialize(&bytes).unwrap();
        assert_eq!(decoded.tag, MessageType::TremplinReady);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn message_type_try_from_valid() {
        for &(byte, expected) in &[
            (1u8, MessageType::SetupConnectionRequest),
            (2, MessageType::SetupConnectionResponse),
            (3, MessageType::Data),
            (4, MessageType::WindowResize),
            (5, MessageType::ConnectionStatus),
            (16, MessageType::ContainerReady),
            (17, MessageType::ContainerShutdown),
            (18, MessageType::UpdateApplicationList),
            (19, MessageType::OpenUrl),
            (32, MessageType::TremplinReady),
            (33, MessageType::UpdateCreateStatus),
            (48, MessageType::ContainerStartupFailed),
            (64, MessageType::RpcStatus),
        ] {
            assert_eq!(MessageType::try_from(byte).unwrap(), expected);
        }
    }

    #[test]
    fn message_type_try_from_invalid() {
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(6).is_err());
        assert!(MessageType::try_from(23).is_err());
        assert!(MessageType::try_from(255).is_err());
    }

    #[test]
    fn message_deserialize_too_short() {
        assert!(Message::deserialize(&[0, 0]).is_err());
    }

    #[test]
    fn message_deserialize_incomplete() {
        // Header says 10 bytes payload but only 2 present
        let data = [0, 0, 0, 10, 3, 0xAA, 0xBB];
        assert!(Message::deserialize(&data).is_err());
    }

    #[test]
    fn read_from_round_trip() {
        let msg = Message::encode(
            MessageType::OpenUrl,
            &OpenUrlRequest {
                token: "tok".to_string(),
                url: "http://localhost:8000/".to_string(),
            },
        )
        .unwrap();
        let bytes = msg.serialize();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Message::read_from(&mut cursor, MAX_CONTROL_FRAME).unwrap();
        assert_eq!(decoded.tag, MessageType::OpenUrl);
        let req: OpenUrlRequest = decoded.decode().unwrap();
        assert_eq!(req.url, "http://localhost:8000/");
    }

    #[test]
    fn read_from_rejects_oversize_frame() {
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_SHELL_FRAME as u32 + 1).to_be_bytes());
        header.push(MessageType::Data as u8);
        let mut cursor = std::io::Cursor::new(header);
        match Message::read_from(&mut cursor, MAX_SHELL_FRAME) {
            Err(ProtocolError::FrameTooLarge { len, max }) => {
                assert_eq!(len, MAX_SHELL_FRAME + 1);
                assert_eq!(max, MAX_SHELL_FRAME);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|m| m.tag)),
        }
    }

    #[test]
    fn setup_request_defaults() {
        let req: SetupConnectionRequest =
            serde_json::from_str(r#"{"target":"vm_shell"}"#).unwrap();
        assert_eq!(req.target, VM_SHELL_TARGET);
        assert!(req.user.is_empty());
        assert!(!req.nopty);
        assert!(req.env.is_empty());
        assert!(req.argv.is_empty());
        assert_eq!(req.window_rows, 0);
        assert_eq!(req.window_cols, 0);
    }

    #[test]
    fn data_message_empty_is_eof_marker() {
        let msg = Message::encode(
            MessageType::Data,
            &DataMessage {
                stream: StdioStream::Stdin,
                data: Vec::new(),
            },
        )
        .unwrap();
        let decoded: DataMessage = Message::deserialize(&msg.serialize())
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(decoded.stream, StdioStream::Stdin);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn connection_status_json_names() {
        let json = serde_json::to_string(&ConnectionStatus::Exited).unwrap();
        assert_eq!(json, r#""EXITED""#);
        let back: ConnectionStatus = serde_json::from_str(r#""READY""#).unwrap();
        assert_eq!(back, ConnectionStatus::Ready);
    }

    #[test]
    fn rpc_status_helpers() {
        assert!(RpcStatus::ok().is_ok());
        let s = RpcStatus::failed_precondition("no VM for cid");
        assert_eq!(s.code, StatusCode::FailedPrecondition);
        assert!(!s.is_ok());
        let s = RpcStatus::resource_exhausted("quota");
        assert_eq!(s.code, StatusCode::ResourceExhausted);
    }

    #[test]
    fn update_create_status_round_trip() {
        let req = UpdateCreateStatusRequest {
            container_name: "penguin".to_string(),
            status: CreateStatus::Downloading,
            failure_reason: String::new(),
            download_progress: 42,
        };
        let json = serde_json::to_vec(&req).unwrap();
        let back: UpdateCreateStatusRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.status, CreateStatus::Downloading);
        assert_eq!(back.download_progress, 42);
    }

    #[test]
    fn app_list_guest_fields_deserialize_with_defaults() {
        // A guest never sends vm_name/owner_id; they must default cleanly.
        let req: UpdateApplicationListRequest = serde_json::from_str(
            r#"{"token":"t","apps":[{"desktop_file_id":"vim.desktop"}]}"#,
        )
        .unwrap();
        assert!(req.vm_name.is_empty());
        assert!(req.owner_id.is_empty());
        assert_eq!(req.apps.len(), 1);
        assert_eq!(req.apps[0].desktop_file_id, "vim.desktop");
    }
}
