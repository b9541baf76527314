//! Stubs for the in-guest agents.
//!
//! [`TremplinStub`] talks to the per-VM lifecycle agent; [`GarconStub`]
//! talks to the per-container agent. Both frame a single request over a
//! fresh connection and wait for the typed reply under a bounded deadline,
//! so the control thread can never block forever on a wedged guest.
//!
//! The transport is injected through [`GuestConnector`]; production wires
//! vsock (or TCP for legacy containers), tests wire loopback sockets.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::warn;
use vm_relay_protocol::{
    CreateContainerRequest, CreateContainerResponse, DeleteContainerRequest,
    DeleteContainerResponse, ExportContainerRequest, GetContainerInfoRequest,
    GetContainerInfoResponse, ImportContainerRequest, InstallPackageRequest,
    InstallPackageResponse, LaunchApplicationRequest, LaunchApplicationResponse,
    LaunchShellServerRequest, LaunchShellServerResponse, Message, MessageType,
    StartContainerRequest, StartContainerResponse, TransferContainerResponse,
    MAX_CONTROL_FRAME, TREMPLIN_LISTENER_PORT,
};

use crate::error::{Error, Result};
use crate::token::GarconEndpoint;
use crate::vsock::VsockStream;

/// How long to wait on regular per-container RPCs.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait while creating or starting a container.
pub const LONG_OPERATION_TIMEOUT: Duration = Duration::from_secs(150);

/// How long to wait on maintenance RPCs.
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream to a guest agent with timeout control.
pub trait GuestStream: Read + Write + Send {
    /// Set the read timeout. `None` means blocking (no timeout).
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl GuestStream for VsockStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        VsockStream::set_read_timeout(self, timeout)
    }
}

impl GuestStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// A function that opens a fresh connection to a guest agent.
pub type GuestConnector = Box<dyn Fn() -> io::Result<Box<dyn GuestStream>> + Send + Sync>;

/// Issues one framed request and decodes the expected reply.
fn unary_call(
    connector: &GuestConnector,
    endpoint: &str,
    request: Message,
    expect: MessageType,
    timeout: Duration,
) -> Result<Message> {
    let mut stream = (connector)()
        .map_err(|e| Error::Unavailable(format!("connect to {}: {}", endpoint, e)))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| Error::Unavailable(format!("set deadline on {}: {}", endpoint, e)))?;

    stream
        .write_all(&request.serialize())
        .map_err(|e| Error::Unavailable(format!("send to {}: {}", endpoint, e)))?;

    let reply = Message::read_from(&mut stream, MAX_CONTROL_FRAME)
        .map_err(|e| Error::Unavailable(format!("reply from {}: {}", endpoint, e)))?;
    if reply.tag != expect {
        warn!(endpoint, got = ?reply.tag, want = ?expect, "unexpected reply tag");
        return Err(Error::Unavailable(format!(
            "unexpected reply tag from {}: {:?}",
            endpoint, reply.tag
        )));
    }
    Ok(reply)
}

/// Client stub for the in-VM lifecycle agent.
pub struct TremplinStub {
    endpoint: String,
    connector: GuestConnector,
}

impl std::fmt::Debug for TremplinStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TremplinStub")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl TremplinStub {
    pub fn new(endpoint: String, connector: GuestConnector) -> Self {
        Self {
            endpoint,
            connector,
        }
    }

    /// Stub reaching the agent at `vsock:<cid>` on the well-known port.
    pub fn vsock(cid: u32) -> Self {
        let endpoint = format!("vsock:{}:{}", cid, TREMPLIN_LISTENER_PORT);
        Self::new(
            endpoint,
            Box::new(move || {
                VsockStream::connect(cid, TREMPLIN_LISTENER_PORT)
                    .map(|s| Box::new(s) as Box<dyn GuestStream>)
            }),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call<Req: serde::Serialize, Resp: for<'de> serde::Deserialize<'de>>(
        &self,
        tag: MessageType,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let message = Message::encode(tag, request)?;
        let reply = unary_call(
            &self.connector,
            &self.endpoint,
            message,
            MessageType::TremplinReply,
            timeout,
        )?;
        Ok(reply.decode()?)
    }

    pub fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        self.call(
            MessageType::CreateContainer,
            request,
            LONG_OPERATION_TIMEOUT,
        )
    }

    pub fn start_container(
        &self,
        request: &StartContainerRequest,
    ) -> Result<StartContainerResponse> {
        self.call(MessageType::StartContainer, request, LONG_OPERATION_TIMEOUT)
    }

    pub fn delete_container(
        &self,
        request: &DeleteContainerRequest,
    ) -> Result<DeleteContainerResponse> {
        self.call(MessageType::DeleteContainer, request, DEFAULT_RPC_TIMEOUT)
    }

    pub fn export_container(
        &self,
        request: &ExportContainerRequest,
    ) -> Result<TransferContainerResponse> {
        self.call(MessageType::ExportContainer, request, DEFAULT_RPC_TIMEOUT)
    }

    pub fn import_container(
        &self,
        request: &ImportContainerRequest,
    ) -> Result<TransferContainerResponse> {
        self.call(MessageType::ImportContainer, request, DEFAULT_RPC_TIMEOUT)
    }

    pub fn get_container_info(
        &self,
        request: &GetContainerInfoRequest,
    ) -> Result<GetContainerInfoResponse> {
        self.call(MessageType::GetContainerInfo, request, MAINTENANCE_TIMEOUT)
    }
}

/// Client stub for the in-container agent.
pub struct GarconStub {
    endpoint: String,
    connector: GuestConnector,
}

impl std::fmt::Debug for GarconStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarconStub")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl GarconStub {
    pub fn new(endpoint: String, connector: GuestConnector) -> Self {
        Self {
            endpoint,
            connector,
        }
    }

    /// Stub for a registered container's agent endpoint.
    pub fn for_endpoint(endpoint: GarconEndpoint) -> Self {
        match endpoint {
            GarconEndpoint::Vsock { cid, port } => Self::new(
                format!("vsock:{}:{}", cid, port),
                Box::new(move || {
                    VsockStream::connect(cid, port).map(|s| Box::new(s) as Box<dyn GuestStream>)
                }),
            ),
            GarconEndpoint::Tcp { addr, port } => {
                let sock_addr = SocketAddr::from((addr, port));
                Self::new(
                    format!("{}", sock_addr),
                    Box::new(move || {
                        TcpStream::connect(sock_addr)
                            .map(|s| Box::new(s) as Box<dyn GuestStream>)
                    }),
                )
            }
        }
    }

    fn call<Req: serde::Serialize, Resp: for<'de> serde::Deserialize<'de>>(
        &self,
        tag: MessageType,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let message = Message::encode(tag, request)?;
        let reply = unary_call(
            &self.connector,
            &self.endpoint,
            message,
            MessageType::GarconReply,
            timeout,
        )?;
        Ok(reply.decode()?)
    }

    pub fn launch_application(
        &self,
        request: &LaunchApplicationRequest,
    ) -> Result<LaunchApplicationResponse> {
        self.call(MessageType::LaunchApplication, request, DEFAULT_RPC_TIMEOUT)
    }

    pub fn install_package(
        &self,
        request: &InstallPackageRequest,
    ) -> Result<InstallPackageResponse> {
        self.call(MessageType::InstallPackage, request, DEFAULT_RPC_TIMEOUT)
    }

    pub fn launch_shell_server(
        &self,
        request: &LaunchShellServerRequest,
    ) -> Result<LaunchShellServerResponse> {
        self.call(MessageType::LaunchShellServer, request, DEFAULT_RPC_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use vm_relay_protocol::CreateContainerStatus;

    fn tcp_connector(addr: SocketAddr) -> GuestConnector {
        Box::new(move || {
            TcpStream::connect(addr).map(|s| Box::new(s) as Box<dyn GuestStream>)
        })
    }

    /// One-shot server answering a single request with `reply`.
    fn serve_one(reply: Message) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _request = Message::read_from(&mut stream, MAX_CONTROL_FRAME).unwrap();
            stream.write_all(&reply.serialize()).unwrap();
        });
        addr
    }

    #[test]
    fn create_container_round_trips() {
        let reply = Message::encode(
            MessageType::TremplinReply,
            &CreateContainerResponse {
                status: CreateContainerStatus::Creating,
                failure_reason: String::new(),
            },
        )
        .unwrap();
        let addr = serve_one(reply);

        let stub = TremplinStub::new("test".to_string(), tcp_connector(addr));
        let response = stub
            .create_container(&CreateContainerRequest {
                container_name: "penguin".to_string(),
                image_server: "https://images.example.com".to_string(),
                image_alias: "debian/bookworm".to_string(),
            })
            .unwrap();
        assert_eq!(response.status, CreateContainerStatus::Creating);
    }

    #[test]
    fn unexpected_reply_tag_is_unavailable() {
        let reply = Message::encode(
            MessageType::GarconReply,
            &LaunchApplicationResponse {
                success: true,
                failure_reason: String::new(),
            },
        )
        .unwrap();
        let addr = serve_one(reply);

        let stub = TremplinStub::new("test".to_string(), tcp_connector(addr));
        match stub.get_container_info(&GetContainerInfoRequest {
            container_name: "penguin".to_string(),
        }) {
            Err(Error::Unavailable(_)) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn connect_failure_is_unavailable() {
        // A listener that was dropped refuses connections.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let stub = GarconStub::new("test".to_string(), tcp_connector(addr));
        match stub.launch_application(&LaunchApplicationRequest {
            desktop_file_id: "vim.desktop".to_string(),
            files: vec![],
        }) {
            Err(Error::Unavailable(_)) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }
}
