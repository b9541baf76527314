//! The container listener plane.
//!
//! Receives RPCs from in-container agents, derives the originating VM from
//! the peer address, and posts each request to the control thread, blocking
//! on the completion handle before replying to the guest.

use std::io::{Read, Write};

use tracing::debug;
use vm_relay_protocol::{Message, MessageType, RpcStatus, MAX_CONTROL_FRAME};

use crate::listener::addr::{parse_peer_address, PeerAddress};
use crate::service::{ControlHandle, GuestSource};

/// Serves one connection: a sequence of framed requests, each answered with
/// an [`RpcStatus`] frame. Returns when the peer closes or framing breaks.
pub fn handle_connection<S: Read + Write>(stream: &mut S, peer: &str, handle: &ControlHandle) {
    loop {
        let message = match Message::read_from(stream, MAX_CONTROL_FRAME) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer, error = %e, "container connection closed");
                return;
            }
        };

        let status = dispatch(&message, peer, handle);
        let reply = match Message::encode(MessageType::RpcStatus, &status) {
            Ok(m) => m,
            Err(_) => return,
        };
        if stream.write_all(&reply.serialize()).is_err() {
            return;
        }
    }
}

fn source_for(peer: &str) -> Result<GuestSource, RpcStatus> {
    match parse_peer_address(peer) {
        Some(PeerAddress::Vsock { cid, .. }) => Ok(GuestSource::Cid(cid)),
        Some(PeerAddress::Ipv4 { addr, .. }) => Ok(GuestSource::ContainerIp(addr)),
        None => Err(RpcStatus::failed_precondition(
            "failed to parse peer address",
        )),
    }
}

fn check_token(token: &str) -> Result<(), RpcStatus> {
    if token.is_empty() {
        return Err(RpcStatus::invalid_argument("container token is empty"));
    }
    Ok(())
}

fn dispatch(message: &Message, peer: &str, handle: &ControlHandle) -> RpcStatus {
    let source = match source_for(peer) {
        Ok(source) => source,
        Err(status) => return status,
    };

    macro_rules! tokened {
        ($method:ident, $req_ty:ty) => {{
            let request: $req_ty = match message.decode() {
                Ok(r) => r,
                Err(e) => return RpcStatus::invalid_argument(format!("bad payload: {}", e)),
            };
            if let Err(status) = check_token(&request.token) {
                return status;
            }
            handle.$method(source, request)
        }};
    }

    match message.tag {
        MessageType::ContainerReady => tokened!(container_ready, vm_relay_protocol::ContainerReadyRequest),
        MessageType::ContainerShutdown => tokened!(container_shutdown, vm_relay_protocol::ContainerShutdownRequest),
        MessageType::UpdateApplicationList => tokened!(update_application_list, vm_relay_protocol::UpdateApplicationListRequest),
        MessageType::OpenUrl => tokened!(open_url, vm_relay_protocol::OpenUrlRequest),
        MessageType::OpenTerminal => tokened!(open_terminal, vm_relay_protocol::OpenTerminalRequest),
        MessageType::InstallPackageProgress => tokened!(install_package_progress, vm_relay_protocol::InstallPackageProgressRequest),
        MessageType::PendingAppListUpdates => tokened!(pending_app_list_updates, vm_relay_protocol::PendingAppListUpdatesRequest),
        other => RpcStatus::invalid_argument(format!(
            "unexpected message on the container plane: {:?}",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{
        Collaborators, ContainerSpec, ControlService, NotifyVmStartedRequest,
    };
    use std::net::Ipv4Addr;
    use vm_relay_protocol::{ContainerReadyRequest, OpenUrlRequest, StatusCode};

    /// In-memory transport: reads pre-built frames, captures replies.
    struct Pipe {
        input: std::io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Pipe {
        fn new(frames: Vec<Message>) -> Self {
            let mut input = Vec::new();
            for frame in frames {
                input.extend_from_slice(&frame.serialize());
            }
            Self {
                input: std::io::Cursor::new(input),
                output: Vec::new(),
            }
        }

        fn replies(&self) -> Vec<RpcStatus> {
            let mut cursor = std::io::Cursor::new(self.output.clone());
            let mut out = Vec::new();
            while let Ok(message) = Message::read_from(&mut cursor, MAX_CONTROL_FRAME) {
                assert_eq!(message.tag, MessageType::RpcStatus);
                out.push(message.decode().unwrap());
            }
            out
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn harness() -> (ControlHandle, tempfile::TempDir) {
        let runtime = tempfile::TempDir::new().unwrap();
        let (handle, _thread) =
            ControlService::spawn(Collaborators::logging(), runtime.path().to_path_buf());
        handle
            .notify_vm_started(NotifyVmStartedRequest {
                owner_id: "alice".to_string(),
                vm_name: "termina".to_string(),
                cid: 3,
                container_subnet: Ipv4Addr::new(100, 115, 92, 4),
                container_netmask: Ipv4Addr::new(255, 255, 255, 252),
                ipv4_addr: Ipv4Addr::new(100, 115, 92, 6),
            })
            .unwrap();
        (handle, runtime)
    }

    #[test]
    fn container_ready_over_the_wire() {
        let (handle, _runtime) = harness();
        let token = handle
            .get_container_token(ContainerSpec {
                owner_id: "alice".to_string(),
                vm_name: "termina".to_string(),
                container_name: "penguin".to_string(),
            })
            .unwrap()
            .token;

        let mut pipe = Pipe::new(vec![Message::encode(
            MessageType::ContainerReady,
            &ContainerReadyRequest {
                token,
                garcon_vsock_port: 8891,
                container_ipv4: 0,
            },
        )
        .unwrap()]);
        handle_connection(&mut pipe, "vsock:3:1024", &handle);

        let replies = pipe.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ok(), "{:?}", replies[0]);
    }

    #[test]
    fn unparseable_peer_is_failed_precondition() {
        let (handle, _runtime) = harness();
        let mut pipe = Pipe::new(vec![Message::encode(
            MessageType::OpenUrl,
            &OpenUrlRequest {
                token: "tok".to_string(),
                url: "https://example.com".to_string(),
            },
        )
        .unwrap()]);
        handle_connection(&mut pipe, "unix:/run/x", &handle);

        let replies = pipe.replies();
        assert_eq!(replies[0].code, StatusCode::FailedPrecondition);
    }

    #[test]
    fn empty_token_is_invalid_argument() {
        let (handle, _runtime) = harness();
        let mut pipe = Pipe::new(vec![Message::encode(
            MessageType::OpenUrl,
            &OpenUrlRequest {
                token: String::new(),
                url: "https://example.com".to_string(),
            },
        )
        .unwrap()]);
        handle_connection(&mut pipe, "vsock:3", &handle);

        let replies = pipe.replies();
        assert_eq!(replies[0].code, StatusCode::InvalidArgument);
    }

    #[test]
    fn wrong_plane_tag_is_invalid_argument() {
        let (handle, _runtime) = harness();
        let mut pipe = Pipe::new(vec![Message {
            tag: MessageType::TremplinReady,
            payload: b"{}".to_vec(),
        }]);
        handle_connection(&mut pipe, "vsock:3", &handle);

        let replies = pipe.replies();
        assert_eq!(replies[0].code, StatusCode::InvalidArgument);
    }

    #[test]
    fn multiple_requests_share_one_connection() {
        let (handle, _runtime) = harness();
        let frame = Message::encode(
            MessageType::OpenUrl,
            &OpenUrlRequest {
                token: "unknown".to_string(),
                url: "https://example.com".to_string(),
            },
        )
        .unwrap();
        let mut pipe = Pipe::new(vec![frame.clone(), frame]);
        handle_connection(&mut pipe, "vsock:3", &handle);

        assert_eq!(pipe.replies().len(), 2);
    }
}
