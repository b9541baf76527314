//! The startup listener plane.
//!
//! Container startup failures arrive on their own endpoint and are posted
//! to the control thread without a completion handle, so a VM booting many
//! containers is never blocked on host-side signaling.

use std::io::{Read, Write};

use tracing::debug;
use vm_relay_protocol::{Message, MessageType, RpcStatus, MAX_CONTROL_FRAME};

use crate::listener::addr::{parse_peer_address, PeerAddress};
use crate::service::ControlHandle;

pub fn handle_connection<S: Read + Write>(stream: &mut S, peer: &str, handle: &ControlHandle) {
    loop {
        let message = match Message::read_from(stream, MAX_CONTROL_FRAME) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer, error = %e, "startup connection closed");
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

fn dispatch(message: &Message, peer: &str, handle: &ControlHandle) -> RpcStatus {
    let cid = match parse_peer_address(peer) {
        Some(PeerAddress::Vsock { cid, .. }) => cid,
        _ => {
            return RpcStatus::failed_precondition(
                "failed to parse vsock cid for startup listener",
            )
        }
    };

    match message.tag {
        MessageType::ContainerStartupFailed => match message.decode() {
            Ok(request) => {
                handle.container_startup_failed(cid, request);
                RpcStatus::ok()
            }
            Err(e) => RpcStatus::invalid_argument(format!("bad payload: {}", e)),
        },
        other => RpcStatus::invalid_argument(format!(
            "unexpected message on the startup plane: {:?}",
            other
        )),
    }
}
