//! The tremplin listener plane.
//!
//! Receives lifecycle progress from the in-VM agent. Peers must be vsock;
//! there is no legacy TCP path on this plane.

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
                debug!(peer, error = %e, "tremplin connection closed");
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

fn cid_for(peer: &str) -> Result<u32, RpcStatus> {
    match parse_peer_address(peer) {
        Some(PeerAddress::Vsock { cid, .. }) => Ok(cid),
        _ => Err(RpcStatus::failed_precondition(
            "failed to parse vsock cid for tremplin listener",
        )),
    }
}

fn dispatch(message: &Message, peer: &str, handle: &ControlHandle) -> RpcStatus {
    let cid = match cid_for(peer) {
        Ok(cid) => cid,
        Err(status) => return status,
    };

    macro_rules! relay {
        ($method:ident) => {
            match message.decode() {
                Ok(request) => handle.$method(cid, request),
                Err(e) => RpcStatus::invalid_argument(format!("bad payload: {}", e)),
            }
        };
    }

    match message.tag {
        MessageType::TremplinReady => handle.tremplin_ready(cid),
        MessageType::UpdateCreateStatus => relay!(update_create_status),
        MessageType::UpdateStartStatus => relay!(update_start_status),
        MessageType::UpdateDeleteStatus => relay!(update_delete_status),
        MessageType::UpdateExportStatus => relay!(update_export_status),
        MessageType::UpdateImportStatus => relay!(update_import_status),
        other => RpcStatus::invalid_argument(format!(
            "unexpected message on the tremplin plane: {:?}",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_relay_protocol::StatusCode;

    #[test]
    fn ipv4_peer_is_rejected() {
        match cid_for("ipv4:100.115.92.6:40000") {
            Err(status) => assert_eq!(status.code, StatusCode::FailedPrecondition),
            Ok(_) => panic!("ipv4 peers must not reach the tremplin plane"),
        }
    }

    #[test]
    fn vsock_peer_yields_cid() {
        assert_eq!(cid_for("vsock:12").unwrap(), 12);
        assert_eq!(cid_for("vsock:12:8890").unwrap(), 12);
    }
}
