//! End-to-end exercise of the listener plane against a live control thread,
//! with the guest side simulated over a loopback TCP connection (the legacy
//! container transport).

use std::io::Write;
use std::net::{Ipv4Addr, TcpListener, TcpStream};

use vm_relay::listener::container;
use vm_relay::service::{
    Collaborators, ContainerSpec, ControlHandle, ControlService, NotifyVmStartedRequest, VmSpec,
};
use vm_relay_protocol::{
    ContainerReadyRequest, Message, MessageType, OpenUrlRequest, RpcStatus, StatusCode,
    MAX_CONTROL_FRAME,
};

struct Guest {
    stream: TcpStream,
}

impl Guest {
    /// Connects to a freshly-spawned connection handler, exactly as an
    /// in-container agent would reach the host listener.
    fn connect(handle: ControlHandle) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, peer) = listener.accept().unwrap();
            let peer = format!("ipv4:{}:{}", peer.ip(), peer.port());
            container::handle_connection(&mut stream, &peer, &handle);
        });
        Self {
            stream: TcpStream::connect(addr).unwrap(),
        }
    }

    fn rpc<T: serde::Serialize>(&mut self, tag: MessageType, body: &T) -> RpcStatus {
        let frame = Message::encode(tag, body).unwrap();
        self.stream.write_all(&frame.serialize()).unwrap();
        let reply = Message::read_from(&mut self.stream, MAX_CONTROL_FRAME).unwrap();
        assert_eq!(reply.tag, MessageType::RpcStatus);
        reply.decode().unwrap()
    }
}

fn start_vm(handle: &ControlHandle) {
    // Put loopback inside the "container subnet" so the legacy
    // container-ip lookup resolves the test connection to this VM.
    handle
        .notify_vm_started(NotifyVmStartedRequest {
            owner_id: "alice".to_string(),
            vm_name: "termina".to_string(),
            cid: 3,
            container_subnet: Ipv4Addr::new(127, 0, 0, 0),
            container_netmask: Ipv4Addr::new(255, 0, 0, 0),
            ipv4_addr: Ipv4Addr::new(127, 0, 0, 1),
        })
        .unwrap();
}

fn container_token(handle: &ControlHandle) -> String {
    handle
        .get_container_token(ContainerSpec {
            owner_id: "alice".to_string(),
            vm_name: "termina".to_string(),
            container_name: "penguin".to_string(),
        })
        .unwrap()
        .token
}

#[test]
fn container_registers_and_reports_running() {
    let runtime = tempfile::TempDir::new().unwrap();
    let (handle, _thread) =
        ControlService::spawn(Collaborators::logging(), runtime.path().to_path_buf());
    start_vm(&handle);
    let token = container_token(&handle);

    let mut guest = Guest::connect(handle.clone());
    let status = guest.rpc(
        MessageType::ContainerReady,
        &ContainerReadyRequest {
            token,
            garcon_vsock_port: 0,
            container_ipv4: 0,
        },
    );
    assert!(status.is_ok(), "{:?}", status);

    let running = handle
        .is_container_running(ContainerSpec {
            owner_id: "alice".to_string(),
            vm_name: "termina".to_string(),
            container_name: "penguin".to_string(),
        })
        .unwrap();
    assert!(running.running);
}

#[test]
fn open_url_quota_is_enforced_over_the_wire() {
    let runtime = tempfile::TempDir::new().unwrap();
    let (handle, _thread) =
        ControlService::spawn(Collaborators::logging(), runtime.path().to_path_buf());
    start_vm(&handle);
    let token = container_token(&handle);

    let mut guest = Guest::connect(handle.clone());
    let status = guest.rpc(
        MessageType::ContainerReady,
        &ContainerReadyRequest {
            token: token.clone(),
            garcon_vsock_port: 0,
            container_ipv4: 0,
        },
    );
    assert!(status.is_ok());

    for i in 0..10 {
        let status = guest.rpc(
            MessageType::OpenUrl,
            &OpenUrlRequest {
                token: token.clone(),
                url: format!("https://example.com/{}", i),
            },
        );
        assert!(status.is_ok(), "request {} should pass: {:?}", i, status);
    }

    let status = guest.rpc(
        MessageType::OpenUrl,
        &OpenUrlRequest {
            token,
            url: "https://example.com/over-quota".to_string(),
        },
    );
    assert_eq!(status.code, StatusCode::ResourceExhausted);
}

#[test]
fn vm_stop_clears_registered_containers() {
    let runtime = tempfile::TempDir::new().unwrap();
    let (handle, _thread) =
        ControlService::spawn(Collaborators::logging(), runtime.path().to_path_buf());
    start_vm(&handle);
    let token = container_token(&handle);

    let mut guest = Guest::connect(handle.clone());
    assert!(guest
        .rpc(
            MessageType::ContainerReady,
            &ContainerReadyRequest {
                token: token.clone(),
                garcon_vsock_port: 0,
                container_ipv4: 0,
            },
        )
        .is_ok());

    handle
        .notify_vm_stopped(VmSpec {
            owner_id: "alice".to_string(),
            vm_name: "termina".to_string(),
        })
        .unwrap();

    // The VM is gone, so the same peer no longer resolves.
    let status = guest.rpc(
        MessageType::ContainerReady,
        &ContainerReadyRequest {
            token,
            garcon_vsock_port: 0,
            container_ipv4: 0,
        },
    );
    assert_eq!(status.code, StatusCode::FailedPrecondition);
}
