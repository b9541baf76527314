//! Guest-facing listener threads.
//!
//! Each plane binds its own well-known port and serves connections on
//! short-lived threads. Handlers never mutate service state directly: every
//! request becomes a task posted to the control thread.

pub mod addr;
pub mod container;
pub mod startup;
pub mod tremplin;

use std::net::TcpListener;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::service::ControlHandle;
use crate::vsock::{VsockListener, VsockStream};

/// Accepts vsock connections on `port` and serves each with `handler` on
/// its own thread. The peer string follows the `vsock:<cid>:<port>` form
/// the address parser expects.
pub fn spawn_vsock_listener(
    name: &'static str,
    port: u32,
    handle: ControlHandle,
    handler: fn(&mut VsockStream, &str, &ControlHandle),
) -> Result<std::thread::JoinHandle<()>> {
    let listener = VsockListener::bind(port)?;
    info!(name, port, "vsock listener bound");

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match listener.accept() {
                Ok((mut stream, peer_cid, peer_port)) => {
                    let peer = format!("vsock:{}:{}", peer_cid, peer_port);
                    let handle = handle.clone();
                    if let Err(e) = std::thread::Builder::new()
                        .name(format!("{}-conn", name))
                        .spawn(move || handler(&mut stream, &peer, &handle))
                    {
                        warn!(name, error = %e, "failed to spawn connection thread");
                    }
                }
                Err(e) => {
                    warn!(name, error = %e, "accept failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        })?;
    Ok(thread)
}

/// Legacy TCP endpoint for the container plane: containers that predate the
/// vsock transport reach the host over their subnet. The peer string uses
/// the `ipv4:<addr>:<port>` form so the container-ip lookup applies.
pub fn spawn_tcp_listener(
    name: &'static str,
    port: u16,
    handle: ControlHandle,
    handler: fn(&mut std::net::TcpStream, &str, &ControlHandle),
) -> Result<std::thread::JoinHandle<()>> {
    let listener = TcpListener::bind(("::", port))
        .or_else(|_| TcpListener::bind(("0.0.0.0", port)))?;
    info!(name, port, "tcp listener bound");

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let peer = match peer_addr {
                        std::net::SocketAddr::V4(v4) => {
                            format!("ipv4:{}:{}", v4.ip(), v4.port())
                        }
                        std::net::SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                            Some(ip) => format!("ipv4:{}:{}", ip, v6.port()),
                            None => format!("ipv6:{}:{}", v6.ip(), v6.port()),
                        },
                    };
                    let handle = handle.clone();
                    if let Err(e) = std::thread::Builder::new()
                        .name(format!("{}-conn", name))
                        .spawn(move || handler(&mut stream, &peer, &handle))
                    {
                        warn!(name, error = %e, "failed to spawn connection thread");
                    }
                }
                Err(e) => {
                    warn!(name, error = %e, "accept failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        })?;
    Ok(thread)
}
