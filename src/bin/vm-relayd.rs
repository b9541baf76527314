//! vm-relayd — the host control-service daemon.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vm_relay::listener::{container, spawn_tcp_listener, spawn_vsock_listener, startup, tremplin};
use vm_relay::service::{Collaborators, ControlHandle, ControlService};
use vm_relay::vsock::VsockStream;
use vm_relay::{ipc, vmm};
use vm_relay_protocol::{
    CONTAINER_LISTENER_PORT, STARTUP_LISTENER_PORT, TREMPLIN_LISTENER_PORT,
};

#[derive(Parser)]
#[command(name = "vm-relayd", about = "VM/container control service")]
struct Args {
    /// Host IPC socket path.
    #[arg(long, default_value = ipc::SOCKET_PATH)]
    ipc_socket: PathBuf,

    /// VM runtime directory (control sockets, pid files, pools).
    #[arg(long, default_value = vmm::RUNTIME_DIR)]
    runtime_dir: PathBuf,

    /// Skip the legacy TCP container listener.
    #[arg(long)]
    no_tcp_listener: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let (handle, control_thread) =
        ControlService::spawn(Collaborators::logging(), args.runtime_dir.clone());

    // Guest-facing listeners. A missing vsock transport (no VMs possible)
    // is downgraded to a warning so the host surface still comes up.
    type VsockHandler = fn(&mut VsockStream, &str, &ControlHandle);
    let planes: [(&str, u32, VsockHandler); 3] = [
        (
            "container-listener",
            CONTAINER_LISTENER_PORT,
            container::handle_connection::<VsockStream>,
        ),
        (
            "startup-listener",
            STARTUP_LISTENER_PORT,
            startup::handle_connection::<VsockStream>,
        ),
        (
            "tremplin-listener",
            TREMPLIN_LISTENER_PORT,
            tremplin::handle_connection::<VsockStream>,
        ),
    ];
    for (name, port, handler) in planes {
        if let Err(e) = spawn_vsock_listener(name, port, handle.clone(), handler) {
            warn!(name, error = %e, "vsock listener unavailable");
        }
    }

    if !args.no_tcp_listener {
        if let Err(e) = spawn_tcp_listener(
            "container-listener-tcp",
            CONTAINER_LISTENER_PORT as u16,
            handle.clone(),
            container::handle_connection::<std::net::TcpStream>,
        ) {
            warn!(error = %e, "legacy tcp listener unavailable");
        }
    }

    let ipc_handle = handle.clone();
    let ipc_socket = args.ipc_socket.clone();
    let server = tokio::spawn(async move { ipc::serve(&ipc_socket, ipc_handle).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        result = server => {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "IPC server exited");
            }
        }
    }

    handle.shutdown();
    let _ = tokio::task::spawn_blocking(move || control_thread.join()).await;
    Ok(())
}
