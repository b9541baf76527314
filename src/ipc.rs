//! The host IPC surface.
//!
//! Upstream host components (session UI, launchers, maintenance jobs) reach
//! the control service over a Unix socket speaking newline-delimited JSON:
//! `{"method": "...", "params": {...}}` in, an envelope with `success`,
//! `failure_reason`, and the method result out. Each request is dispatched
//! to the control thread and answered in order on its connection.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::service::ControlHandle;

/// Default socket path on a production host.
pub const SOCKET_PATH: &str = "/run/vm-relay/relay.sock";

#[derive(Debug, Deserialize)]
struct IpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct IpcResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
}

impl IpcResponse {
    fn ok(result: Value) -> Self {
        Self {
            success: true,
            failure_reason: None,
            result: Some(result),
        }
    }

    fn err(e: &Error) -> Self {
        Self {
            success: false,
            failure_reason: Some(e.to_string()),
            result: None,
        }
    }
}

/// Binds the socket (replacing a stale one) and serves until the listener
/// task is dropped.
pub async fn serve(path: &Path, handle: ControlHandle) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "host IPC listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, handle).await {
                debug!(error = %e, "IPC connection ended");
            }
        });
    }
}

async fn handle_stream(stream: UnixStream, handle: ControlHandle) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                let handle = handle.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    route(&handle, &request.method, request.params)
                })
                .await
                .unwrap_or_else(|e| Err(Error::Fatal(format!("IPC handler panicked: {}", e))));
                match outcome {
                    Ok(result) => IpcResponse::ok(result),
                    Err(e) => {
                        warn!(error = %e, "IPC method failed");
                        IpcResponse::err(&e)
                    }
                }
            }
            Err(e) => IpcResponse::err(&Error::BadInput(format!("invalid request: {}", e))),
        };

        let mut payload = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
    Ok(())
}

fn call<Req, Resp>(params: Value, f: impl FnOnce(Req) -> Result<Resp>) -> Result<Value>
where
    Req: for<'de> Deserialize<'de>,
    Resp: Serialize,
{
    let request: Req =
        serde_json::from_value(params).map_err(|e| Error::BadInput(format!("bad params: {}", e)))?;
    let response = f(request)?;
    Ok(serde_json::to_value(response)?)
}

fn route(handle: &ControlHandle, method: &str, params: Value) -> Result<Value> {
    match method {
        "StartVm" => call(params, |r| handle.start_vm(r)),
        "NotifyVmStarted" => call(params, |r| handle.notify_vm_started(r)),
        "NotifyVmStopped" => call(params, |r| handle.notify_vm_stopped(r)),
        "StopVm" => call(params, |r| handle.stop_vm(r)),
        "GetVmInfo" => call(params, |r| handle.get_vm_info(r)),
        "GetContainerToken" => call(params, |r| handle.get_container_token(r)),
        "IsContainerRunning" => call(params, |r| handle.is_container_running(r)),
        "LaunchContainerApplication" => {
            call(params, |r| handle.launch_container_application(r))
        }
        "InstallLinuxPackage" => call(params, |r| handle.install_linux_package(r)),
        "LaunchShellServer" => call(params, |r| handle.launch_shell_server(r)),
        "CreateLxdContainer" => call(params, |r| handle.create_lxd_container(r)),
        "StartLxdContainer" => call(params, |r| handle.start_lxd_container(r)),
        "DeleteLxdContainer" => call(params, |r| handle.delete_lxd_container(r)),
        "ExportLxdContainer" => call(params, |r| handle.export_lxd_container(r)),
        "ImportLxdContainer" => call(params, |r| handle.import_lxd_container(r)),
        "GetLxdContainerInfo" => call(params, |r| handle.get_lxd_container_info(r)),
        other => Err(Error::BadInput(format!("unknown method: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Collaborators, ControlService};
    use serde_json::json;

    fn harness() -> (ControlHandle, tempfile::TempDir) {
        let runtime = tempfile::TempDir::new().unwrap();
        let (handle, _thread) =
            ControlService::spawn(Collaborators::logging(), runtime.path().to_path_buf());
        (handle, runtime)
    }

    #[test]
    fn route_runs_a_full_vm_flow() {
        let (handle, _runtime) = harness();

        let params = json!({
            "owner_id": "alice",
            "vm_name": "termina",
            "cid": 3,
            "container_subnet": "100.115.92.4",
            "container_netmask": "255.255.255.252",
            "ipv4_addr": "100.115.92.6",
        });
        route(&handle, "NotifyVmStarted", params).unwrap();

        let info = route(
            &handle,
            "GetVmInfo",
            json!({"owner_id": "alice", "vm_name": "termina"}),
        )
        .unwrap();
        assert_eq!(info["cid"], 3);
        assert_eq!(info["status"], "RUNNING");

        let token = route(
            &handle,
            "GetContainerToken",
            json!({"owner_id": "alice", "vm_name": "termina", "container_name": "penguin"}),
        )
        .unwrap();
        assert_eq!(token["token"].as_str().unwrap().len(), 32);
    }

    #[test]
    fn unknown_method_is_bad_input() {
        let (handle, _runtime) = harness();
        match route(&handle, "FlyToTheMoon", Value::Null) {
            Err(Error::BadInput(_)) => {}
            other => panic!("expected BadInput, got {:?}", other),
        }
    }

    #[test]
    fn bad_params_are_bad_input() {
        let (handle, _runtime) = harness();
        match route(&handle, "GetVmInfo", json!({"vm_name": 7})) {
            Err(Error::BadInput(_)) => {}
            other => panic!("expected BadInput, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn socket_round_trip() {
        let (handle, _runtime) = harness();
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("relay.sock");

        let server_sock = sock.clone();
        tokio::spawn(async move {
            let _ = serve(&server_sock, handle).await;
        });

        // Wait for the socket to appear.
        for _ in 0..50 {
            if sock.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let stream = UnixStream::connect(&sock).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"method\":\"GetVmInfo\",\"params\":{\"owner_id\":\"a\",\"vm_name\":\"nope\"}}\n")
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["success"], false);
        assert!(response["failure_reason"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }
}
