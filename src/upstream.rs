//! Upstream collaborators of the control service.
//!
//! The real transports (application registry, URL handler, hostname
//! resolver, signal subscribers) live in other daemons; the control service
//! only needs these seams. The daemon binary wires logging implementations;
//! tests substitute recording doubles.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::info;
use vm_relay_protocol::{
    CreateStatus, DeleteStatus, InstallPackageStatus, StartStatus, TransferStatus,
    UpdateApplicationListRequest,
};

use crate::error::Result;

/// Identifies the container an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerId {
    pub owner_id: String,
    pub vm_name: String,
    pub container_name: String,
}

/// Events re-published to upstream subscribers.
///
/// For a single VM these are delivered in dispatch order; across VMs no
/// ordering is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    ContainerStarted(ContainerId),
    ContainerShutdown(ContainerId),
    ContainerStartupFailed(ContainerId),
    CreateProgress {
        id: ContainerId,
        status: CreateStatus,
        failure_reason: String,
        download_progress: u32,
    },
    StartProgress {
        id: ContainerId,
        status: StartStatus,
        failure_reason: String,
    },
    DeleteProgress {
        id: ContainerId,
        status: DeleteStatus,
        failure_reason: String,
    },
    ExportProgress {
        id: ContainerId,
        status: TransferStatus,
        progress_percent: u32,
        failure_reason: String,
    },
    ImportProgress {
        id: ContainerId,
        status: TransferStatus,
        progress_percent: u32,
        failure_reason: String,
    },
    InstallPackageProgress {
        id: ContainerId,
        status: InstallPackageStatus,
        progress_percent: u32,
        failure_details: String,
    },
    PendingAppListUpdates {
        id: ContainerId,
        count: u32,
    },
}

/// Fan-out sink for [`Signal`]s. Failures are recorded by the caller but
/// never fail the originating RPC.
pub trait SignalSink: Send {
    fn signal(&self, signal: Signal);
}

/// The application-registry collaborator; blocks briefly on its reply.
pub trait AppRegistry: Send {
    fn update_application_list(&self, list: &UpdateApplicationListRequest) -> Result<()>;
}

/// The URL-handler collaborator.
pub trait UrlHandler: Send {
    fn open_url(&self, url: &str) -> Result<()>;
}

/// The terminal-launcher collaborator.
pub trait TerminalLauncher: Send {
    fn open_terminal(&self, id: &ContainerId, params: &[String]) -> Result<()>;
}

/// The hostname-resolver collaborator. Mappings are re-published wholesale
/// when the resolver restarts.
pub trait HostnameResolver: Send {
    fn register(&self, hostname: &str, ip: Ipv4Addr) -> Result<()>;
    fn unregister(&self, hostname: &str) -> Result<()>;
}

/// Default wiring for the daemon: log the event and report success.
pub struct LoggingUpstream;

impl SignalSink for LoggingUpstream {
    fn signal(&self, signal: Signal) {
        info!(?signal, "upstream signal");
    }
}

impl AppRegistry for LoggingUpstream {
    fn update_application_list(&self, list: &UpdateApplicationListRequest) -> Result<()> {
        info!(
            vm = %list.vm_name,
            container = %list.container_name,
            apps = list.apps.len(),
            "application list updated"
        );
        Ok(())
    }
}

impl UrlHandler for LoggingUpstream {
    fn open_url(&self, url: &str) -> Result<()> {
        info!(%url, "open url");
        Ok(())
    }
}

impl TerminalLauncher for LoggingUpstream {
    fn open_terminal(&self, id: &ContainerId, params: &[String]) -> Result<()> {
        info!(container = %id.container_name, vm = %id.vm_name, ?params, "open terminal");
        Ok(())
    }
}

impl HostnameResolver for LoggingUpstream {
    fn register(&self, hostname: &str, ip: Ipv4Addr) -> Result<()> {
        info!(%hostname, %ip, "hostname registered");
        Ok(())
    }

    fn unregister(&self, hostname: &str) -> Result<()> {
        info!(%hostname, "hostname unregistered");
        Ok(())
    }
}
