//! Per-VM container tokens.
//!
//! Tokens are opaque 128-bit strings generated host-side when a container is
//! about to start. The in-container agent presents the token back over the
//! listener plane; until then the record sits in the pending map.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Where the in-container agent can be reached once the container is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarconEndpoint {
    /// `vsock:<cid>:<port>`.
    Vsock { cid: u32, port: u32 },
    /// Legacy containers reachable over the container subnet.
    Tcp { addr: Ipv4Addr, port: u16 },
}

impl fmt::Display for GarconEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GarconEndpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
            GarconEndpoint::Tcp { addr, port } => write!(f, "{}:{}", addr, port),
        }
    }
}

/// One container known to a VM.
///
/// `garcon_endpoint` is populated exactly when the container has confirmed
/// startup through the listener plane.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub name: String,
    pub token: String,
    pub ipv4_addr: Option<Ipv4Addr>,
    pub garcon_endpoint: Option<GarconEndpoint>,
    pub drivefs_mount_path: String,
    pub homedir: String,
}

impl ContainerRecord {
    fn new(name: String, token: String) -> Self {
        Self {
            name,
            token,
            ipv4_addr: None,
            garcon_endpoint: None,
            drivefs_mount_path: String::new(),
            homedir: String::new(),
        }
    }
}

/// Token → container maps for a single VM. Confirmed and pending containers
/// are tracked separately; a token is in at most one of the two.
#[derive(Debug, Default)]
pub struct TokenTable {
    containers: BTreeMap<String, ContainerRecord>,
    pending_containers: BTreeMap<String, ContainerRecord>,
}

impl TokenTable {
    /// Creates a pending record for `container_name` and returns its fresh
    /// token.
    pub fn generate_token(&mut self, container_name: &str) -> String {
        let token = generate_token_string();
        self.pending_containers.insert(
            token.clone(),
            ContainerRecord::new(container_name.to_string(), token.clone()),
        );
        token
    }

    /// Promotes a pending container to confirmed, recording how to reach its
    /// agent. A token that is already confirmed just refreshes the endpoint
    /// (the agent restarted inside a running container).
    pub fn register(
        &mut self,
        token: &str,
        endpoint: GarconEndpoint,
        ipv4_addr: Option<Ipv4Addr>,
    ) -> Result<&mut ContainerRecord> {
        if let Some(record) = self.pending_containers.remove(token) {
            self.containers.insert(token.to_string(), record);
        } else if !self.containers.contains_key(token) {
            return Err(Error::UnknownToken);
        }

        let record = self
            .containers
            .get_mut(token)
            .ok_or(Error::UnknownToken)?;
        record.garcon_endpoint = Some(endpoint);
        if ipv4_addr.is_some() {
            record.ipv4_addr = ipv4_addr;
        }
        Ok(record)
    }

    /// Removes a confirmed container.
    pub fn unregister(&mut self, token: &str) -> Result<ContainerRecord> {
        self.containers.remove(token).ok_or(Error::UnknownToken)
    }

    pub fn get(&self, token: &str) -> Option<&ContainerRecord> {
        self.containers.get(token)
    }

    pub fn get_pending(&self, token: &str) -> Option<&ContainerRecord> {
        self.pending_containers.get(token)
    }

    pub fn name_for_token(&self, token: &str) -> Option<&str> {
        self.containers.get(token).map(|c| c.name.as_str())
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ContainerRecord> {
        self.containers.values().find(|c| c.name == name)
    }

    /// Names of all confirmed containers, in token order.
    pub fn names(&self) -> Vec<String> {
        self.containers.values().map(|c| c.name.clone()).collect()
    }

    /// Confirmed container tokens, in map order.
    pub fn tokens(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.pending_containers.is_empty()
    }
}

/// An unpredictable 128-bit token rendered as 32 hex characters.
fn generate_token_string() -> String {
    let mut bytes = [0u8; 16];
    // getrandom only fails when the OS entropy source is unusable, which is
    // not a recoverable situation for a security token.
    getrandom::fill(&mut bytes).expect("system entropy source failed");
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
