//! The registry of running VMs.
//!
//! Owned exclusively by the control thread; everything else reaches it
//! through posted tasks. A record is keyed by `(owner_id, vm_name)` and the
//! vsock context id stays unique across live VMs.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::token::TokenTable;
use crate::tremplin::TremplinStub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Starting,
    Running,
    Stopped,
}

/// One live VM and everything the control service knows about it.
pub struct VmRecord {
    pub owner_id: String,
    pub name: String,
    pub cid: u32,
    pub container_subnet: Ipv4Addr,
    pub container_netmask: Ipv4Addr,
    pub ipv4_addr: Ipv4Addr,
    pub seneschal_handle: u64,
    pub status: VmStatus,
    pub tokens: TokenTable,
    tremplin: Option<TremplinStub>,
}

impl VmRecord {
    /// True when `ip` falls inside this VM's container subnet.
    pub fn owns_container_ip(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.container_netmask);
        (u32::from(ip) & mask) == (u32::from(self.container_subnet) & mask)
    }

    /// Attaches the stub for the in-VM lifecycle agent.
    pub fn connect_tremplin(&mut self, stub: TremplinStub) {
        self.tremplin = Some(stub);
    }

    /// The lifecycle-agent stub, or `Unavailable` before TremplinReady.
    pub fn tremplin(&self) -> Result<&TremplinStub> {
        self.tremplin
            .as_ref()
            .ok_or_else(|| Error::Unavailable("tremplin is not connected".to_string()))
    }

    pub fn tremplin_connected(&self) -> bool {
        self.tremplin.is_some()
    }
}

/// Map of `(owner_id, vm_name)` → [`VmRecord`].
#[derive(Default)]
pub struct VmRegistry {
    vms: BTreeMap<(String, String), VmRecord>,
}

impl VmRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        owner_id: &str,
        name: &str,
        cid: u32,
        container_subnet: Ipv4Addr,
        container_netmask: Ipv4Addr,
        ipv4_addr: Ipv4Addr,
        status: VmStatus,
    ) -> Result<&mut VmRecord> {
        let key = (owner_id.to_string(), name.to_string());
        if self.vms.contains_key(&key) {
            return Err(Error::Duplicate(name.to_string()));
        }
        let record = VmRecord {
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            cid,
            container_subnet,
            container_netmask,
            ipv4_addr,
            seneschal_handle: 0,
            status,
            tokens: TokenTable::default(),
            tremplin: None,
        };
        Ok(self.vms.entry(key).or_insert(record))
    }

    /// Removes and returns the record. Synthesized container-shutdown
    /// signals are the caller's responsibility, emitted before the returned
    /// record is dropped.
    pub fn remove(&mut self, owner_id: &str, name: &str) -> Option<VmRecord> {
        self.vms
            .remove(&(owner_id.to_string(), name.to_string()))
    }

    /// Map lookup, with a compatibility fallback to an empty owner id.
    pub fn find(&mut self, owner_id: &str, name: &str) -> Option<&mut VmRecord> {
        let key = (owner_id.to_string(), name.to_string());
        if self.vms.contains_key(&key) {
            return self.vms.get_mut(&key);
        }
        self.vms.get_mut(&(String::new(), name.to_string()))
    }

    /// Linear scan by context id; cids are unique across live VMs.
    pub fn find_by_cid(&mut self, cid: u32) -> Option<&mut VmRecord> {
        self.vms.values_mut().find(|vm| vm.cid == cid)
    }

    /// Scan for the VM whose container subnet covers `ip`.
    pub fn find_by_container_ip(&mut self, ip: Ipv4Addr) -> Option<&mut VmRecord> {
        self.vms.values_mut().find(|vm| vm.owns_container_ip(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }
}
