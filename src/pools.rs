//! Flock-guarded allocation pools for VM resources.
//!
//! Every pool is a text file under the VM runtime directory, one record per
//! line in the resource's canonical printable form. An exclusive advisory
//! lock on the pool file guards allocation and release across processes;
//! the allocated record is additionally persisted into the owning VM's
//! instance directory so it can be released after a crash.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

/// The `100.115.92.0/24` range is reserved and never publicly routed.
const SUBNET_BASE: [u8; 3] = [100, 115, 92];

/// The /24 is carved into 64 `/30` subnets.
const SUBNET_COUNT: u8 = 64;

/// Subnet 0 belongs to the platform container.
const RESERVED_SUBNET: u8 = 0;

/// Context ids 0-2 are reserved by the vsock fabric; guests start at 3.
const FIRST_GUEST_CID: u32 = 3;

/// Runs `edit` on the line set of a locked pool file, then writes the set
/// back. The lock is dropped when the function returns.
fn edit_pool<T>(
    pool_path: &Path,
    edit: impl FnOnce(&mut BTreeSet<String>) -> Result<T>,
) -> Result<T> {
    if let Some(parent) = pool_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(pool_path)?;
    let file = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))?;

    let mut contents = String::new();
    let mut handle: &std::fs::File = &file;
    handle.read_to_string(&mut contents)?;
    let mut records: BTreeSet<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let result = edit(&mut records)?;

    let mut serialized = String::new();
    for record in &records {
        serialized.push_str(record);
        serialized.push('\n');
    }
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(serialized.as_bytes())?;
    file.set_len(serialized.len() as u64)?;

    Ok(result)
}

/// Persists the instance's record so a later release can find it.
fn write_instance_record(instance_dir: &Path, name: &str, record: &str) -> Result<()> {
    std::fs::create_dir_all(instance_dir)?;
    std::fs::write(instance_dir.join(name), format!("{}\n", record))?;
    Ok(())
}

fn read_instance_record(instance_dir: &Path, name: &str) -> Result<String> {
    let contents = std::fs::read_to_string(instance_dir.join(name))?;
    Ok(contents.trim().to_string())
}

// ---------------------------------------------------------------------------
// Subnets
// ---------------------------------------------------------------------------

/// One allocated `/30` out of the reserved /24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    index: u8,
}

impl Subnet {
    fn octet(&self, offset: u8) -> Ipv4Addr {
        Ipv4Addr::new(
            SUBNET_BASE[0],
            SUBNET_BASE[1],
            SUBNET_BASE[2],
            self.index * 4 + offset,
        )
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn network(&self) -> Ipv4Addr {
        self.octet(0)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.octet(1)
    }

    pub fn guest_address(&self) -> Ipv4Addr {
        self.octet(2)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.octet(3)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 252)
    }
}

pub struct SubnetPool {
    pool_path: PathBuf,
}

impl SubnetPool {
    const NAME: &'static str = "subnet";

    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            pool_path: runtime_dir.join(Self::NAME),
        }
    }

    pub fn allocate(&self, instance_dir: &Path) -> Result<Subnet> {
        let subnet = edit_pool(&self.pool_path, |records| {
            for index in 0..SUBNET_COUNT {
                if index == RESERVED_SUBNET {
                    continue;
                }
                let record = index.to_string();
                if records.insert(record) {
                    return Ok(Subnet { index });
                }
            }
            Err(Error::PoolExhausted("subnet".to_string()))
        })?;
        write_instance_record(instance_dir, Self::NAME, &subnet.index.to_string())?;
        Ok(subnet)
    }

    pub fn release(&self, instance_dir: &Path) -> Result<()> {
        let record = read_instance_record(instance_dir, Self::NAME)?;
        edit_pool(&self.pool_path, |records| {
            records.remove(&record);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Context ids
// ---------------------------------------------------------------------------

pub struct CidPool {
    pool_path: PathBuf,
}

impl CidPool {
    const NAME: &'static str = "cid";

    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            pool_path: runtime_dir.join(Self::NAME),
        }
    }

    pub fn allocate(&self, instance_dir: &Path) -> Result<u32> {
        let cid = edit_pool(&self.pool_path, |records| {
            let taken: BTreeSet<u32> = records.iter().filter_map(|r| r.parse().ok()).collect();
            let mut cid = FIRST_GUEST_CID;
            while taken.contains(&cid) {
                cid += 1;
            }
            records.insert(cid.to_string());
            Ok(cid)
        })?;
        write_instance_record(instance_dir, Self::NAME, &cid.to_string())?;
        Ok(cid)
    }

    pub fn release(&self, instance_dir: &Path) -> Result<()> {
        let record = read_instance_record(instance_dir, Self::NAME)?;
        edit_pool(&self.pool_path, |records| {
            records.remove(&record);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// MAC addresses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// A random locally-administered unicast address: bit 1 of the first
    /// octet set, bit 0 clear.
    fn random() -> Self {
        let mut octets = [0u8; 6];
        getrandom::fill(&mut octets).expect("system entropy source failed");
        octets[0] = (octets[0] | 0x02) & !0x01;
        Self(octets)
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0 && self.0[0] & 0x01 == 0
    }

    fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

pub struct MacPool {
    pool_path: PathBuf,
}

impl MacPool {
    const NAME: &'static str = "mac";

    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            pool_path: runtime_dir.join(Self::NAME),
        }
    }

    pub fn allocate(&self, instance_dir: &Path) -> Result<MacAddress> {
        let mac = edit_pool(&self.pool_path, |records| {
            loop {
                let candidate = MacAddress::random();
                if candidate.is_broadcast() {
                    continue;
                }
                let record = candidate.to_string();
                if records.insert(record) {
                    return Ok(candidate);
                }
            }
        })?;
        write_instance_record(instance_dir, Self::NAME, &mac.to_string())?;
        Ok(mac)
    }

    pub fn release(&self, instance_dir: &Path) -> Result<()> {
        let record = read_instance_record(instance_dir, Self::NAME)?;
        edit_pool(&self.pool_path, |records| {
            records.remove(&record);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// NFS exports
// ---------------------------------------------------------------------------

/// Tracks which host paths are currently exported to guests.
pub struct NfsExportPool {
    pool_path: PathBuf,
}

impl NfsExportPool {
    const NAME: &'static str = "nfs_export";

    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            pool_path: runtime_dir.join(Self::NAME),
        }
    }

    pub fn export(&self, instance_dir: &Path, path: &Path) -> Result<()> {
        let record = path.to_string_lossy().to_string();
        edit_pool(&self.pool_path, |records| {
            records.insert(record.clone());
            Ok(())
        })?;
        write_instance_record(instance_dir, Self::NAME, &record)
    }

    pub fn release(&self, instance_dir: &Path) -> Result<()> {
        let record = read_instance_record(instance_dir, Self::NAME)?;
        edit_pool(&self.pool_path, |records| {
            records.remove(&record);
            Ok(())
        })
    }

    pub fn exports(&self) -> Result<Vec<String>> {
        edit_pool(&self.pool_path, |records| {
            Ok(records.iter().cloned().collect())
        })
    }
}
