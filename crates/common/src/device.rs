use serde::{Deserialize, Serialize};

/// A single entry from the placement ring: one device's participation
/// in a partition's primary (or handoff) list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: u64,
    pub region: u32,
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub replication_ip: String,
    pub replication_port: u16,
    pub device: String,
    /// Fragment index this device holds for the partition under
    /// consideration. `None` until the ring assigns a position.
    #[serde(default)]
    pub index: Option<u16>,
}

impl DeviceRecord {
    /// The `(ip, port)` pair peers should dial for replication traffic.
    pub fn replication_endpoint(&self) -> (&str, u16) {
        (&self.replication_ip, self.replication_port)
    }
}

impl std::fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.replication_ip, self.replication_port, self.device
        )
    }
}
