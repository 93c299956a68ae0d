//! Read-only view of the placement ring (C1, §4.1).
//!
//! The on-disk ring format mirrors Swift's actual ring layout: a flat
//! device table plus `replica2part2dev[replica][partition] = device_id`,
//! rather than inventing a partition->device-list structure from
//! scratch. `FileRingView` loads this once, then serves `primaries`/
//! `more_nodes`/`is_local` from an in-memory snapshot behind a lock that
//! `check_ring` swaps atomically on reload.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use common::DeviceRecord;
use serde::Deserialize;
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("ring file {path} is stale: last good load is {age_secs}s old (freshness window {window_secs}s)")]
    Stale { path: PathBuf, age_secs: u64, window_secs: u64 },
    #[error("failed to read ring file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse ring file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Deserialize)]
struct RingFile {
    devices: Vec<DeviceRecord>,
    /// `replica2part2dev[replica][partition]` is an index into `devices`.
    replica2part2dev: Vec<Vec<usize>>,
}

struct RingData {
    devices: Vec<DeviceRecord>,
    replica2part2dev: Vec<Vec<usize>>,
    mtime: SystemTime,
}

impl RingData {
    fn replicas(&self) -> usize {
        self.replica2part2dev.len()
    }

    fn partition_count(&self) -> usize {
        self.replica2part2dev.first().map(|r| r.len()).unwrap_or(0)
    }

    fn primaries(&self, partition: u64) -> Vec<DeviceRecord> {
        let partition = partition as usize;
        let mut out = Vec::with_capacity(self.replicas());
        for (replica, part2dev) in self.replica2part2dev.iter().enumerate() {
            if let Some(&dev_id) = part2dev.get(partition) {
                if let Some(dev) = self.devices.get(dev_id) {
                    let mut dev = dev.clone();
                    dev.index = Some(replica as u16);
                    out.push(dev);
                }
            }
        }
        out
    }
}

/// A read-only, hot-reloadable view of one policy's placement ring.
#[async_trait]
pub trait RingView: Send + Sync {
    /// Ordered primary device list for `partition`, length = policy
    /// replicas, each with `index` set to its ring position.
    fn primaries(&self, partition: u64) -> Vec<DeviceRecord>;

    /// Deterministic handoff candidates for `partition`, in stable
    /// order, excluding every primary.
    fn more_nodes(&self, partition: u64) -> Vec<DeviceRecord>;

    /// True iff `device`'s replication endpoint resolves to this host.
    fn is_local(&self, device: &DeviceRecord) -> bool;

    /// Reload the ring file if it changed on disk; returns
    /// `RingError::Stale` if a reload attempt failed and the currently
    /// cached ring has exceeded the configured freshness window.
    async fn check_ring(&self) -> Result<(), RingError>;

    fn partition_count(&self) -> usize;

    /// Every device the ring knows about, local or not. Used to find
    /// which on-disk device directories this host is responsible for.
    fn devices(&self) -> Vec<DeviceRecord>;
}

pub struct FileRingView {
    path: PathBuf,
    freshness: Duration,
    bind_ip: String,
    bind_port: u16,
    servers_per_port: u16,
    data: RwLock<Arc<RingData>>,
}

impl FileRingView {
    /// Loads the ring file once at construction; subsequent staleness
    /// is handled by `check_ring`.
    pub async fn open(
        path: PathBuf,
        freshness: Duration,
        bind_ip: String,
        bind_port: u16,
        servers_per_port: u16,
    ) -> Result<Self, RingError> {
        let data = load_ring(&path).await?;
        Ok(Self {
            path,
            freshness,
            bind_ip,
            bind_port,
            servers_per_port,
            data: RwLock::new(Arc::new(data)),
        })
    }
}

async fn load_ring(path: &PathBuf) -> Result<RingData, RingError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|source| RingError::Read { path: path.clone(), source })?;
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| RingError::Read { path: path.clone(), source })?;
    let file: RingFile =
        serde_json::from_slice(&raw).map_err(|source| RingError::Parse { path: path.clone(), source })?;
    Ok(RingData { devices: file.devices, replica2part2dev: file.replica2part2dev, mtime })
}

#[async_trait]
impl RingView for FileRingView {
    fn primaries(&self, partition: u64) -> Vec<DeviceRecord> {
        self.data.read().unwrap().primaries(partition)
    }

    fn more_nodes(&self, partition: u64) -> Vec<DeviceRecord> {
        let data = self.data.read().unwrap();
        let primary_ids: HashSet<usize> = data
            .replica2part2dev
            .iter()
            .filter_map(|part2dev| part2dev.get(partition as usize).copied())
            .collect();

        let mut candidates: Vec<(usize, &DeviceRecord)> = data
            .devices
            .iter()
            .enumerate()
            .filter(|(id, _)| !primary_ids.contains(id))
            .collect();

        // Deterministic, partition-dependent order: spreads handoff
        // load across devices instead of always preferring device 0.
        candidates.sort_by_key(|(id, _)| handoff_rank(*id, partition));
        candidates.into_iter().map(|(_, dev)| dev.clone()).collect()
    }

    fn is_local(&self, device: &DeviceRecord) -> bool {
        if device.replication_ip != self.bind_ip && self.bind_ip != "0.0.0.0" {
            return false;
        }
        if self.servers_per_port != 0 {
            return device.replication_ip == self.bind_ip;
        }
        device.replication_port == self.bind_port
    }

    async fn check_ring(&self) -> Result<(), RingError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(_) => return self.stale_or_ok().await,
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let current_mtime = self.data.read().unwrap().mtime;
        if mtime <= current_mtime {
            return Ok(());
        }
        match load_ring(&self.path).await {
            Ok(fresh) => {
                *self.data.write().unwrap() = Arc::new(fresh);
                Ok(())
            }
            Err(_) => self.stale_or_ok().await,
        }
    }

    fn partition_count(&self) -> usize {
        self.data.read().unwrap().partition_count()
    }

    fn devices(&self) -> Vec<DeviceRecord> {
        self.data.read().unwrap().devices.clone()
    }
}

impl FileRingView {
    async fn stale_or_ok(&self) -> Result<(), RingError> {
        let mtime = self.data.read().unwrap().mtime;
        let age = SystemTime::now().duration_since(mtime).unwrap_or_default();
        if age > self.freshness {
            Err(RingError::Stale {
                path: self.path.clone(),
                age_secs: age.as_secs(),
                window_secs: self.freshness.as_secs(),
            })
        } else {
            Ok(())
        }
    }
}

/// Cheap, deterministic spread function for handoff ordering; not
/// cryptographic, just needs to vary with `partition`.
fn handoff_rank(device_id: usize, partition: u64) -> u64 {
    let mut x = (device_id as u64).wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(partition);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}
