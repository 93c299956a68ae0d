//! Per-pass partition discovery (C6, §4.6). Walks each local device's
//! data directory once per pass and classifies each partition as
//! primary-held or handoff-held before the planner reasons about jobs.

use common::DeviceRecord;

use crate::fragment_store::{FragmentStore, FragmentStoreError};
use crate::ring::RingView;

/// One partition found on a local device, already cross-referenced
/// against the ring to say whether this device is a primary or a
/// handoff for it.
#[derive(Debug, Clone)]
pub struct PartInfo {
    pub policy_index: u32,
    pub partition: u64,
    pub local_device: DeviceRecord,
    /// This device's ring position among the partition's primaries, if
    /// it is one.
    pub frag_index: Option<u16>,
    pub is_primary: bool,
}

pub struct PartitionScanner<'a> {
    store: &'a dyn FragmentStore,
}

impl<'a> PartitionScanner<'a> {
    pub fn new(store: &'a dyn FragmentStore) -> Self {
        Self { store }
    }

    /// Lists every partition held on `device` for `policy_index`,
    /// classified against `ring`. `override_partitions`, when non-empty,
    /// restricts the scan to just those partitions (B2).
    pub async fn scan(
        &self,
        device: &DeviceRecord,
        policy_index: u32,
        ring: &dyn RingView,
        override_partitions: &[u64],
    ) -> Result<Vec<PartInfo>, FragmentStoreError> {
        let mut partitions = self.store.list_partitions(&device.device, policy_index).await?;
        if !override_partitions.is_empty() {
            let wanted: std::collections::HashSet<u64> = override_partitions.iter().copied().collect();
            partitions.retain(|p| wanted.contains(p));
        }

        let mut out = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let primaries = ring.primaries(partition);
            let as_primary = primaries.iter().find(|d| d.device == device.device && ring.is_local(d));
            let (frag_index, is_primary) = match as_primary {
                Some(primary) => (primary.index, true),
                None => (None, false),
            };
            out.push(PartInfo { policy_index, partition, local_device: device.clone(), frag_index, is_primary });
        }
        Ok(out)
    }

    /// Partitions among `parts` whose directory now holds no suffix
    /// data (I5), recorded at the end of a pass so `ReconstructorLoop`
    /// can remove them at the start of the next one rather than this
    /// same pass, in case a job still mid-flight is about to write to
    /// one.
    pub async fn find_empty(&self, parts: &[PartInfo]) -> Vec<(u32, String, u64)> {
        let mut empties = Vec::new();
        for p in parts {
            if self.store.partition_is_empty(&p.local_device.device, p.policy_index, p.partition).await.unwrap_or(false) {
                empties.push((p.policy_index, p.local_device.device.clone(), p.partition));
            }
        }
        empties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment_store::LocalFragmentStore;
    use async_trait::async_trait;

    fn device(id: u64, name: &str) -> DeviceRecord {
        DeviceRecord {
            id,
            region: 1,
            zone: 1,
            ip: "10.0.0.1".into(),
            port: 6200,
            replication_ip: "10.0.0.1".into(),
            replication_port: 6200,
            device: name.to_string(),
            index: None,
        }
    }

    struct FakeRing {
        primary: DeviceRecord,
    }

    #[async_trait]
    impl RingView for FakeRing {
        fn primaries(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![self.primary.clone()]
        }
        fn more_nodes(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![]
        }
        fn is_local(&self, _device: &DeviceRecord) -> bool {
            true
        }
        async fn check_ring(&self) -> Result<(), crate::ring::RingError> {
            Ok(())
        }
        fn partition_count(&self) -> usize {
            1024
        }
        fn devices(&self) -> Vec<DeviceRecord> {
            vec![self.primary.clone()]
        }
    }

    #[tokio::test]
    async fn scan_classifies_primary_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        store.ensure_data_dir("sda", 0).await.unwrap();
        std::fs::create_dir_all(store.partition_path("sda", 0, 42)).unwrap();

        let mut primary = device(0, "sda");
        primary.index = Some(2);
        let ring = FakeRing { primary: primary.clone() };
        let scanner = PartitionScanner::new(&store);
        let infos = scanner.scan(&primary, 0, &ring, &[]).await.unwrap();

        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_primary);
        assert_eq!(infos[0].frag_index, Some(2));
    }

    #[tokio::test]
    async fn override_partitions_restricts_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        store.ensure_data_dir("sda", 0).await.unwrap();
        std::fs::create_dir_all(store.partition_path("sda", 0, 1)).unwrap();
        std::fs::create_dir_all(store.partition_path("sda", 0, 2)).unwrap();

        let primary = device(0, "sda");
        let ring = FakeRing { primary: primary.clone() };
        let scanner = PartitionScanner::new(&store);
        let infos = scanner.scan(&primary, 0, &ring, &[2]).await.unwrap();

        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].partition, 2);
    }

    #[tokio::test]
    async fn find_empty_reports_partitions_with_no_suffix_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        store.ensure_data_dir("sda", 0).await.unwrap();
        std::fs::create_dir_all(store.partition_path("sda", 0, 1)).unwrap();
        std::fs::create_dir_all(store.partition_path("sda", 0, 2).join("suf").join("aaaa")).unwrap();
        std::fs::write(
            store.partition_path("sda", 0, 2).join("suf").join("aaaa").join("1000000000.00000#0#d.data"),
            b"x",
        )
        .unwrap();

        let local = device(0, "sda");
        let scanner = PartitionScanner::new(&store);
        let parts = vec![
            PartInfo { policy_index: 0, partition: 1, local_device: local.clone(), frag_index: None, is_primary: true },
            PartInfo { policy_index: 0, partition: 2, local_device: local, frag_index: None, is_primary: true },
        ];

        let empties = scanner.find_empty(&parts).await;
        assert_eq!(empties, vec![(0, "sda".to_string(), 1)]);
    }
}
