//! Top-level pass orchestration (C10, §4.10, §6). Grounded on the
//! teacher's `agent/src/supervisor.rs` reconcile loop: resolve desired
//! state, diff against the world, act, sleep, repeat — generalized from
//! "which components should be running" to "which suffixes are out of
//! sync".

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{DeviceRecord, ReconstructorConfig};

use crate::ec_codec::EcCodec;
use crate::executor::JobExecutor;
use crate::fragment_store::FragmentStore;
use crate::job::JobKind;
use crate::peer_control::PeerControl;
use crate::peer_sync::PeerSync;
use crate::planner::{JobPlanner, PlannerError};
use crate::rebuilder::Rebuilder;
use crate::ring::{RingError, RingView};
use crate::scanner::PartitionScanner;
use crate::stats::{PassStats, PassStatsSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ReconstructorLoopError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Store(#[from] crate::fragment_store::FragmentStoreError),
}

#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub stats: PassStatsSnapshot,
}

/// Runtime overrides for a single invocation (B2): when non-empty,
/// restrict the pass to exactly these devices/partitions instead of
/// everything this node owns.
#[derive(Debug, Clone, Default)]
pub struct PassOverrides {
    pub devices: Vec<String>,
    pub partitions: Vec<u64>,
}

pub struct ReconstructorLoop {
    config: ReconstructorConfig,
    ring: Arc<dyn RingView>,
    store: Arc<dyn FragmentStore>,
    peer_control: Arc<dyn PeerControl>,
    peer_sync: Arc<dyn PeerSync>,
    codecs: BTreeMap<u32, Box<dyn EcCodec>>,
    /// Partitions `find_empty` flagged at the end of the previous pass
    /// (I5); removed at the start of the next one, never the same pass
    /// that emptied them.
    pending_empty: Mutex<Vec<(u32, String, u64)>>,
}

impl ReconstructorLoop {
    pub fn new(
        config: ReconstructorConfig,
        ring: Arc<dyn RingView>,
        store: Arc<dyn FragmentStore>,
        peer_control: Arc<dyn PeerControl>,
        peer_sync: Arc<dyn PeerSync>,
        codecs: BTreeMap<u32, Box<dyn EcCodec>>,
    ) -> Self {
        Self { config, ring, store, peer_control, peer_sync, codecs, pending_empty: Mutex::new(Vec::new()) }
    }

    /// Runs one complete pass over every configured policy: scan, plan,
    /// execute, then reclaim stale tmp files. Handoffs-only mode (B4)
    /// skips every partition this node holds as a primary.
    pub async fn run_once(
        &self,
        overrides: &PassOverrides,
        handoffs_only: bool,
        dry_run: bool,
    ) -> Result<PassOutcome, ReconstructorLoopError> {
        self.ring.check_ring().await?;
        let stats = PassStats::new();

        // I5: remove partitions last pass found empty, before planning
        // touches them this pass.
        let to_remove: Vec<(u32, String, u64)> = self.pending_empty.lock().unwrap().drain(..).collect();
        for (policy_index, device, partition) in to_remove {
            if let Err(err) = self.store.remove_partition_dir(&device, policy_index, partition).await {
                tracing::warn!(partition, device = %device, error = %err, "failed to remove empty partition directory");
            }
        }

        let local_devices = self.local_devices(overrides);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.concurrency_per_partition.max(1)));
        let rebuilders: BTreeMap<u32, Rebuilder> =
            self.codecs.iter().map(|(idx, codec)| (*idx, Rebuilder::new(codec.as_ref()))).collect();
        let mut newly_empty = Vec::new();

        for policy in &self.config.policies {
            for device in &local_devices {
                let scanner = PartitionScanner::new(self.store.as_ref());
                let parts = scanner.scan(device, policy.policy_index, self.ring.as_ref(), &overrides.partitions).await?;

                for part_info in &parts {
                    PassStats::incr(&stats.reconstruction_part_count, 1);

                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                    let planner = JobPlanner::new(self.store.as_ref());
                    let mut jobs = match planner.plan(part_info, self.ring.as_ref(), policy).await {
                        Ok(jobs) => jobs,
                        Err(err) => {
                            tracing::warn!(partition = part_info.partition, error = %err, "job planning failed, skipping partition this pass");
                            drop(permit);
                            continue;
                        }
                    };

                    // handoffs_only is a per-job filter (§4.8 step 4): it
                    // skips SYNC jobs, not whole partitions, since a
                    // primary partition can still carry a stray fragment
                    // that needs reverting.
                    if handoffs_only {
                        jobs.retain(|j| j.kind != JobKind::Sync);
                    }

                    let executor = JobExecutor::new(
                        self.store.as_ref(),
                        self.peer_control.as_ref(),
                        self.peer_sync.as_ref(),
                        self.ring.as_ref(),
                        &stats,
                        self.config.max_backup_handoffs,
                        &rebuilders,
                    );
                    for job in &jobs {
                        PassStats::incr(&stats.suffix_count, job.suffixes.len() as u64);
                        let outcome = executor.execute(job, dry_run).await;
                        if outcome.objects_sent > 0 {
                            PassStats::incr(&stats.suffix_sync, job.suffixes.len() as u64);
                        }
                        tracing::debug!(
                            partition = job.partition,
                            kind = ?job.kind,
                            state = ?outcome.state,
                            sent = outcome.objects_sent,
                            deleted = outcome.objects_deleted,
                            "job finished"
                        );
                    }
                    drop(permit);
                }

                if !dry_run {
                    if let Err(err) = self.store.cleanup_tmp(&device.device, self.config.reclaim_age).await {
                        tracing::warn!(device = %device.device, error = %err, "tmp cleanup failed");
                    }
                    newly_empty.extend(scanner.find_empty(&parts).await);
                }
            }
        }

        *self.pending_empty.lock().unwrap() = newly_empty;

        let snapshot = stats.snapshot();
        if handoffs_only && snapshot.handoffs_remaining == 0 {
            tracing::info!("no handoffs remain outstanding; recommend leaving handoffs-only mode");
        }

        Ok(PassOutcome { stats: snapshot })
    }

    /// Runs passes forever, sleeping `run_pause_secs` between them.
    pub async fn run_forever(&self, overrides: &PassOverrides, handoffs_only: bool, dry_run: bool) -> ! {
        loop {
            match self.run_once(overrides, handoffs_only, dry_run).await {
                Ok(outcome) => tracing::info!(stats = ?outcome.stats, "pass complete"),
                Err(err) => tracing::error!(error = %err, "pass aborted"),
            }
            tokio::time::sleep(Duration::from_secs(self.config.run_pause_secs)).await;
        }
    }

    fn local_devices(&self, overrides: &PassOverrides) -> Vec<DeviceRecord> {
        let wanted: HashSet<&str> = overrides.devices.iter().map(|s| s.as_str()).collect();
        self.ring
            .devices()
            .into_iter()
            .filter(|d| self.ring.is_local(d))
            .filter(|d| wanted.is_empty() || wanted.contains(d.device.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment_store::LocalFragmentStore;
    use crate::job::AvailableMap;
    use crate::peer_control::PeerError;
    use crate::peer_sync::PeerSyncError;
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
            index: Some(0),
        }
    }

    struct SingleDeviceRing {
        local: DeviceRecord,
    }

    #[async_trait]
    impl RingView for SingleDeviceRing {
        fn primaries(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![self.local.clone()]
        }
        fn more_nodes(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![]
        }
        fn is_local(&self, _device: &DeviceRecord) -> bool {
            true
        }
        async fn check_ring(&self) -> Result<(), RingError> {
            Ok(())
        }
        fn partition_count(&self) -> usize {
            1024
        }
        fn devices(&self) -> Vec<DeviceRecord> {
            vec![self.local.clone()]
        }
    }

    struct EmptyPeerControl;
    #[async_trait]
    impl PeerControl for EmptyPeerControl {
        async fn fetch_suffix_hashes(
            &self,
            peer: &DeviceRecord,
            _policy_index: u32,
            _partition: u64,
            _suffixes: &[String],
            _recalc: &HashSet<String>,
        ) -> Result<crate::fragment_store::SuffixManifest, PeerError> {
            let _ = peer;
            Ok(Default::default())
        }
    }

    struct NoopPeerSync;
    #[async_trait]
    impl PeerSync for NoopPeerSync {
        async fn send(
            &self,
            _job: &crate::job::Job,
            _peer: &DeviceRecord,
            _suffixes: &[String],
            _store: &dyn FragmentStore,
        ) -> Result<(bool, AvailableMap), PeerSyncError> {
            Ok((false, AvailableMap::new()))
        }
    }

    #[tokio::test]
    async fn run_once_completes_with_no_local_data() {
        let dir = tempfile::tempdir().unwrap();
        let local = device(0, "sda");
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        store.ensure_data_dir("sda", 0).await.unwrap();

        let config_toml = format!(
            "devices = {:?}\nring_path = \"/dev/null\"\n\n[[policies]]\npolicy_index = 0\nname = \"ec\"\nreplicas = 1\nn_data = 1\nn_parity = 0\n",
            dir.path().to_string_lossy()
        );
        let config: ReconstructorConfig = toml::from_str(&config_toml).unwrap();

        let reconstructor = ReconstructorLoop::new(
            config,
            Arc::new(SingleDeviceRing { local }),
            Arc::new(store),
            Arc::new(EmptyPeerControl),
            Arc::new(NoopPeerSync),
            BTreeMap::new(),
        );

        let outcome = reconstructor.run_once(&PassOverrides::default(), false, false).await.unwrap();
        assert_eq!(outcome.stats.reconstruction_part_count, 0);
    }

    struct MultiPrimaryRing {
        primaries: Vec<DeviceRecord>,
        local: DeviceRecord,
    }

    #[async_trait]
    impl RingView for MultiPrimaryRing {
        fn primaries(&self, _partition: u64) -> Vec<DeviceRecord> {
            self.primaries.clone()
        }
        fn more_nodes(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![]
        }
        fn is_local(&self, device: &DeviceRecord) -> bool {
            device.device == self.local.device
        }
        async fn check_ring(&self) -> Result<(), RingError> {
            Ok(())
        }
        fn partition_count(&self) -> usize {
            1024
        }
        fn devices(&self) -> Vec<DeviceRecord> {
            vec![self.local.clone()]
        }
    }

    struct AckingPeerSync;
    #[async_trait]
    impl PeerSync for AckingPeerSync {
        async fn send(
            &self,
            _job: &crate::job::Job,
            _peer: &DeviceRecord,
            suffixes: &[String],
            store: &dyn FragmentStore,
        ) -> Result<(bool, AvailableMap), PeerSyncError> {
            let _ = suffixes;
            let _ = store;
            let mut map = AvailableMap::new();
            map.insert("h2".to_string(), common::wire::ObjectTimestamps::tombstone("1000000000.00000"));
            Ok((true, map))
        }
    }

    #[tokio::test]
    async fn handoffs_only_filters_sync_jobs_not_whole_primary_partitions() {
        // A primary partition holding both its own fragment and a
        // stray one must still run its REVERT job under handoffs_only,
        // even though the SYNC job on the same partition is skipped.
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        let part_path = store.partition_path("sda", 0, 0);
        std::fs::create_dir_all(part_path.join("aaa").join("h1")).unwrap();
        std::fs::write(part_path.join("aaa").join("h1").join("1000000000.00000#1#d.data"), b"x").unwrap();
        std::fs::create_dir_all(part_path.join("bbb").join("h2")).unwrap();
        std::fs::write(part_path.join("bbb").join("h2").join("1000000000.00000#2#d.data"), b"y").unwrap();

        let mut local = device(0, "sda");
        local.index = Some(1);
        let mut p2 = device(2, "sd2");
        p2.index = Some(2);
        let ring = MultiPrimaryRing { primaries: vec![local.clone(), p2], local: local.clone() };

        let config_toml = format!(
            "devices = {:?}\nring_path = \"/dev/null\"\n\n[[policies]]\npolicy_index = 0\nname = \"ec\"\nreplicas = 3\nn_data = 2\nn_parity = 1\n",
            dir.path().to_string_lossy()
        );
        let config: ReconstructorConfig = toml::from_str(&config_toml).unwrap();

        let reconstructor = ReconstructorLoop::new(
            config,
            Arc::new(ring),
            Arc::new(store),
            Arc::new(EmptyPeerControl),
            Arc::new(AckingPeerSync),
            BTreeMap::new(),
        );

        let outcome = reconstructor.run_once(&PassOverrides::default(), true, false).await.unwrap();
        assert_eq!(outcome.stats.jobs_succeeded, 1);
        assert_eq!(outcome.stats.objects_deleted, 1);
        assert!(!part_path.join("bbb").join("h2").exists());
        assert!(part_path.join("aaa").join("h1").exists());
    }

    #[tokio::test]
    async fn empty_partition_is_removed_one_pass_after_it_empties() {
        // A partition directory with no suffix data at all (I5) is
        // recorded as empty at the end of the pass that finds it so,
        // and only removed at the start of the next one.
        let dir = tempfile::tempdir().unwrap();
        let local = device(0, "sda");
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        let part_path = store.partition_path("sda", 0, 7);
        std::fs::create_dir_all(&part_path).unwrap();

        let config_toml = format!(
            "devices = {:?}\nring_path = \"/dev/null\"\n\n[[policies]]\npolicy_index = 0\nname = \"ec\"\nreplicas = 1\nn_data = 1\nn_parity = 0\n",
            dir.path().to_string_lossy()
        );
        let config: ReconstructorConfig = toml::from_str(&config_toml).unwrap();

        let reconstructor = ReconstructorLoop::new(
            config,
            Arc::new(SingleDeviceRing { local }),
            Arc::new(store),
            Arc::new(EmptyPeerControl),
            Arc::new(AckingPeerSync),
            BTreeMap::new(),
        );

        // First pass finds the partition already empty and records it,
        // but must not remove it in the same pass.
        reconstructor.run_once(&PassOverrides::default(), false, false).await.unwrap();
        assert!(part_path.exists());

        // Second pass removes the directory recorded last pass.
        reconstructor.run_once(&PassOverrides::default(), false, false).await.unwrap();
        assert!(!part_path.exists());
    }
}
