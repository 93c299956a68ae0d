//! Per-job execution state machine (C8, §4.8). Mirrors the lifecycle
//! the teacher's `agent/src/deploy.rs` walks a component bundle through
//! (Planned -> Fetching -> Verifying -> Installed | Failed), generalized
//! to a sync/revert transfer instead of a deployment.
//!
//! `JobPlanner` only ever reads local disk; the peer comparison it skips
//! happens here, in `execute_sync`'s "Comparing" step, against whichever
//! peers the job names plus backup handoffs if a primary doesn't answer.

use std::collections::{BTreeMap, HashSet};

use common::DeviceRecord;

use crate::fragment_store::{FragmentStore, ObjectEntry, SuffixManifest};
use crate::job::{AvailableMap, Job, JobKind};
use crate::peer_control::{PeerControl, PeerError};
use crate::peer_sync::{PeerSync, PeerSyncError};
use crate::rebuilder::Rebuilder;
use crate::ring::RingView;
use crate::stats::PassStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Planned,
    Comparing,
    Transferring,
    Cleaning,
    Done,
    Failed,
    Deferred,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Control(#[from] PeerError),
    #[error(transparent)]
    Sync(#[from] PeerSyncError),
}

#[derive(Debug)]
pub struct JobOutcome {
    pub state: JobState,
    pub objects_sent: usize,
    pub objects_deleted: usize,
    pub error: Option<ExecuteError>,
}

/// A peer attempt either defers (retry next pass, e.g. a timeout) or
/// fails outright; either way the executor moves on to a backup
/// candidate before giving up on that slot.
enum SyncAttemptError {
    Deferred,
    Failed(ExecuteError),
}

impl SyncAttemptError {
    fn from_control(err: PeerError) -> Self {
        match err {
            PeerError::Timeout { .. } => SyncAttemptError::Deferred,
            other => SyncAttemptError::Failed(ExecuteError::Control(other)),
        }
    }

    fn from_sync(err: PeerSyncError) -> Self {
        match err {
            PeerSyncError::Timeout { .. } => SyncAttemptError::Deferred,
            other => SyncAttemptError::Failed(ExecuteError::Sync(other)),
        }
    }
}

pub struct JobExecutor<'a> {
    store: &'a dyn FragmentStore,
    peer_control: &'a dyn PeerControl,
    peer_sync: &'a dyn PeerSync,
    ring: &'a dyn RingView,
    stats: &'a PassStats,
    max_backup_handoffs: usize,
    rebuilders: &'a BTreeMap<u32, Rebuilder<'a>>,
}

impl<'a> JobExecutor<'a> {
    pub fn new(
        store: &'a dyn FragmentStore,
        peer_control: &'a dyn PeerControl,
        peer_sync: &'a dyn PeerSync,
        ring: &'a dyn RingView,
        stats: &'a PassStats,
        max_backup_handoffs: usize,
        rebuilders: &'a BTreeMap<u32, Rebuilder<'a>>,
    ) -> Self {
        Self { store, peer_control, peer_sync, ring, stats, max_backup_handoffs, rebuilders }
    }

    /// Runs one job to completion. Never panics on peer failure: a
    /// failed or timed-out peer produces `JobState::Failed`/`Deferred`
    /// so the pass continues with the next job.
    pub async fn execute(&self, job: &Job, dry_run: bool) -> JobOutcome {
        if job.peers.is_empty() {
            return JobOutcome { state: JobState::Failed, objects_sent: 0, objects_deleted: 0, error: None };
        }

        if dry_run {
            tracing::info!(
                partition = job.partition,
                kind = ?job.kind,
                suffixes = job.suffixes.len(),
                "dry-run: skipping execution"
            );
            return JobOutcome { state: JobState::Done, objects_sent: 0, objects_deleted: 0, error: None };
        }

        match job.kind {
            JobKind::Sync => self.execute_sync(job).await,
            JobKind::Revert => self.execute_revert(job).await,
        }
    }

    /// SYNC jobs compare against each named peer before transferring,
    /// only pushing the suffixes that actually disagree (§4.8 step 1-2).
    /// A peer that can't be reached is replaced by a backup handoff,
    /// up to `max_backup_handoffs` candidates (§4.8 step 3).
    async fn execute_sync(&self, job: &Job) -> JobOutcome {
        let mut objects_sent = 0;
        let mut any_failed = false;
        let mut any_deferred = false;
        let mut last_error = None;

        for peer in &job.peers {
            match self.sync_one_peer(job, peer).await {
                Ok(sent) => {
                    objects_sent += sent;
                    continue;
                }
                Err(first_err) => {
                    let mut recovered = None;
                    for backup in self.backup_candidates(job) {
                        if let Ok(sent) = self.sync_one_peer(job, &backup).await {
                            recovered = Some(sent);
                            break;
                        }
                    }
                    match recovered {
                        Some(sent) => objects_sent += sent,
                        None => match first_err {
                            SyncAttemptError::Deferred => any_deferred = true,
                            SyncAttemptError::Failed(err) => {
                                any_failed = true;
                                last_error = Some(err);
                            }
                        },
                    }
                }
            }
        }

        let state = if any_failed {
            PassStats::incr(&self.stats.jobs_failed, 1);
            JobState::Failed
        } else if any_deferred {
            PassStats::incr(&self.stats.jobs_deferred, 1);
            JobState::Deferred
        } else {
            PassStats::incr(&self.stats.jobs_succeeded, 1);
            JobState::Done
        };

        JobOutcome { state, objects_sent, objects_deleted: 0, error: last_error }
    }

    async fn sync_one_peer(&self, job: &Job, peer: &DeviceRecord) -> Result<usize, SyncAttemptError> {
        let peer_manifest = self
            .peer_control
            .fetch_suffix_hashes(peer, job.policy_index, job.partition, &job.suffixes, &HashSet::new())
            .await
            .map_err(SyncAttemptError::from_control)?;

        let delta = diff_suffixes(&job.hashes, &peer_manifest);
        if delta.is_empty() {
            return Ok(0);
        }

        if let (Some(policy_index), Some(f)) = (job.rebuild_fn, job.frag_index) {
            if let Some(rebuilder) = self.rebuilders.get(&policy_index) {
                self.rebuild_missing_fragments(job, &delta, f, rebuilder).await;
            }
        }

        let (_, available) = self
            .peer_sync
            .send(job, peer, &delta, self.store)
            .await
            .map_err(SyncAttemptError::from_sync)?;
        Ok(available.len())
    }

    /// Rebuilder hook (§4.8): before a suffix goes out over SSYNC, any
    /// object in it whose local fragment index is missing gets pulled
    /// back via erasure decode from sibling primaries first, so the
    /// peer receives a complete archive instead of the gap this node
    /// actually has on disk.
    async fn rebuild_missing_fragments(&self, job: &Job, suffixes: &[String], f: u16, rebuilder: &Rebuilder<'_>) {
        let primaries = self.ring.primaries(job.partition);
        for suffix in suffixes {
            let Ok(entries) = self
                .store
                .yield_hashes(&job.local_device.device, job.partition, job.policy_index, Some(std::slice::from_ref(suffix)), None)
                .await
            else {
                continue;
            };

            let mine: HashSet<&str> = entries
                .iter()
                .filter(|(_, _, entry, _)| matches!(entry, ObjectEntry::Fragment { frag_index, .. } if *frag_index == f))
                .map(|(_, hash, _, _)| hash.as_str())
                .collect();

            let mut handled: HashSet<String> = HashSet::new();
            for (_, obj_hash, entry, _) in &entries {
                if matches!(entry, ObjectEntry::Tombstone) {
                    continue;
                }
                if mine.contains(obj_hash.as_str()) || !handled.insert(obj_hash.clone()) {
                    continue;
                }

                let rebuilt = rebuilder
                    .reconstruct(&primaries, &job.local_device, f, |peer| {
                        let policy_index = job.policy_index;
                        let partition = job.partition;
                        let suffix = suffix.clone();
                        let obj_hash = obj_hash.clone();
                        async move { self.peer_control.fetch_fragment(peer, policy_index, partition, &suffix, &obj_hash).await.ok() }
                    })
                    .await;

                match rebuilt {
                    Ok(r) => {
                        let len = r.body.len();
                        match self
                            .store
                            .write_rebuilt_fragment(
                                &job.local_device.device,
                                job.partition,
                                job.policy_index,
                                suffix,
                                obj_hash,
                                &r.backend_timestamp,
                                f,
                                &r.body,
                            )
                            .await
                        {
                            Ok(()) => {
                                PassStats::incr(&self.stats.bytes_rebuilt, len as u64);
                                tracing::info!(object = %obj_hash, suffix = %suffix, frag_index = f, "rebuilt missing fragment before sync");
                            }
                            Err(err) => {
                                tracing::warn!(object = %obj_hash, error = %err, "failed to persist rebuilt fragment");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(object = %obj_hash, suffix = %suffix, error = %err, "could not rebuild missing fragment, syncing without it");
                    }
                }
            }
        }
    }

    /// Handoff devices beyond the primaries, excluding ourselves,
    /// bounded by `max_backup_handoffs` (B3).
    fn backup_candidates(&self, job: &Job) -> Vec<DeviceRecord> {
        self.ring
            .more_nodes(job.partition)
            .into_iter()
            .filter(|d| d.device != job.local_device.device)
            .take(self.max_backup_handoffs)
            .collect()
    }

    /// REVERT jobs send the whole suffix list to every named peer with
    /// no prior comparison (a handoff has nothing else to compare
    /// against). Each peer's ack is handled on its own: an object is
    /// deleted as soon as any one peer confirms it (§9's "at least one"
    /// resolution, a union across peers, never an intersection), and a
    /// peer that fails or times out only costs that peer's slot — it
    /// never erases another peer's already-confirmed deletions. A
    /// failed/timed-out peer also counts toward `handoffs_remaining`
    /// (§4.8 step 3), since this handoff still has data that peer never
    /// took off its hands.
    async fn execute_revert(&self, job: &Job) -> JobOutcome {
        let mut objects_sent = 0usize;
        let mut objects_deleted = 0usize;
        let mut any_failed = false;
        let mut any_deferred = false;
        let mut last_error = None;

        for peer in &job.peers {
            match self.peer_sync.send(job, peer, &job.suffixes, self.store).await {
                Ok((_, available)) => {
                    objects_sent += available.len();
                    if !available.is_empty() {
                        objects_deleted += self.delete_acked(job, &available).await.unwrap_or(0);
                    }
                }
                Err(PeerSyncError::Timeout { timeout_secs, peer }) => {
                    any_deferred = true;
                    last_error = Some(ExecuteError::Sync(PeerSyncError::Timeout { timeout_secs, peer }));
                    PassStats::incr(&self.stats.handoffs_remaining, 1);
                }
                Err(err) => {
                    any_failed = true;
                    PassStats::incr(&self.stats.handoffs_remaining, 1);
                    last_error = Some(ExecuteError::Sync(err));
                }
            }
        }

        let state = if any_failed {
            PassStats::incr(&self.stats.jobs_failed, 1);
            JobState::Failed
        } else if any_deferred {
            PassStats::incr(&self.stats.jobs_deferred, 1);
            JobState::Deferred
        } else {
            PassStats::incr(&self.stats.jobs_succeeded, 1);
            JobState::Done
        };
        PassStats::incr(&self.stats.objects_deleted, objects_deleted as u64);

        JobOutcome { state, objects_sent, objects_deleted, error: last_error }
    }

    /// Deletes exactly the objects the peer acked, never the full
    /// suffix list (partial-ack rule, §9): if a peer only accepts half
    /// the objects we offered, the other half must survive for the
    /// next pass to retry.
    async fn delete_acked(&self, job: &Job, available: &AvailableMap) -> Result<usize, crate::fragment_store::FragmentStoreError> {
        self.store
            .delete_objects(&job.local_device.device, job.partition, job.policy_index, available, job.frag_index)
            .await
    }
}

/// Suffixes where the peer's submap for that suffix doesn't match ours,
/// either because the peer lacks the suffix entirely or its hash
/// disagrees. This is the "Comparing" step (§4.8 step 1): only disagreeing
/// suffixes get pushed over the data channel.
fn diff_suffixes(local: &SuffixManifest, peer: &SuffixManifest) -> Vec<String> {
    local
        .iter()
        .filter(|(suffix, local_keys)| peer.get(suffix.as_str()).map(|peer_keys| peer_keys != *local_keys).unwrap_or(true))
        .map(|(suffix, _)| suffix.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment_store::LocalFragmentStore;
    use async_trait::async_trait;
    use common::{wire::ObjectTimestamps, DeviceRecord, SuffixKey};
    use std::collections::BTreeMap;

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

    struct FakePeerSync {
        acked: Vec<String>,
    }

    #[async_trait]
    impl PeerSync for FakePeerSync {
        async fn send(
            &self,
            _job: &Job,
            _peer: &DeviceRecord,
            _suffixes: &[String],
            _store: &dyn FragmentStore,
        ) -> Result<(bool, AvailableMap), PeerSyncError> {
            let mut map = AvailableMap::new();
            for hash in &self.acked {
                map.insert(hash.clone(), ObjectTimestamps::tombstone("1000000000.00000"));
            }
            Ok((!self.acked.is_empty(), map))
        }
    }

    /// Acks on one named peer, fails outright on every other, to
    /// exercise per-peer union semantics on REVERT.
    struct PartialPeerSync {
        succeeds_on: String,
        acked: Vec<String>,
    }

    #[async_trait]
    impl PeerSync for PartialPeerSync {
        async fn send(
            &self,
            _job: &Job,
            peer: &DeviceRecord,
            _suffixes: &[String],
            _store: &dyn FragmentStore,
        ) -> Result<(bool, AvailableMap), PeerSyncError> {
            if peer.device != self.succeeds_on {
                return Err(PeerSyncError::Rejected { peer: peer.device.clone(), status: 500 });
            }
            let mut map = AvailableMap::new();
            for hash in &self.acked {
                map.insert(hash.clone(), ObjectTimestamps::tombstone("1000000000.00000"));
            }
            Ok((!self.acked.is_empty(), map))
        }
    }

    /// Reports no knowledge of any suffix, so every suffix the job names
    /// comes back in the diff and gets pushed.
    struct EmptyPeerControl;
    #[async_trait]
    impl PeerControl for EmptyPeerControl {
        async fn fetch_suffix_hashes(
            &self,
            _peer: &DeviceRecord,
            _policy_index: u32,
            _partition: u64,
            _suffixes: &[String],
            _recalc: &HashSet<String>,
        ) -> Result<SuffixManifest, PeerError> {
            Ok(SuffixManifest::new())
        }
    }

    struct NoHandoffsRing;
    #[async_trait]
    impl RingView for NoHandoffsRing {
        fn primaries(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![]
        }
        fn more_nodes(&self, _partition: u64) -> Vec<DeviceRecord> {
            vec![]
        }
        fn is_local(&self, _device: &DeviceRecord) -> bool {
            false
        }
        async fn check_ring(&self) -> Result<(), crate::ring::RingError> {
            Ok(())
        }
        fn partition_count(&self) -> usize {
            1
        }
        fn devices(&self) -> Vec<DeviceRecord> {
            vec![]
        }
    }

    fn make_job(kind: JobKind, local: DeviceRecord, peer: DeviceRecord, frag_index: Option<u16>) -> Job {
        make_job_multi(kind, local, vec![peer], frag_index)
    }

    fn make_job_multi(kind: JobKind, local: DeviceRecord, peers: Vec<DeviceRecord>, frag_index: Option<u16>) -> Job {
        let mut submap = BTreeMap::new();
        submap.insert(SuffixKey::FragIndex(frag_index.unwrap_or(0)), "deadbeef".to_string());
        let mut hashes = BTreeMap::new();
        hashes.insert("abc".to_string(), submap);

        Job {
            policy_index: 0,
            partition: 5,
            local_device: local,
            frag_index,
            suffixes: vec!["abc".to_string()],
            hashes,
            kind,
            peers,
            rebuild_fn: if kind == JobKind::Sync { Some(0) } else { None },
        }
    }

    fn no_rebuilders() -> BTreeMap<u32, Rebuilder<'static>> {
        BTreeMap::new()
    }

    #[tokio::test]
    async fn revert_job_deletes_only_acked_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        let part_path = store.partition_path("handoff1", 0, 5);
        std::fs::create_dir_all(part_path.join("abc").join("aaaa")).unwrap();
        std::fs::write(part_path.join("abc").join("aaaa").join("1000000000.00000#2#d.data"), b"x").unwrap();
        std::fs::create_dir_all(part_path.join("abc").join("bbbb")).unwrap();
        std::fs::write(part_path.join("abc").join("bbbb").join("1000000000.00000#2#d.data"), b"y").unwrap();

        let peer_control = EmptyPeerControl;
        let peer_sync = FakePeerSync { acked: vec!["aaaa".to_string()] };
        let ring = NoHandoffsRing;
        let stats = PassStats::new();
        let rebuilders = no_rebuilders();
        let executor = JobExecutor::new(&store, &peer_control, &peer_sync, &ring, &stats, 0, &rebuilders);
        let job = make_job(JobKind::Revert, device(9, "handoff1"), device(0, "sda"), None);

        let outcome = executor.execute(&job, false).await;
        assert_eq!(outcome.state, JobState::Done);
        assert_eq!(outcome.objects_deleted, 1);
        assert!(!part_path.join("abc").join("aaaa").exists());
        assert!(part_path.join("abc").join("bbbb").exists());
    }

    #[tokio::test]
    async fn revert_job_keeps_one_peers_acked_deletions_despite_another_peers_failure() {
        // §9: delete only objects acknowledged by at least one peer.
        // One peer failing must never erase what another peer already
        // confirmed, and the failure still counts toward handoffs_remaining.
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        let part_path = store.partition_path("handoff1", 0, 5);
        std::fs::create_dir_all(part_path.join("abc").join("aaaa")).unwrap();
        std::fs::write(part_path.join("abc").join("aaaa").join("1000000000.00000#2#d.data"), b"x").unwrap();

        let peer_control = EmptyPeerControl;
        let peer_sync = PartialPeerSync { succeeds_on: "sd0".to_string(), acked: vec!["aaaa".to_string()] };
        let ring = NoHandoffsRing;
        let stats = PassStats::new();
        let rebuilders = no_rebuilders();
        let executor = JobExecutor::new(&store, &peer_control, &peer_sync, &ring, &stats, 0, &rebuilders);
        let job = make_job_multi(
            JobKind::Revert,
            device(9, "handoff1"),
            vec![device(1, "sd1"), device(0, "sd0")],
            None,
        );

        let outcome = executor.execute(&job, false).await;
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.objects_deleted, 1);
        assert!(!part_path.join("abc").join("aaaa").exists());
        assert_eq!(stats.snapshot().handoffs_remaining, 1);
    }

    #[tokio::test]
    async fn sync_job_never_deletes_local_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        let part_path = store.partition_path("sda", 0, 5);
        std::fs::create_dir_all(part_path.join("abc").join("aaaa")).unwrap();
        std::fs::write(part_path.join("abc").join("aaaa").join("1000000000.00000#0#d.data"), b"x").unwrap();

        let peer_control = EmptyPeerControl;
        let peer_sync = FakePeerSync { acked: vec!["aaaa".to_string()] };
        let ring = NoHandoffsRing;
        let stats = PassStats::new();
        let rebuilders = no_rebuilders();
        let executor = JobExecutor::new(&store, &peer_control, &peer_sync, &ring, &stats, 0, &rebuilders);
        let job = make_job(JobKind::Sync, device(0, "sda"), device(1, "sdb"), Some(0));

        let outcome = executor.execute(&job, false).await;
        assert_eq!(outcome.state, JobState::Done);
        assert_eq!(outcome.objects_deleted, 0);
        assert_eq!(outcome.objects_sent, 1);
        assert!(part_path.join("abc").join("aaaa").exists());
    }

    #[tokio::test]
    async fn sync_job_skips_peer_already_matching() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");

        struct MatchingPeerControl;
        #[async_trait]
        impl PeerControl for MatchingPeerControl {
            async fn fetch_suffix_hashes(
                &self,
                _peer: &DeviceRecord,
                _policy_index: u32,
                _partition: u64,
                _suffixes: &[String],
                _recalc: &HashSet<String>,
            ) -> Result<SuffixManifest, PeerError> {
                let mut submap = BTreeMap::new();
                submap.insert(SuffixKey::FragIndex(0), "deadbeef".to_string());
                let mut manifest = SuffixManifest::new();
                manifest.insert("abc".to_string(), submap);
                Ok(manifest)
            }
        }

        let peer_control = MatchingPeerControl;
        let peer_sync = FakePeerSync { acked: vec!["aaaa".to_string()] };
        let ring = NoHandoffsRing;
        let stats = PassStats::new();
        let rebuilders = no_rebuilders();
        let executor = JobExecutor::new(&store, &peer_control, &peer_sync, &ring, &stats, 0, &rebuilders);
        let job = make_job(JobKind::Sync, device(0, "sda"), device(1, "sdb"), Some(0));

        let outcome = executor.execute(&job, false).await;
        assert_eq!(outcome.state, JobState::Done);
        assert_eq!(outcome.objects_sent, 0);
    }

    #[tokio::test]
    async fn dry_run_skips_transfer_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFragmentStore::new(dir.path().to_path_buf(), "hashes.pkl");
        let peer_control = EmptyPeerControl;
        let peer_sync = FakePeerSync { acked: vec!["aaaa".to_string()] };
        let ring = NoHandoffsRing;
        let stats = PassStats::new();
        let rebuilders = no_rebuilders();
        let executor = JobExecutor::new(&store, &peer_control, &peer_sync, &ring, &stats, 0, &rebuilders);
        let job = make_job(JobKind::Sync, device(0, "sda"), device(1, "sdb"), Some(0));

        let outcome = executor.execute(&job, true).await;
        assert_eq!(outcome.state, JobState::Done);
        assert_eq!(outcome.objects_sent, 0);
    }
}
