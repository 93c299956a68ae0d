//! Job planner (C7, §4.7) — the center of the design. Turns one scanned
//! partition's local suffix-hash manifest into the ordered list of
//! `Job`s the executor will run. Planning never talks to peers: it
//! only groups suffixes by which fragment indices are present on disk,
//! the way `original_source/swift`'s reconstructor does before any
//! network call is made. Peer comparison happens later, in the
//! executor's "Comparing" step.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use common::{DeviceRecord, StoragePolicy, SuffixKey};

use crate::fragment_store::{FragmentStore, FragmentStoreError, SuffixManifest};
use crate::job::{Job, JobKind};
use crate::ring::RingView;
use crate::scanner::PartInfo;

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error(transparent)]
    Store(#[from] FragmentStoreError),
}

pub struct JobPlanner<'a> {
    store: &'a dyn FragmentStore,
}

impl<'a> JobPlanner<'a> {
    pub fn new(store: &'a dyn FragmentStore) -> Self {
        Self { store }
    }

    /// Plans every job for one partition (§4.7 steps 1-6). Returns
    /// REVERT jobs before SYNC jobs for the same partition, per the
    /// tie-breaking rule in §4.7: handoff data should leave before we
    /// spend effort syncing what remains.
    pub async fn plan(
        &self,
        part_info: &PartInfo,
        ring: &dyn RingView,
        policy: &StoragePolicy,
    ) -> Result<Vec<Job>, PlannerError> {
        let manifest = self
            .store
            .get_suffix_hashes(&part_info.local_device.device, part_info.partition, part_info.policy_index, &HashSet::new())
            .await?;

        let primaries = ring.primaries(part_info.partition);

        if manifest.is_empty() {
            // A primary still emits its SYNC job with empty suffixes as
            // a keepalive/hash-exchange (§4.7 rule 6); a handoff with
            // nothing on disk has no REVERT to offer.
            let mut jobs = Vec::new();
            if part_info.is_primary {
                if let Some(f) = part_info.frag_index {
                    jobs.push(self.sync_job(part_info, &primaries, f, &manifest));
                }
            }
            return Ok(jobs);
        }

        let present_indices = present_fragment_indices(&manifest);
        let only_durable = present_indices.is_empty();

        let mut jobs = Vec::new();

        if part_info.is_primary {
            if let Some(f) = part_info.frag_index {
                jobs.push(self.sync_job(part_info, &primaries, f, &manifest));
            }
            for &k in &present_indices {
                if Some(k) == part_info.frag_index {
                    continue;
                }
                if let Some(job) = self.revert_job_for_index(part_info, &primaries, policy, k, &manifest) {
                    jobs.push(job);
                }
            }
        } else {
            if only_durable {
                let suffixes: Vec<String> = manifest.keys().cloned().collect();
                jobs.push(Job {
                    policy_index: part_info.policy_index,
                    partition: part_info.partition,
                    local_device: part_info.local_device.clone(),
                    frag_index: None,
                    hashes: restrict(&manifest, &suffixes),
                    suffixes,
                    kind: JobKind::Revert,
                    peers: primaries.clone(),
                    rebuild_fn: None,
                });
            } else {
                for &k in &present_indices {
                    if let Some(job) = self.revert_job_for_index(part_info, &primaries, policy, k, &manifest) {
                        jobs.push(job);
                    }
                }
            }
        }

        jobs.sort_by_key(|j| if j.kind == JobKind::Revert { 0 } else { 1 });
        Ok(jobs)
    }

    fn sync_job(&self, part_info: &PartInfo, primaries: &[DeviceRecord], f: u16, manifest: &SuffixManifest) -> Job {
        let suffixes: Vec<String> = manifest
            .iter()
            .filter(|(_, keys)| submap_matches_index_or_bare_durable(keys, f))
            .map(|(suffix, _)| suffix.clone())
            .collect();

        let sync_to = ring_partners(primaries, &part_info.local_device);
        let hashes = restrict(manifest, &suffixes);

        Job {
            policy_index: part_info.policy_index,
            partition: part_info.partition,
            local_device: part_info.local_device.clone(),
            frag_index: Some(f),
            hashes,
            suffixes,
            kind: JobKind::Sync,
            peers: sync_to,
            rebuild_fn: Some(part_info.policy_index),
        }
    }

    fn revert_job_for_index(
        &self,
        part_info: &PartInfo,
        primaries: &[DeviceRecord],
        policy: &StoragePolicy,
        k: u16,
        manifest: &SuffixManifest,
    ) -> Option<Job> {
        let suffixes: Vec<String> = manifest
            .iter()
            .filter(|(_, keys)| keys.contains_key(&SuffixKey::FragIndex(k)))
            .map(|(suffix, _)| suffix.clone())
            .collect();
        if suffixes.is_empty() {
            return None; // REVERT jobs with no suffixes are skipped (§4.7.6)
        }

        let sync_to: Vec<DeviceRecord> = primaries
            .iter()
            .filter(|d| d.index.map(|idx| policy.get_backend_index(idx as usize)) == Some(k))
            .cloned()
            .collect();

        let hashes = restrict(manifest, &suffixes);
        Some(Job {
            policy_index: part_info.policy_index,
            partition: part_info.partition,
            local_device: part_info.local_device.clone(),
            frag_index: Some(k),
            hashes,
            suffixes,
            kind: JobKind::Revert,
            peers: sync_to,
            rebuild_fn: None,
        })
    }
}

/// Copies out just the submaps for `suffixes` from the full manifest,
/// for the executor's later peer diff.
fn restrict(manifest: &SuffixManifest, suffixes: &[String]) -> BTreeMap<String, BTreeMap<SuffixKey, String>> {
    suffixes.iter().filter_map(|s| manifest.get(s).map(|keys| (s.clone(), keys.clone()))).collect()
}

fn present_fragment_indices(manifest: &SuffixManifest) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    for keys in manifest.values() {
        for key in keys.keys() {
            if let SuffixKey::FragIndex(i) = key {
                out.insert(*i);
            }
        }
    }
    out
}

fn submap_matches_index_or_bare_durable(keys: &BTreeMap<SuffixKey, String>, f: u16) -> bool {
    if keys.contains_key(&SuffixKey::FragIndex(f)) {
        return true;
    }
    keys.keys().all(|k| *k == SuffixKey::Durable)
}

/// The two ring "partners" of `local` for this partition's primary
/// list: the devices at `(local_ring_index ± 1) mod replicas`.
fn ring_partners(primaries: &[DeviceRecord], local: &DeviceRecord) -> Vec<DeviceRecord> {
    let replicas = primaries.len().max(1);
    let Some(local_pos) = primaries.iter().position(|d| d.device == local.device) else {
        return Vec::new();
    };
    let prev = (local_pos + replicas - 1) % replicas;
    let next = (local_pos + 1) % replicas;
    let mut partners = Vec::new();
    for &pos in &[prev, next] {
        if pos != local_pos {
            if let Some(dev) = primaries.get(pos) {
                if !partners.iter().any(|p: &DeviceRecord| p.device == dev.device) {
                    partners.push(dev.clone());
                }
            }
        }
    }
    partners
}
