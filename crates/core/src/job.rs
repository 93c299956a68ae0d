//! Reconstruction job data model (§3).

use std::collections::BTreeMap;

use common::{wire::ObjectTimestamps, DeviceRecord, SuffixKey};

/// Maps object hash to its timestamps, as returned by a peer sync
/// exchange or read off local disk. A tombstone entry carries only
/// `ts_data`.
pub type AvailableMap = BTreeMap<String, ObjectTimestamps>;

/// Whether a job pushes this node's fragment out to a peer that's
/// missing it (`Sync`, the common case on a primary) or pulls a
/// fragment back from a handoff onto its rightful primary (`Revert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Sync,
    Revert,
}

/// One unit of reconstruction work: bring `suffixes` of `partition` on
/// `local_device` in line with one or more peers, for the fragment
/// index this node holds (or, for a handoff, is merely caretaking).
#[derive(Debug, Clone)]
pub struct Job {
    pub policy_index: u32,
    pub partition: u64,
    pub local_device: DeviceRecord,
    /// `None` only when the local device is a handoff holding a mixed
    /// bag of fragment indices it must revert piecemeal.
    pub frag_index: Option<u16>,
    pub suffixes: Vec<String>,
    /// The local suffix-hash submap (restricted to `suffixes`) computed
    /// at planning time, carried into execution so the executor's
    /// "Comparing" step can diff against each peer's manifest without
    /// re-reading local disk.
    pub hashes: BTreeMap<String, BTreeMap<SuffixKey, String>>,
    pub kind: JobKind,
    /// Peers this job must reach; for `Sync` jobs the two ring
    /// partners; for `Revert` jobs the rightful primaries (or backup
    /// handoffs) to hand data back to.
    pub peers: Vec<DeviceRecord>,
    /// SYNC-only: an opaque identifier (the storage policy index) the
    /// executor resolves against its own `Rebuilder` registry to pull a
    /// missing fragment mid-sync. Never a direct handle to the
    /// reconstructor, so `Job` and `JobExecutor` don't reference each
    /// other. Always `None` for `Revert` jobs.
    pub rebuild_fn: Option<u32>,
}

impl Job {
    pub fn is_handoff_origin(&self) -> bool {
        self.kind == JobKind::Revert
    }
}
