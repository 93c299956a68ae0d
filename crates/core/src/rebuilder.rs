//! Fragment rebuild via erasure decode (C9, §4.9). Used when a sync
//! target is missing its own fragment outright (not merely stale) and
//! must be handed a freshly reconstructed archive instead of whatever
//! this node happens to hold.

use std::collections::BTreeMap;

use common::DeviceRecord;

use crate::ec_codec::{EcCodec, EcCodecError};

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error(transparent)]
    Codec(#[from] EcCodecError),
    #[error("could not gather enough surviving fragments: have {have}, need {need}")]
    NotEnoughSurvivors { have: usize, need: usize },
}

/// One peer's raw answer to a rebuild fragment fetch, before validation
/// (§4.9 step 3). `fetch_fragment` hands these back as-is; `Rebuilder`
/// decides what to keep.
#[derive(Debug, Clone)]
pub struct FragmentResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub frag_index: Option<u16>,
    pub backend_timestamp: Option<String>,
    pub body: Vec<u8>,
}

struct ValidFragment {
    peer: DeviceRecord,
    frag_index: u16,
    etag: String,
    backend_timestamp: String,
    body: Vec<u8>,
}

/// A fragment archive rebuilt from sibling responses, along with the
/// metadata its destination needs to write it to disk correctly.
#[derive(Debug, Clone)]
pub struct RebuiltFragment {
    pub body: Vec<u8>,
    pub etag: String,
    pub backend_timestamp: String,
}

/// Reconstructs one missing fragment archive from sibling responses.
/// Stateless beyond `codec`: the same peer responses always yield the
/// same bytes (determinism, §4.9).
pub struct Rebuilder<'a> {
    codec: &'a dyn EcCodec,
}

impl<'a> Rebuilder<'a> {
    pub fn new(codec: &'a dyn EcCodec) -> Self {
        Self { codec }
    }

    /// `fetch_fragment` abstracts the actual archive GET (left to the
    /// caller since it is a plain object GET, not a control RPC);
    /// `None` means the peer was unreachable and is treated the same as
    /// a dropped response.
    pub async fn reconstruct<F, Fut>(
        &self,
        primaries: &[DeviceRecord],
        local_device: &DeviceRecord,
        target_frag_index: u16,
        mut fetch_fragment: F,
    ) -> Result<RebuiltFragment, RebuildError>
    where
        F: FnMut(&DeviceRecord) -> Fut,
        Fut: std::future::Future<Output = Option<FragmentResponse>>,
    {
        let mut valid = Vec::new();
        for peer in primaries {
            if peer.device == local_device.device {
                continue;
            }
            let Some(resp) = fetch_fragment(peer).await else { continue };
            if let Some(v) = validate(peer, resp) {
                valid.push(v);
            }
        }

        if valid.is_empty() {
            return Err(RebuildError::NotEnoughSurvivors { have: 0, need: self.codec.n_data() });
        }

        // Step 4: group by (etag, backend_timestamp); newest timestamp
        // wins, ties broken by the larger group. Swift timestamps are
        // fixed-width zero-padded decimals, so lexical string order is
        // chronological order.
        let mut groups: BTreeMap<(String, String), Vec<ValidFragment>> = BTreeMap::new();
        for v in valid {
            groups.entry((v.etag.clone(), v.backend_timestamp.clone())).or_default().push(v);
        }

        let mut ranked: Vec<((String, String), usize)> = groups.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        ranked.sort_by(|a, b| a.0 .1.cmp(&b.0 .1).then(a.1.cmp(&b.1)));
        let chosen_key = ranked.last().expect("valid is non-empty so groups is non-empty").0.clone();
        let total_groups = groups.len();
        let chosen = groups.remove(&chosen_key).expect("chosen_key came from groups' own keys");

        if total_groups > 1 {
            tracing::error!(groups = total_groups, "rebuild saw mixed ETag/timestamp groups among peer responses");
        }

        // Drop our own index (harmless but not used for reconstruction)
        // and dedupe by fragment index within the chosen group.
        let mut by_index: BTreeMap<u16, ValidFragment> = BTreeMap::new();
        for v in chosen {
            if v.frag_index == target_frag_index {
                tracing::debug!(peer = %v.peer.device, frag_index = v.frag_index, "peer holds the fragment index being rebuilt; ignoring it");
                continue;
            }
            by_index.entry(v.frag_index).or_insert(v);
        }

        if by_index.len() < self.codec.n_data() {
            tracing::warn!(have = by_index.len(), need = self.codec.n_data(), "not enough distinct fragments to rebuild");
            return Err(RebuildError::NotEnoughSurvivors { have: by_index.len(), need: self.codec.n_data() });
        }

        let unique = self.codec.n_unique_fragments();
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; unique];
        for (idx, v) in by_index {
            if (idx as usize) < unique {
                shards[idx as usize] = Some(v.body);
            }
        }

        self.codec.reconstruct(&mut shards)?;
        let body = shards[target_frag_index as usize]
            .take()
            .ok_or(RebuildError::NotEnoughSurvivors { have: 0, need: self.codec.n_data() })?;
        let (etag, backend_timestamp) = chosen_key;
        Ok(RebuiltFragment { body, etag, backend_timestamp })
    }
}

fn validate(peer: &DeviceRecord, resp: FragmentResponse) -> Option<ValidFragment> {
    if resp.status != 200 {
        tracing::warn!(peer = %peer.device, status = resp.status, "rebuild peer fetch dropped: non-200 status");
        return None;
    }
    let Some(etag) = resp.etag else {
        tracing::warn!(peer = %peer.device, "rebuild peer fetch dropped: missing ETag");
        return None;
    };
    let Some(frag_index) = resp.frag_index else {
        tracing::warn!(peer = %peer.device, "rebuild peer fetch dropped: missing or invalid fragment index");
        return None;
    };
    let Some(backend_timestamp) = resp.backend_timestamp else {
        tracing::warn!(peer = %peer.device, "rebuild peer fetch dropped: missing backend timestamp");
        return None;
    };
    Some(ValidFragment { peer: peer.clone(), frag_index, etag, backend_timestamp, body: resp.body })
}

/// Per-fragment available map used to decide which handoff holds which
/// backend index, when more than one handoff is caretaking the same
/// partition (B3: backup handoffs beyond the configured limit are
/// logged and skipped, never rebuilt from).
pub type HandoffFragmentMap = BTreeMap<u16, DeviceRecord>;
