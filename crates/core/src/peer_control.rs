//! Control-channel RPCs to peer object servers (C4, §4.4, §7). Mirrors
//! the teacher's `p2p/client.rs` request/response wrapper around
//! `reqwest`: typed errors at the boundary, timeouts from config, no
//! retries here (retry policy belongs to the executor).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    wire::{HEADER_BACKEND_TIMESTAMP, HEADER_EC_ETAG, HEADER_EC_FRAG_INDEX},
    DeviceRecord,
};

use crate::fragment_store::SuffixManifest;
use crate::rebuilder::FragmentResponse;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {peer} unreachable: {source}")]
    Unreachable { peer: String, source: reqwest::Error },
    #[error("peer {peer} timed out after {timeout_secs}s")]
    Timeout { peer: String, timeout_secs: u64 },
    #[error("peer {peer} returned unexpected status {status}")]
    UnexpectedStatus { peer: String, status: u16 },
    #[error("peer {peer} sent a malformed response body: {source}")]
    MalformedBody { peer: String, source: serde_json::Error },
}

/// Read-side control RPCs against a peer's object-server REPLICATE
/// endpoint.
#[async_trait]
pub trait PeerControl: Send + Sync {
    async fn fetch_suffix_hashes(
        &self,
        peer: &DeviceRecord,
        policy_index: u32,
        partition: u64,
        suffixes: &[String],
        recalc: &HashSet<String>,
    ) -> Result<SuffixManifest, PeerError>;

    /// Fetches one object's fragment archive from `peer`, for the
    /// Rebuilder hook (§4.8/§4.9) to pull sibling fragments when this
    /// node's own copy is missing. The default rejects every peer;
    /// only `HttpPeerControl` does the real GET.
    async fn fetch_fragment(
        &self,
        peer: &DeviceRecord,
        policy_index: u32,
        partition: u64,
        suffix: &str,
        obj_hash: &str,
    ) -> Result<FragmentResponse, PeerError> {
        let _ = (policy_index, partition, suffix, obj_hash);
        Err(PeerError::UnexpectedStatus { peer: peer.device.clone(), status: 501 })
    }
}

pub struct HttpPeerControl {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPeerControl {
    pub fn new(timeout: Duration) -> Result<Self, PeerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| PeerError::Unreachable { peer: "<client init>".to_string(), source })?;
        Ok(Self { client, timeout })
    }

    fn peer_label(peer: &DeviceRecord) -> String {
        format!("{}:{}/{}", peer.replication_ip, peer.replication_port, peer.device)
    }
}

#[async_trait]
impl PeerControl for HttpPeerControl {
    async fn fetch_suffix_hashes(
        &self,
        peer: &DeviceRecord,
        policy_index: u32,
        partition: u64,
        suffixes: &[String],
        recalc: &HashSet<String>,
    ) -> Result<SuffixManifest, PeerError> {
        let label = Self::peer_label(peer);
        let url = format!(
            "http://{}:{}/{}/{}/{}",
            peer.replication_ip, peer.replication_port, peer.device, policy_index, partition
        );
        let response = self
            .client
            .request(reqwest::Method::from_bytes(b"REPLICATE").unwrap(), &url)
            .query(&[("suffixes", suffixes.join("-"))])
            .header("X-Backend-Recalculate-Suffixes", recalc.iter().cloned().collect::<Vec<_>>().join("-"))
            .header(HEADER_BACKEND_TIMESTAMP, "")
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    PeerError::Timeout { peer: label.clone(), timeout_secs: self.timeout.as_secs() }
                } else {
                    PeerError::Unreachable { peer: label.clone(), source }
                }
            })?;

        if !response.status().is_success() {
            return Err(PeerError::UnexpectedStatus { peer: label, status: response.status().as_u16() });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| PeerError::Unreachable { peer: label.clone(), source })?;
        serde_json::from_slice(&bytes).map_err(|source| PeerError::MalformedBody { peer: label, source })
    }

    async fn fetch_fragment(
        &self,
        peer: &DeviceRecord,
        policy_index: u32,
        partition: u64,
        suffix: &str,
        obj_hash: &str,
    ) -> Result<FragmentResponse, PeerError> {
        let label = Self::peer_label(peer);
        let url = format!(
            "http://{}:{}/{}/{}/{}/{}/{}",
            peer.replication_ip, peer.replication_port, peer.device, policy_index, partition, suffix, obj_hash
        );
        let response = self.client.get(&url).send().await.map_err(|source| {
            if source.is_timeout() {
                PeerError::Timeout { peer: label.clone(), timeout_secs: self.timeout.as_secs() }
            } else {
                PeerError::Unreachable { peer: label.clone(), source }
            }
        })?;

        let status = response.status().as_u16();
        let etag = response.headers().get(HEADER_EC_ETAG).and_then(|v| v.to_str().ok()).map(str::to_string);
        let frag_index =
            response.headers().get(HEADER_EC_FRAG_INDEX).and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok());
        let backend_timestamp =
            response.headers().get(HEADER_BACKEND_TIMESTAMP).and_then(|v| v.to_str().ok()).map(str::to_string);
        let body = response.bytes().await.map_err(|source| PeerError::Unreachable { peer: label, source })?.to_vec();

        Ok(FragmentResponse { status, etag, frag_index, backend_timestamp, body })
    }
}
