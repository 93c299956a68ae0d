//! SSYNC data-channel exchange with a peer (C5, §4.5, §7). Pushes the
//! fragments/tombstones a `Job` decided a peer is missing and returns
//! which of them the peer actually accepted, the way the teacher's
//! `p2p/transfer.rs` streams a component bundle and waits for a
//! per-chunk ack list.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    wire::{HEADER_BACKEND_TIMESTAMP, HEADER_EC_ETAG, HEADER_EC_FRAG_INDEX},
    DeviceRecord,
};

use crate::fragment_store::{FragmentStore, FragmentStoreError, ObjectEntry};
use crate::job::{AvailableMap, Job};

#[derive(Debug, thiserror::Error)]
pub enum PeerSyncError {
    #[error("peer {peer} unreachable: {source}")]
    Unreachable { peer: String, source: reqwest::Error },
    #[error("peer {peer} timed out after {timeout_secs}s")]
    Timeout { peer: String, timeout_secs: u64 },
    #[error("peer {peer} rejected the sync with status {status}")]
    Rejected { peer: String, status: u16 },
    #[error("peer {peer} sent a malformed ack body: {source}")]
    MalformedBody { peer: String, source: serde_json::Error },
    #[error("local fragment store error while staging objects to send: {0}")]
    Store(#[from] FragmentStoreError),
    #[error("failed to read fragment body at {path}: {source}")]
    ReadBody { path: PathBuf, source: std::io::Error },
}

/// `true` in the returned tuple means the peer acked at least one
/// object; the caller uses the accompanying `AvailableMap` to decide
/// exactly which local objects are now safe to delete (a `Revert` job
/// deletes only what was actually acked, never the whole suffix list,
/// per the partial-ack rule).
#[async_trait]
pub trait PeerSync: Send + Sync {
    async fn send(
        &self,
        job: &Job,
        peer: &DeviceRecord,
        suffixes: &[String],
        store: &dyn FragmentStore,
    ) -> Result<(bool, AvailableMap), PeerSyncError>;
}

pub struct HttpPeerSync {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPeerSync {
    pub fn new(timeout: Duration) -> Result<Self, PeerSyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|source| {
            PeerSyncError::Unreachable { peer: "<client init>".to_string(), source }
        })?;
        Ok(Self { client, timeout })
    }

    fn peer_label(peer: &DeviceRecord) -> String {
        format!("{}:{}/{}", peer.replication_ip, peer.replication_port, peer.device)
    }
}

#[derive(Debug, serde::Deserialize)]
struct SsyncAck {
    acked: Vec<String>,
}

#[async_trait]
impl PeerSync for HttpPeerSync {
    async fn send(
        &self,
        job: &Job,
        peer: &DeviceRecord,
        suffixes: &[String],
        store: &dyn FragmentStore,
    ) -> Result<(bool, AvailableMap), PeerSyncError> {
        let label = Self::peer_label(peer);
        let entries = store
            .yield_hashes(&job.local_device.device, job.partition, job.policy_index, Some(suffixes), job.frag_index)
            .await?;

        let url = format!(
            "http://{}:{}/{}/{}/{}",
            peer.replication_ip, peer.replication_port, peer.device, job.policy_index, job.partition
        );

        let mut form = reqwest::multipart::Form::new();
        let mut sent_hashes: HashSet<String> = HashSet::new();
        for (path, obj_hash, entry, _suffix) in entries {
            let body = tokio::fs::read(&path)
                .await
                .map_err(|source| PeerSyncError::ReadBody { path: path.clone(), source })?;
            let mut part = reqwest::multipart::Part::bytes(body).file_name(obj_hash.clone());
            if let ObjectEntry::Fragment { frag_index, .. } = entry {
                part = part.headers({
                    let mut h = reqwest::header::HeaderMap::new();
                    h.insert(HEADER_EC_FRAG_INDEX, frag_index.to_string().parse().unwrap());
                    h.insert(HEADER_EC_ETAG, obj_hash.parse().unwrap());
                    h
                });
            }
            form = form.part(obj_hash.clone(), part);
            sent_hashes.insert(obj_hash);
        }

        if sent_hashes.is_empty() {
            return Ok((false, AvailableMap::new()));
        }

        let response = self
            .client
            .request(reqwest::Method::from_bytes(b"SSYNC").unwrap(), &url)
            .header(HEADER_BACKEND_TIMESTAMP, "")
            .multipart(form)
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    PeerSyncError::Timeout { peer: label.clone(), timeout_secs: self.timeout.as_secs() }
                } else {
                    PeerSyncError::Unreachable { peer: label.clone(), source }
                }
            })?;

        if !response.status().is_success() {
            return Err(PeerSyncError::Rejected { peer: label, status: response.status().as_u16() });
        }

        let bytes = response.bytes().await.map_err(|source| PeerSyncError::Unreachable { peer: label.clone(), source })?;
        let ack: SsyncAck = serde_json::from_slice(&bytes).map_err(|source| PeerSyncError::MalformedBody { peer: label, source })?;

        let mut available = AvailableMap::new();
        for hash in &ack.acked {
            available.insert(hash.clone(), common::wire::ObjectTimestamps::tombstone("0000000000.00000"));
        }

        Ok((!ack.acked.is_empty(), available))
    }
}
