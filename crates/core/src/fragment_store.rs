//! Local fragment archive manager (C2, §4.2).
//!
//! On-disk layout, one policy's data directory per device:
//! `devices/<device>/objects-<policy_index>/<partition>/<suffix>/<hash>/<file>`
//! where `<file>` is either `<timestamp>#<frag_index>#<durable>.data` (a
//! fragment archive) or `<timestamp>.ts` (a tombstone). Suffix-hash
//! manifests persist to `<partition>/<hashes_file_name>`; suffixes
//! written since the last scan are recorded in `<partition>/hashes.invalid`
//! (one suffix per line) the way Swift's object-server invalidates the
//! hash cache on every write, so `get_suffix_hashes` knows what to
//! recompute without the caller tracking it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::SuffixKey;
use sha2::{Digest, Sha256};

use crate::job::AvailableMap;

pub type SuffixManifest = BTreeMap<String, BTreeMap<SuffixKey, String>>;

#[derive(Debug, thiserror::Error)]
pub enum FragmentStoreError {
    #[error("failed to create data directory {path}: {source}")]
    Mkdir { path: PathBuf, source: std::io::Error },
    #[error("i/o error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to (de)serialize hashes file {path}: {source}")]
    Serde { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectEntry {
    Fragment { frag_index: u16, durable: bool },
    Tombstone,
}

#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Partition ids under `device`'s data directory for `policy_index`.
    /// Ignores ancillary status files and non-directory/non-integer
    /// entries; a corrupt (file-not-directory) entry is removed with a
    /// warning (B1).
    async fn list_partitions(
        &self,
        device: &str,
        policy_index: u32,
    ) -> Result<Vec<u64>, FragmentStoreError>;

    async fn get_suffix_hashes(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        recalc: &HashSet<String>,
    ) -> Result<SuffixManifest, FragmentStoreError>;

    async fn yield_hashes(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        suffixes: Option<&[String]>,
        frag_index: Option<u16>,
    ) -> Result<Vec<(PathBuf, String, ObjectEntry, String)>, FragmentStoreError>;

    /// Deletes every local fragment whose object hash appears in
    /// `available_map` and whose on-disk fragment index equals
    /// `frag_index` (or, for tombstones, unconditionally).
    async fn delete_objects(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        available_map: &AvailableMap,
        frag_index: Option<u16>,
    ) -> Result<usize, FragmentStoreError>;

    async fn cleanup_tmp(&self, device: &str, reclaim_age_secs: u64) -> Result<(), FragmentStoreError>;

    /// Persists a fragment archive rebuilt via erasure decode (§4.8/§4.9
    /// Rebuilder hook) and invalidates its suffix so the next
    /// `get_suffix_hashes` picks it up.
    async fn write_rebuilt_fragment(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        suffix: &str,
        obj_hash: &str,
        timestamp: &str,
        frag_index: u16,
        body: &[u8],
    ) -> Result<(), FragmentStoreError>;

    /// True once `partition`'s directory holds no suffix subdirectories,
    /// i.e. every fragment and tombstone in it has already been synced
    /// or reverted away (I5).
    async fn partition_is_empty(&self, device: &str, policy_index: u32, partition: u64) -> Result<bool, FragmentStoreError>;

    /// Removes a partition directory outright. Callers only invoke this
    /// for partitions `partition_is_empty` confirmed empty one pass
    /// earlier (I5: never in the same pass that emptied it).
    async fn remove_partition_dir(&self, device: &str, policy_index: u32, partition: u64) -> Result<(), FragmentStoreError>;

    fn partition_path(&self, device: &str, policy_index: u32, partition: u64) -> PathBuf;
}

pub struct LocalFragmentStore {
    devices_root: PathBuf,
    hashes_file_name: String,
}

impl LocalFragmentStore {
    pub fn new(devices_root: PathBuf, hashes_file_name: impl Into<String>) -> Self {
        Self { devices_root, hashes_file_name: hashes_file_name.into() }
    }

    fn data_dir(&self, device: &str, policy_index: u32) -> PathBuf {
        self.devices_root.join(device).join(format!("objects-{policy_index}"))
    }

    pub async fn ensure_data_dir(&self, device: &str, policy_index: u32) -> Result<PathBuf, FragmentStoreError> {
        let dir = self.data_dir(device, policy_index);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| FragmentStoreError::Mkdir { path: dir.clone(), source })?;
        Ok(dir)
    }

    fn hashes_path(&self, part_path: &Path) -> PathBuf {
        part_path.join(&self.hashes_file_name)
    }

    fn invalid_path(&self, part_path: &Path) -> PathBuf {
        part_path.join("hashes.invalid")
    }

    async fn load_manifest(&self, part_path: &Path) -> SuffixManifest {
        let path = self.hashes_path(part_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => SuffixManifest::default(),
        }
    }

    async fn save_manifest(&self, part_path: &Path, manifest: &SuffixManifest) -> Result<(), FragmentStoreError> {
        let path = self.hashes_path(part_path);
        let bytes =
            serde_json::to_vec_pretty(manifest).map_err(|source| FragmentStoreError::Serde { path: path.clone(), source })?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| FragmentStoreError::Io { path, source })
    }

    async fn take_invalidated_suffixes(&self, part_path: &Path) -> HashSet<String> {
        let path = self.invalid_path(part_path);
        let suffixes = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect(),
            Err(_) => HashSet::new(),
        };
        let _ = tokio::fs::remove_file(&path).await;
        suffixes
    }

    /// Records that `suffix` changed on disk so the next
    /// `get_suffix_hashes` recomputes it, mirroring Swift's
    /// `hashes.invalid` append-only log.
    pub async fn invalidate_suffix(&self, part_path: &Path, suffix: &str) {
        let path = self.invalid_path(part_path);
        use tokio::io::AsyncWriteExt;
        if let Ok(mut f) = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
            let _ = f.write_all(format!("{suffix}\n").as_bytes()).await;
        }
    }

    fn list_suffix_dirs(part_path: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(part_path) else { return Vec::new() };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }

    /// Parses one filename into an `ObjectEntry`, or `None` if it's not
    /// a recognized fragment/tombstone file.
    fn parse_filename(name: &str) -> Option<ObjectEntry> {
        if let Some(ts) = name.strip_suffix(".ts") {
            let _ = ts;
            return Some(ObjectEntry::Tombstone);
        }
        let body = name.strip_suffix(".data")?;
        let mut parts = body.split('#');
        let _timestamp = parts.next()?;
        let frag_index: u16 = parts.next()?.parse().ok()?;
        let durable = parts.next() == Some("d");
        Some(ObjectEntry::Fragment { frag_index, durable })
    }

    fn timestamp_of(name: &str) -> String {
        name.split(['#', '.']).next().unwrap_or(name).to_string()
    }

    fn scan_suffix(part_path: &Path, suffix: &str) -> BTreeMap<SuffixKey, String> {
        let suffix_dir = part_path.join(suffix);
        let mut by_key: BTreeMap<SuffixKey, Vec<String>> = BTreeMap::new();
        let Ok(hash_dirs) = std::fs::read_dir(&suffix_dir) else { return BTreeMap::new() };
        for hash_dir in hash_dirs.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()) {
            let Ok(obj_hash) = hash_dir.file_name().into_string() else { continue };
            let Ok(files) = std::fs::read_dir(hash_dir.path()) else { continue };
            for file in files.filter_map(|e| e.ok()) {
                let Ok(name) = file.file_name().into_string() else { continue };
                let Some(entry) = Self::parse_filename(&name) else { continue };
                let ts = Self::timestamp_of(&name);
                let key = match entry {
                    ObjectEntry::Fragment { frag_index, .. } => SuffixKey::FragIndex(frag_index),
                    ObjectEntry::Tombstone => SuffixKey::Durable,
                };
                by_key.entry(key).or_default().push(format!("{obj_hash}:{ts}"));
            }
        }
        by_key
            .into_iter()
            .map(|(key, mut entries)| {
                entries.sort();
                let mut hasher = Sha256::new();
                for e in &entries {
                    hasher.update(e.as_bytes());
                    hasher.update(b"\n");
                }
                (key, hex::encode(hasher.finalize()))
            })
            .collect()
    }
}

#[async_trait]
impl FragmentStore for LocalFragmentStore {
    async fn list_partitions(&self, device: &str, policy_index: u32) -> Result<Vec<u64>, FragmentStoreError> {
        let dir = self.ensure_data_dir(device, policy_index).await?;
        let Ok(entries) = std::fs::read_dir(&dir) else { return Ok(Vec::new()) };
        let mut partitions = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("auditor_status_") {
                continue;
            }
            let Ok(partition) = name.parse::<u64>() else { continue };
            let path = entry.path();
            if path.is_dir() {
                partitions.push(partition);
            } else {
                tracing::warn!(path = %path.display(), "removing corrupt partition entry (not a directory)");
                let _ = std::fs::remove_file(&path);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn get_suffix_hashes(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        recalc: &HashSet<String>,
    ) -> Result<SuffixManifest, FragmentStoreError> {
        let part_path = self.partition_path(device, policy_index, partition);
        tokio::fs::create_dir_all(&part_path)
            .await
            .map_err(|source| FragmentStoreError::Mkdir { path: part_path.clone(), source })?;

        let mut manifest = self.load_manifest(&part_path).await;
        let invalidated = self.take_invalidated_suffixes(&part_path).await;
        let on_disk: HashSet<String> = Self::list_suffix_dirs(&part_path).into_iter().collect();

        let mut to_scan: HashSet<String> = recalc.clone();
        to_scan.extend(invalidated);
        for suffix in &on_disk {
            if !manifest.contains_key(suffix) {
                to_scan.insert(suffix.clone());
            }
        }

        for suffix in &to_scan {
            if !on_disk.contains(suffix) {
                manifest.remove(suffix);
                continue;
            }
            let hashes = Self::scan_suffix(&part_path, suffix);
            if hashes.is_empty() {
                manifest.remove(suffix);
            } else {
                manifest.insert(suffix.clone(), hashes);
            }
        }
        manifest.retain(|suffix, _| on_disk.contains(suffix));

        self.save_manifest(&part_path, &manifest).await?;
        Ok(manifest)
    }

    async fn yield_hashes(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        suffixes: Option<&[String]>,
        frag_index: Option<u16>,
    ) -> Result<Vec<(PathBuf, String, ObjectEntry, String)>, FragmentStoreError> {
        let part_path = self.partition_path(device, policy_index, partition);
        let suffix_list: Vec<String> = match suffixes {
            Some(s) => s.to_vec(),
            None => Self::list_suffix_dirs(&part_path),
        };

        let mut out = Vec::new();
        for suffix in suffix_list {
            let suffix_dir = part_path.join(&suffix);
            let Ok(hash_dirs) = std::fs::read_dir(&suffix_dir) else { continue };
            for hash_dir in hash_dirs.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()) {
                let Ok(obj_hash) = hash_dir.file_name().into_string() else { continue };
                let Ok(files) = std::fs::read_dir(hash_dir.path()) else { continue };
                for file in files.filter_map(|e| e.ok()) {
                    let Ok(name) = file.file_name().into_string() else { continue };
                    let Some(entry) = Self::parse_filename(&name) else { continue };
                    if let (Some(want), ObjectEntry::Fragment { frag_index: have, .. }) = (frag_index, entry) {
                        if want != have {
                            continue;
                        }
                    }
                    out.push((file.path(), obj_hash.clone(), entry, suffix.clone()));
                }
            }
        }
        Ok(out)
    }

    async fn delete_objects(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        available_map: &AvailableMap,
        frag_index: Option<u16>,
    ) -> Result<usize, FragmentStoreError> {
        let part_path = self.partition_path(device, policy_index, partition);
        let entries = self.yield_hashes(device, partition, policy_index, None, None).await?;
        let mut deleted = 0usize;
        let mut touched_suffixes: HashSet<String> = HashSet::new();
        for (path, obj_hash, entry, suffix) in entries {
            if !available_map.contains_key(&obj_hash) {
                continue;
            }
            let should_delete = match entry {
                ObjectEntry::Tombstone => true,
                ObjectEntry::Fragment { frag_index: have, .. } => frag_index.map_or(true, |want| want == have),
            };
            if should_delete {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    deleted += 1;
                    touched_suffixes.insert(suffix);
                    let _ = tokio::fs::remove_dir(path.parent().unwrap()).await;
                }
            }
        }
        for suffix in touched_suffixes {
            self.invalidate_suffix(&part_path, &suffix).await;
        }
        Ok(deleted)
    }

    async fn cleanup_tmp(&self, device: &str, reclaim_age_secs: u64) -> Result<(), FragmentStoreError> {
        let tmp_dir = self.devices_root.join(device).join("tmp");
        let Ok(entries) = std::fs::read_dir(&tmp_dir) else { return Ok(()) };
        let now = std::time::SystemTime::now();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    let age = now.duration_since(modified).unwrap_or_default();
                    if age.as_secs() >= reclaim_age_secs {
                        if meta.is_dir() {
                            let _ = tokio::fs::remove_dir_all(&path).await;
                        } else {
                            let _ = tokio::fs::remove_file(&path).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn write_rebuilt_fragment(
        &self,
        device: &str,
        partition: u64,
        policy_index: u32,
        suffix: &str,
        obj_hash: &str,
        timestamp: &str,
        frag_index: u16,
        body: &[u8],
    ) -> Result<(), FragmentStoreError> {
        let part_path = self.partition_path(device, policy_index, partition);
        let dir = part_path.join(suffix).join(obj_hash);
        tokio::fs::create_dir_all(&dir).await.map_err(|source| FragmentStoreError::Mkdir { path: dir.clone(), source })?;
        let path = dir.join(format!("{timestamp}#{frag_index}#d.data"));
        tokio::fs::write(&path, body).await.map_err(|source| FragmentStoreError::Io { path, source })?;
        self.invalidate_suffix(&part_path, suffix).await;
        Ok(())
    }

    async fn partition_is_empty(&self, device: &str, policy_index: u32, partition: u64) -> Result<bool, FragmentStoreError> {
        let part_path = self.partition_path(device, policy_index, partition);
        Ok(Self::list_suffix_dirs(&part_path).is_empty())
    }

    async fn remove_partition_dir(&self, device: &str, policy_index: u32, partition: u64) -> Result<(), FragmentStoreError> {
        let part_path = self.partition_path(device, policy_index, partition);
        match tokio::fs::remove_dir_all(&part_path).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FragmentStoreError::Io { path: part_path, source }),
        }
    }

    fn partition_path(&self, device: &str, policy_index: u32, partition: u64) -> PathBuf {
        self.data_dir(device, policy_index).join(partition.to_string())
    }
}
