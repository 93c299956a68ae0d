use serde::{Deserialize, Serialize};

/// Describes one erasure-coded storage policy: replica/fragment counts
/// and the hashes-file name `FragmentStore` persists manifests under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub policy_index: u32,
    pub name: String,
    /// Length of the primary device list for a partition under this
    /// policy (`RingView::primaries` length).
    pub replicas: usize,
    pub n_data: usize,
    pub n_parity: usize,
    /// Number of devices each unique fragment index is copied to.
    #[serde(default = "default_duplication_factor")]
    pub duplication_factor: usize,
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    #[serde(default = "default_hashes_file_name")]
    pub hashes_file_name: String,
}

fn default_duplication_factor() -> usize {
    1
}

fn default_segment_size() -> usize {
    1_048_576
}

fn default_hashes_file_name() -> String {
    "hashes.pkl".to_string()
}

impl StoragePolicy {
    pub fn n_unique_fragments(&self) -> usize {
        self.n_data + self.n_parity
    }

    /// Reduce a ring-level device index (`0..replicas`) to the backend
    /// fragment index (`0..n_unique_fragments`) it represents.
    pub fn get_backend_index(&self, ring_index: usize) -> u16 {
        (ring_index % self.n_unique_fragments().max(1)) as u16
    }

    pub fn is_consistent(&self) -> bool {
        self.duplication_factor >= 1
            && self.n_unique_fragments() * self.duplication_factor == self.replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StoragePolicy {
        StoragePolicy {
            policy_index: 0,
            name: "ec-10-4".into(),
            replicas: 14,
            n_data: 10,
            n_parity: 4,
            duplication_factor: 1,
            segment_size: 1_048_576,
            hashes_file_name: "hashes.pkl".into(),
        }
    }

    #[test]
    fn backend_index_wraps_with_duplication() {
        let mut p = policy();
        p.duplication_factor = 2;
        p.replicas = 28;
        assert_eq!(p.get_backend_index(0), 0);
        assert_eq!(p.get_backend_index(14), 0);
        assert_eq!(p.get_backend_index(15), 1);
    }

    #[test]
    fn consistency_check() {
        assert!(policy().is_consistent());
        let mut bad = policy();
        bad.replicas = 20;
        assert!(!bad.is_consistent());
    }
}
