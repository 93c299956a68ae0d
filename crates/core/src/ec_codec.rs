//! Erasure-code backend (C3, §4.3). Wraps `reed-solomon-erasure` behind a
//! trait so the rebuilder never touches Galois-field arithmetic directly,
//! the same seam the teacher draws around its WASM engine in
//! `agent/src/engine.rs`.

use reed_solomon_erasure::galois_8::ReedSolomon;

#[derive(Debug, thiserror::Error)]
pub enum EcCodecError {
    #[error("not enough fragments to reconstruct: have {have}, need {need}")]
    Insufficient { have: usize, need: usize },
    #[error("fragment size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("reed-solomon backend error: {0}")]
    Backend(#[from] reed_solomon_erasure::Error),
    #[error("malformed fragment index header value {value:?}")]
    BadFragIndex { value: String },
}

/// Backend-agnostic erasure coding facts and reconstruction for one
/// storage policy's scheme.
pub trait EcCodec: Send + Sync {
    fn n_data(&self) -> usize;
    fn n_parity(&self) -> usize;

    /// Number of distinct backend fragment indices in the scheme
    /// (`n_data + n_parity`), before any duplication.
    fn n_unique_fragments(&self) -> usize {
        self.n_data() + self.n_parity()
    }

    fn duplication_factor(&self) -> usize;
    fn segment_size(&self) -> usize;

    /// Reconstructs every `None` slot in `fragments` in place, given at
    /// least `n_data` populated slots of equal length. `fragments` has
    /// exactly `n_unique_fragments()` entries, indexed by backend
    /// fragment index.
    fn reconstruct(&self, fragments: &mut [Option<Vec<u8>>]) -> Result<(), EcCodecError>;

    /// Parses an `X-Object-Sysmeta-Ec-Frag-Index` header value.
    fn parse_frag_index(&self, value: &str) -> Result<u16, EcCodecError> {
        value.trim().parse().map_err(|_| EcCodecError::BadFragIndex { value: value.to_string() })
    }
}

pub struct ReedSolomonCodec {
    n_data: usize,
    n_parity: usize,
    duplication_factor: usize,
    segment_size: usize,
    rs: ReedSolomon,
}

impl ReedSolomonCodec {
    pub fn new(
        n_data: usize,
        n_parity: usize,
        duplication_factor: usize,
        segment_size: usize,
    ) -> Result<Self, EcCodecError> {
        let rs = ReedSolomon::new(n_data, n_parity)?;
        Ok(Self { n_data, n_parity, duplication_factor, segment_size, rs })
    }
}

impl EcCodec for ReedSolomonCodec {
    fn n_data(&self) -> usize {
        self.n_data
    }

    fn n_parity(&self) -> usize {
        self.n_parity
    }

    fn duplication_factor(&self) -> usize {
        self.duplication_factor
    }

    fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn reconstruct(&self, fragments: &mut [Option<Vec<u8>>]) -> Result<(), EcCodecError> {
        let expected_len = self.n_unique_fragments();
        if fragments.len() != expected_len {
            return Err(EcCodecError::SizeMismatch { expected: expected_len, got: fragments.len() });
        }
        let present = fragments.iter().filter(|f| f.is_some()).count();
        if present < self.n_data {
            return Err(EcCodecError::Insufficient { have: present, need: self.n_data });
        }
        let shard_len = fragments
            .iter()
            .flatten()
            .map(|f| f.len())
            .next()
            .ok_or(EcCodecError::Insufficient { have: 0, need: self.n_data })?;
        for frag in fragments.iter().flatten() {
            if frag.len() != shard_len {
                return Err(EcCodecError::SizeMismatch { expected: shard_len, got: frag.len() });
            }
        }
        self.rs.reconstruct(fragments)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstructs_missing_shard_from_enough_survivors() {
        let codec = ReedSolomonCodec::new(4, 2, 1, 4096).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = (0..6u8).map(|i| Some(vec![i; 16])).collect();
        shards[1] = None;
        shards[5] = None;
        codec.reconstruct(&mut shards).unwrap();
        assert_eq!(shards[1].as_deref(), Some(vec![1u8; 16]).as_deref());
        assert_eq!(shards[5].as_deref(), Some(vec![5u8; 16]).as_deref());
    }

    #[test]
    fn rejects_reconstruction_with_too_few_fragments() {
        let codec = ReedSolomonCodec::new(4, 2, 1, 4096).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = vec![Some(vec![0u8; 16]), Some(vec![1u8; 16])];
        shards.resize(6, None);
        let err = codec.reconstruct(&mut shards).unwrap_err();
        assert!(matches!(err, EcCodecError::Insufficient { .. }));
    }

    #[test]
    fn parses_valid_frag_index_and_rejects_garbage() {
        let codec = ReedSolomonCodec::new(4, 2, 1, 4096).unwrap();
        assert_eq!(codec.parse_frag_index("3").unwrap(), 3);
        assert!(codec.parse_frag_index("not-a-number").is_err());
    }
}
