//! Names and shapes of the peer control-channel wire surface (§6).
//! Bit-for-bit compatible with the existing object-server HTTP dialect:
//! these are the literal header names peers exchange, not a
//! reinterpretation of them.

use serde::{Deserialize, Serialize};

pub const HEADER_EC_ETAG: &str = "X-Object-Sysmeta-Ec-Etag";
pub const HEADER_EC_FRAG_INDEX: &str = "X-Object-Sysmeta-Ec-Frag-Index";
pub const HEADER_BACKEND_TIMESTAMP: &str = "X-Backend-Timestamp";
pub const HEADER_FRAGMENT_PREFERENCES: &str = "X-Backend-Fragment-Preferences";

/// One entry of the `X-Backend-Fragment-Preferences` JSON body sent
/// with a fragment GET: prefer fragments at `timestamp`, excluding any
/// fragment index already attempted and rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentPreference {
    pub timestamp: String,
    #[serde(default)]
    pub exclude: Vec<u16>,
}

/// Per-object timestamp tuple as returned in a peer sync's available
/// map (§3, "Available map").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTimestamps {
    pub ts_data: String,
    #[serde(default)]
    pub ts_meta: Option<String>,
    #[serde(default)]
    pub ts_ctype: Option<String>,
}

impl ObjectTimestamps {
    /// An available-map entry with no fragment (a tombstone) carries
    /// only `ts_data`, the deletion timestamp.
    pub fn tombstone(ts: impl Into<String>) -> Self {
        Self {
            ts_data: ts.into(),
            ts_meta: None,
            ts_ctype: None,
        }
    }
}
