use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::cmp::Ordering;
use std::str::FromStr;

/// A key in a suffix-hash submap: either a concrete fragment index, or
/// the durable-marker sentinel (the hash of the whole suffix's durable
/// set, used when no single fragment index applies).
///
/// `Durable` sorts before every `FragIndex` so manifests serialize and
/// compare deterministically regardless of insertion order. Serializes
/// as a plain string (`"durable"` or the decimal index) rather than a
/// tagged enum so it round-trips as a JSON *object key*, which is how
/// suffix-hash submaps are represented on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuffixKey {
    Durable,
    FragIndex(u16),
}

const DURABLE_TOKEN: &str = "durable";

impl FromStr for SuffixKey {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == DURABLE_TOKEN {
            Ok(SuffixKey::Durable)
        } else {
            Ok(SuffixKey::FragIndex(s.parse()?))
        }
    }
}

impl serde::Serialize for SuffixKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct SuffixKeyVisitor;

impl<'de> Visitor<'de> for SuffixKeyVisitor {
    type Value = SuffixKey;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("\"durable\" or a decimal fragment index")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|_| de::Error::custom(format!("invalid suffix key: {v}")))
    }
}

impl<'de> serde::Deserialize<'de> for SuffixKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(SuffixKeyVisitor)
    }
}

impl SuffixKey {
    pub fn frag_index(self) -> Option<u16> {
        match self {
            SuffixKey::FragIndex(i) => Some(i),
            SuffixKey::Durable => None,
        }
    }

    pub fn is_durable(self) -> bool {
        matches!(self, SuffixKey::Durable)
    }
}

impl PartialOrd for SuffixKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SuffixKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SuffixKey::Durable, SuffixKey::Durable) => Ordering::Equal,
            (SuffixKey::Durable, SuffixKey::FragIndex(_)) => Ordering::Less,
            (SuffixKey::FragIndex(_), SuffixKey::Durable) => Ordering::Greater,
            (SuffixKey::FragIndex(a), SuffixKey::FragIndex(b)) => a.cmp(b),
        }
    }
}

impl std::fmt::Display for SuffixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuffixKey::Durable => write!(f, "durable"),
            SuffixKey::FragIndex(i) => write!(f, "{i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_sorts_first() {
        let mut keys = vec![SuffixKey::FragIndex(2), SuffixKey::Durable, SuffixKey::FragIndex(0)];
        keys.sort();
        assert_eq!(
            keys,
            vec![SuffixKey::Durable, SuffixKey::FragIndex(0), SuffixKey::FragIndex(2)]
        );
    }

    #[test]
    fn json_round_trip() {
        let k = SuffixKey::FragIndex(4);
        let s = serde_json::to_string(&k).unwrap();
        let back: SuffixKey = serde_json::from_str(&s).unwrap();
        assert_eq!(k, back);
    }
}
