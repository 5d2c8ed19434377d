//! Manifest entries and the rules for combining them.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label mapping attached to every manifest. The `type` key is mandatory
/// and must be non-empty; all other labels are free-form.
pub type Labels = BTreeMap<String, String>;

pub(crate) const TYPE_LABEL: &str = "type";

/// Unique manifest handle: 16 cryptographically random bytes rendered as 32
/// lowercase hex characters. Stable for the lifetime of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn generate() -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(hex::encode(raw))
    }

    /// Parses an id previously produced by [`generate`](Self::generate).
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() == 32 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::InvalidArgument(format!("malformed manifest id {s:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The atomic persisted unit: one manifest plus its metadata and tombstone
/// flag. Entries round-trip through the block format byte-exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: EntryId,
    pub mod_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(
        with = "content_base64",
        default,
        skip_serializing_if = "Bytes::is_empty"
    )]
    pub content: Bytes,
}

impl ManifestEntry {
    /// Deletion marker: suppresses any earlier entry with the same id once
    /// it wins the merge.
    pub fn tombstone(id: EntryId, mod_time: DateTime<Utc>) -> Self {
        Self {
            id,
            mod_time,
            labels: Labels::new(),
            deleted: true,
            content: Bytes::new(),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Payload bytes travel inside the JSON document as standard base64.
mod content_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let raw = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(raw))
    }
}

/// Read-only projection of an entry: identity, labels, and payload length,
/// never the payload itself. Always a deep copy of the live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub id: EntryId,
    pub mod_time: DateTime<Utc>,
    pub labels: Labels,
    pub length: usize,
}

impl From<&ManifestEntry> for EntryMetadata {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            id: entry.id.clone(),
            mod_time: entry.mod_time,
            labels: entry.labels.clone(),
            length: entry.content.len(),
        }
    }
}

/// True when every key/value pair of `query` is present in `labels`. The
/// empty query matches everything.
pub(crate) fn labels_match(labels: &Labels, query: &Labels) -> bool {
    query.iter().all(|(key, value)| labels.get(key) == Some(value))
}

/// Merge rule used wherever entries are combined: a strictly newer
/// modification time wins, ties keep the incumbent, and polarity (live vs
/// tombstone) plays no part.
pub(crate) fn merge_entry(
    entries: &mut HashMap<EntryId, Arc<ManifestEntry>>,
    entry: Arc<ManifestEntry>,
) {
    match entries.entry(entry.id.clone()) {
        MapEntry::Vacant(slot) => {
            slot.insert(entry);
        }
        MapEntry::Occupied(mut slot) => {
            if entry.mod_time > slot.get().mod_time {
                slot.insert(entry);
            }
        }
    }
}
