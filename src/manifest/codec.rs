//! Persisted manifest block format.
//!
//! A block is a gzip stream over the JSON document `{"entries":[...]}`.
//! Readers also accept the bare document for blocks written before
//! compression, detected by a leading `{`. Writers always emit gzip.

use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::error::{Error, Result};
use crate::manifest::entry::ManifestEntry;

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    entries: Vec<ManifestEntry>,
}

pub(crate) fn encode(entries: &[Arc<ManifestEntry>]) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct DocumentRef<'a> {
        entries: Vec<&'a ManifestEntry>,
    }

    let document = DocumentRef {
        entries: entries.iter().map(Arc::as_ref).collect(),
    };

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, &document)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decode(id: &BlockId, data: &[u8]) -> Result<Vec<ManifestEntry>> {
    let document: Document = if data.first() == Some(&b'{') {
        serde_json::from_slice(data).map_err(|err| corrupted(id, err))?
    } else {
        let mut json = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut json)
            .map_err(|err| corrupted(id, err))?;
        serde_json::from_slice(&json).map_err(|err| corrupted(id, err))?
    };
    Ok(document.entries)
}

fn corrupted(id: &BlockId, err: impl std::fmt::Display) -> Error {
    Error::CorruptedBlock {
        id: id.clone(),
        reason: err.to_string(),
    }
}
