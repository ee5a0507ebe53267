//! Diff envelope stored under `diff:<id>` in the shared map
//!
//! Small diffs are carried as plain JSON. Diffs whose JSON form exceeds the
//! compression threshold are MessagePack-encoded, gzipped and base64-encoded
//! so they stay a single string value.

use crate::error::{ProtocolError, ProtocolResult};
use base64::prelude::*;
use dsync_core::DocumentDiff;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::trace;

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Default payload size, in bytes, above which diffs are compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

/// Largest envelope or decompressed payload accepted (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// How the payload is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "msgpack+gzip+base64")]
    Compressed,
}

/// Wire wrapper around one `DocumentDiff`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEnvelope {
    #[serde(rename = "v")]
    pub version: u8,
    pub id: String,
    pub client_id: String,
    pub timestamp: u64,
    pub encoding: Encoding,
    pub payload: serde_json::Value,
}

impl DiffEnvelope {
    /// Wrap `diff`, compressing when its JSON is larger than `compression_threshold`.
    /// A threshold of zero disables compression.
    pub fn seal(diff: &DocumentDiff, compression_threshold: usize) -> ProtocolResult<Self> {
        let json = serde_json::to_value(diff)?;
        let size = serde_json::to_vec(&json)?.len();

        let (encoding, payload) = if compression_threshold > 0 && size > compression_threshold {
            let packed = rmp_serde::to_vec_named(diff)?;
            let mut encoder = GzEncoder::new(Vec::with_capacity(packed.len() / 2), Compression::default());
            encoder.write_all(&packed)?;
            let compressed = encoder.finish()?;
            trace!(diff_id = %diff.id, json = size, compressed = compressed.len(), "Compressed diff");
            (Encoding::Compressed, serde_json::Value::String(BASE64_STANDARD.encode(compressed)))
        } else {
            (Encoding::Json, json)
        };

        Ok(Self {
            version: ENVELOPE_VERSION,
            id: diff.id.clone(),
            client_id: diff.client_id.clone(),
            timestamp: diff.timestamp,
            encoding,
            payload,
        })
    }

    /// Recover the diff carried by this envelope
    pub fn open(&self) -> ProtocolResult<DocumentDiff> {
        if self.version != ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }

        let diff: DocumentDiff = match self.encoding {
            Encoding::Json => serde_json::from_value(self.payload.clone())?,
            Encoding::Compressed => {
                let text = self
                    .payload
                    .as_str()
                    .ok_or_else(|| ProtocolError::InvalidEnvelope("compressed payload is not a string".into()))?;
                let compressed = BASE64_STANDARD.decode(text)?;
                let mut packed = Vec::new();
                GzDecoder::new(compressed.as_slice())
                    .take(MAX_PAYLOAD_SIZE as u64 + 1)
                    .read_to_end(&mut packed)?;
                if packed.len() > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::MessageTooLarge {
                        size: packed.len(),
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                rmp_serde::from_slice(&packed)?
            }
        };

        if diff.id != self.id {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "envelope id {} does not match diff id {}",
                self.id, diff.id
            )));
        }
        Ok(diff)
    }

    /// Serialise for storage as a shared-map string value
    pub fn to_wire(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(text: &str) -> ProtocolResult<Self> {
        if text.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_compressed(&self) -> bool {
        self.encoding == Encoding::Compressed
    }
}

/// Seal and serialise in one step
pub fn encode_diff(diff: &DocumentDiff, compression_threshold: usize) -> ProtocolResult<String> {
    DiffEnvelope::seal(diff, compression_threshold)?.to_wire()
}

/// Parse and open in one step
pub fn decode_diff(text: &str) -> ProtocolResult<DocumentDiff> {
    DiffEnvelope::from_wire(text)?.open()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsync_core::{Change, ElementData, ModifiedElement, Point, Size};

    fn sample(shapes: usize) -> DocumentDiff {
        let mut diff = DocumentDiff::new("client-a", 3, 4);
        diff.added = (0..shapes)
            .map(|i| {
                ElementData::shape(format!("s{}", i), "Task", Point::new(i as f64, 0.0), Size::new(100.0, 80.0))
                    .with_property("name", format!("Task {}", i))
            })
            .collect();
        diff.modified.push(ModifiedElement {
            id: "m1".into(),
            changes: vec![Change::Position {
                old: Point::new(0.0, 0.0),
                new: Point::new(20.0, 20.0),
                delta: Point::new(20.0, 20.0),
            }],
            current: ElementData::shape("m1", "Task", Point::new(20.0, 20.0), Size::new(10.0, 10.0)),
        });
        diff.removed.push("gone".into());
        diff.refresh_statistics(&Default::default());
        diff
    }

    #[test]
    fn test_small_diff_stays_json() {
        let diff = sample(1);
        let envelope = DiffEnvelope::seal(&diff, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert_eq!(envelope.encoding, Encoding::Json);
        assert_eq!(envelope.payload["clientId"], "client-a");

        let back = decode_diff(&envelope.to_wire().unwrap()).unwrap();
        assert_eq!(back, diff);
    }

    #[test]
    fn test_large_diff_is_compressed() {
        let diff = sample(200);
        let wire = encode_diff(&diff, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        let envelope = DiffEnvelope::from_wire(&wire).unwrap();
        assert!(envelope.is_compressed());
        assert!(wire.len() < serde_json::to_string(&diff).unwrap().len());

        let back = envelope.open().unwrap();
        assert_eq!(back.added.len(), 200);
        assert_eq!(back.modified, diff.modified);
        assert_eq!(back.removed, diff.removed);
    }

    #[test]
    fn test_zero_threshold_disables_compression() {
        let envelope = DiffEnvelope::seal(&sample(200), 0).unwrap();
        assert_eq!(envelope.encoding, Encoding::Json);
    }

    #[test]
    fn test_rejects_mismatched_or_unknown_envelopes() {
        let mut envelope = DiffEnvelope::seal(&sample(1), 0).unwrap();
        envelope.id = "other".into();
        assert!(matches!(envelope.open(), Err(ProtocolError::InvalidEnvelope(_))));

        envelope.version = 9;
        assert!(matches!(envelope.open(), Err(ProtocolError::UnsupportedVersion(9))));

        assert!(decode_diff("not json").is_err());
    }
}
