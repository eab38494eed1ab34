//! Entry Codec
//!
//! Byte image of a cache entry as stored in the object table. The default
//! codec writes a length-prefixed JSON header followed by the value bytes,
//! optionally compressed.
//!
//! ```text
//! ┌──────────────┬─────────────────────┬─────────────────────┐
//! │ header len   │ JSON EntryImage     │ value payload       │
//! │ u32 (BE)     │                     │ (compressed or raw) │
//! └──────────────┴─────────────────────┴─────────────────────┘
//! ```

use crate::cache::compression::CompressionAlgorithm;
use crate::cache::entry::{CacheEntry, SharingPolicy};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Serialization collaborator; must be deterministic and reversible
pub trait EntryCodec: Send + Sync {
    fn serialize(&self, entry: &CacheEntry) -> Result<Bytes>;

    fn deserialize(&self, bytes: &[u8]) -> Result<CacheEntry>;
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryImage {
    id: String,
    aliases: Vec<String>,
    dependency_ids: Vec<String>,
    templates: Vec<String>,
    priority: u8,
    time_limit: i32,
    inactivity: i32,
    expiration_time: i64,
    validator_expiration_time: i64,
    created_at: i64,
    sharing_policy: SharingPolicy,
    #[serde(default)]
    skip_memory: bool,
    has_value: bool,
    compression: CompressionAlgorithm,
}

/// JSON header plus raw payload
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEntryCodec {
    compression: CompressionAlgorithm,
}

impl JsonEntryCodec {
    pub fn new(compression: CompressionAlgorithm) -> Self {
        Self { compression }
    }
}

impl EntryCodec for JsonEntryCodec {
    fn serialize(&self, entry: &CacheEntry) -> Result<Bytes> {
        let value = entry.value.as_ref().or(entry.serialized_value.as_ref());
        let (payload, compression) = match value {
            Some(value) => self.compression.compress(value),
            None => (Bytes::new(), CompressionAlgorithm::None),
        };
        let image = EntryImage {
            id: entry.id.clone(),
            aliases: entry.aliases.clone(),
            dependency_ids: entry.dependency_ids.clone(),
            templates: entry.templates.clone(),
            priority: entry.priority,
            time_limit: entry.time_limit,
            inactivity: entry.inactivity,
            expiration_time: entry.expiration_time,
            validator_expiration_time: entry.validator_expiration_time,
            created_at: entry.created_at,
            sharing_policy: entry.sharing_policy,
            skip_memory: entry.skip_memory_and_write_to_disk,
            has_value: value.is_some(),
            compression,
        };
        let header = serde_json::to_vec(&image).map_err(|e| Error::Serialization(e.to_string()))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::Serialization(format!("entry header too large for {}", entry.id)))?;

        let mut buf = BytesMut::with_capacity(4 + header.len() + payload.len());
        buf.put_u32(header_len);
        buf.put_slice(&header);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CacheEntry> {
        let mut buf = bytes;
        if buf.remaining() < 4 {
            return Err(Error::Serialization("truncated entry image".into()));
        }
        let header_len = buf.get_u32() as usize;
        if buf.remaining() < header_len {
            return Err(Error::Serialization("truncated entry header".into()));
        }
        let image: EntryImage =
            serde_json::from_slice(&buf[..header_len]).map_err(|e| Error::Serialization(e.to_string()))?;
        buf.advance(header_len);

        let value = if image.has_value {
            Some(image.compression.decompress(buf)?)
        } else {
            None
        };

        let mut entry = CacheEntry::new(image.id, Bytes::new());
        entry.value = value;
        entry.aliases = image.aliases;
        entry.dependency_ids = image.dependency_ids;
        entry.templates = image.templates;
        entry.priority = image.priority;
        entry.time_limit = image.time_limit;
        entry.inactivity = image.inactivity;
        entry.expiration_time = image.expiration_time;
        entry.validator_expiration_time = image.validator_expiration_time;
        entry.created_at = image.created_at;
        entry.sharing_policy = image.sharing_policy;
        entry.skip_memory_and_write_to_disk = image.skip_memory;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_preserves_metadata() {
        let codec = JsonEntryCodec::default();
        let mut entry = CacheEntry::new("page/1", "<html/>")
            .with_dependency("page")
            .with_template("/page.jsp")
            .with_alias("p1")
            .with_priority(5)
            .with_time_limit(30);
        entry.finalize_expiration(1_000);

        let bytes = codec.serialize(&entry).unwrap();
        let decoded = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded.id, "page/1");
        assert_eq!(decoded.aliases, vec!["p1"]);
        assert_eq!(decoded.templates, vec!["/page.jsp"]);
        assert_eq!(decoded.priority, 5);
        assert_eq!(decoded.expiration_time, 31_000);
        assert_eq!(decoded.value.as_deref(), Some(&b"<html/>"[..]));
    }

    #[test]
    fn test_compressed_payload() {
        let codec = JsonEntryCodec::new(CompressionAlgorithm::Zstd);
        let value = "fragment ".repeat(500);
        let entry = CacheEntry::new("big", value.clone());

        let bytes = codec.serialize(&entry).unwrap();
        assert!(bytes.len() < value.len());
        let decoded = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded.value.as_deref(), Some(value.as_bytes()));
    }

    #[test]
    fn test_truncated_image_rejected() {
        let codec = JsonEntryCodec::default();
        assert!(matches!(codec.deserialize(&[0, 0]), Err(Error::Serialization(_))));
        assert!(matches!(codec.deserialize(&[0, 0, 0, 9, b'{']), Err(Error::Serialization(_))));
    }
}
