//! Snapshot codec: canonical JSON, SHA-256 checksum, gzip.
//!
//! The checksum is computed over the canonical rendering of the snapshot with
//! its `checksum` field blanked, then embedded. Decoding recomputes it and
//! rejects any mismatch; this is the only integrity gate for stored data.

use crate::manifest::BackupReason;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

pub const SCHEMA_VERSION: u32 = 1;

const CHECKSUM_FIELD: &str = "checksum";

/// Serialized payload of one scope at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub app_version: String,
    pub created_at: DateTime<Utc>,
    pub scope_key: String,
    pub reason: BackupReason,
    #[serde(default)]
    pub checksum: String,
    /// Opaque session content; `null` for global-scope snapshots
    pub session: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<Value>,
}

/// Compressed blob plus the checksum embedded in it.
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    pub bytes: Vec<u8>,
    pub checksum: String,
}

pub fn serialize(snapshot: &SessionSnapshot) -> Result<EncodedSnapshot> {
    let mut value = serde_json::to_value(snapshot)?;
    let checksum = checksum_with_blank_field(&mut value)?;
    value[CHECKSUM_FIELD] = Value::String(checksum.clone());

    let rendered = canonical_string(&value);
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(rendered.len() / 2),
        Compression::default(),
    );
    encoder.write_all(rendered.as_bytes())?;
    let bytes = encoder.finish()?;

    Ok(EncodedSnapshot { bytes, checksum })
}

/// Decompress, parse and verify a blob. Every decoding failure is reported
/// as `Integrity`.
pub fn deserialize(bytes: &[u8]) -> Result<SessionSnapshot> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(|e| BackupError::Integrity(format!("decompression failed: {e}")))?;

    let mut value: Value = serde_json::from_slice(&json)
        .map_err(|e| BackupError::Integrity(format!("payload is not valid JSON: {e}")))?;

    let embedded = match value.get(CHECKSUM_FIELD) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(BackupError::Integrity("embedded checksum missing".to_string())),
    };

    let actual = checksum_with_blank_field(&mut value)?;
    if actual != embedded {
        return Err(BackupError::Integrity(format!(
            "checksum mismatch: expected {embedded}, got {actual}"
        )));
    }
    value[CHECKSUM_FIELD] = Value::String(embedded);

    serde_json::from_value(value)
        .map_err(|e| BackupError::Integrity(format!("payload does not match snapshot schema: {e}")))
}

/// Order-independent, case-sensitive digest of any serializable value.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(sha256_hex(canonical_string(&value).as_bytes()))
}

fn checksum_with_blank_field(value: &mut Value) -> Result<String> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| BackupError::Integrity("snapshot is not an object".to_string()))?;
    obj.insert(CHECKSUM_FIELD.to_string(), Value::String(String::new()));
    Ok(sha256_hex(canonical_string(value).as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compact JSON with object keys sorted bytewise at every depth.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Display on a scalar Value renders compact, escaped JSON.
    out.push_str(&value.to_string());
}
