//! Outgoing records.
//!
//! The uploader treats a record's payload as opaque bytes. Whatever produces
//! records only has to supply an identifier and an encoding.

use crate::error::UploadError;
use bytes::Bytes;
use serde::Serialize;

/// A record the uploader can place into a payload.
pub trait OutgoingRecord {
    /// Identifier echoed back by the server in `success` / `failed`.
    fn id(&self) -> &str;

    /// Encoded record, exactly as it will appear inside the request body array.
    fn encode(&self) -> Result<Bytes, UploadError>;
}

/// A record whose bytes are already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub id: String,
    pub bytes: Bytes,
}

impl EncodedRecord {
    pub fn new(id: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            bytes: bytes.into(),
        }
    }

    /// Serialize `value` as JSON and wrap it with `id`.
    pub fn from_json<T: Serialize + ?Sized>(
        id: impl Into<String>,
        value: &T,
    ) -> Result<Self, UploadError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| UploadError::Encoding(e.to_string()))?;
        Ok(Self::new(id, bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl OutgoingRecord for EncodedRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn encode(&self) -> Result<Bytes, UploadError> {
        Ok(self.bytes.clone())
    }
}

/// JSON objects carrying their own `"id"` string field.
impl OutgoingRecord for serde_json::Value {
    fn id(&self) -> &str {
        self.get("id").and_then(|v| v.as_str()).unwrap_or("")
    }

    fn encode(&self) -> Result<Bytes, UploadError> {
        if !self.is_object() {
            return Err(UploadError::Encoding("record is not a JSON object".into()));
        }
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| UploadError::Encoding(e.to_string()))
    }
}
