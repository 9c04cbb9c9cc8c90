//! Wire codecs.
//!
//! A [`Codec`] turns a typed value into envelope bytes and back. Two
//! encodings are provided:
//!
//! - [`JsonCodec`]: `serde_json`, used for gameplay messages.
//! - [`BinaryCodec`]: CBOR via `ciborium`. Self-describing and tagged, so it
//!   carries values JSON would need explicit formatting for (timestamps) and
//!   byte strings without base64.
//!
//! Codecs are pure; neither touches the transport.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{ContentType, PerilError, Result};

/// Encode/decode a payload type under one wire encoding.
pub trait Codec<T>: Send + Sync {
    /// Content type tag published alongside encoded bytes.
    fn content_type(&self) -> ContentType;

    /// Encode `value`. Fails with [`PerilError::Encode`].
    fn encode(&self, value: &T) -> Result<Bytes>;

    /// Decode `bytes`. Fails with [`PerilError::MalformedPayload`].
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn content_type(&self) -> ContentType {
        ContentType::Json
    }

    fn encode(&self, value: &T) -> Result<Bytes> {
        // ---
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| PerilError::Encode(format!("json: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        // ---
        serde_json::from_slice(bytes).map_err(|e| PerilError::MalformedPayload(format!("json: {e}")))
    }
}

/// Binary-tagged (CBOR) encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl<T> Codec<T> for BinaryCodec
where
    T: Serialize + DeserializeOwned,
{
    fn content_type(&self) -> ContentType {
        ContentType::Binary
    }

    fn encode(&self, value: &T) -> Result<Bytes> {
        // ---
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| PerilError::Encode(format!("cbor: {e}")))?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        // ---
        ciborium::from_reader(bytes).map_err(|e| PerilError::MalformedPayload(format!("cbor: {e}")))
    }
}
