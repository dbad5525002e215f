//! Payload codec.
//!
//! The bus treats serialization as an opaque `pack`/`unpack` pair. Any
//! implementation must round-trip every value it accepts; the encoding
//! itself does not need to be canonical.
//!
//! [`MsgPackCodec`] is the default and matches the MessagePack payloads
//! other processes on the same broker publish. [`JsonCodec`] is available
//! for readable payloads when every peer uses it.

use crate::error::{EventBusError, EventBusResult};
use serde_json::Value;

/// Value packed when `emit` is called without data.
///
/// Keeps "no payload" distinguishable from an explicit empty payload on the
/// wire and arrives at listeners as a truthy marker.
pub const NO_DATA_SENTINEL: i64 = 1;

/// Payload used for an emit without data.
pub fn no_data() -> Value {
    Value::from(NO_DATA_SENTINEL)
}

/// Serialize/deserialize pair used for wire payloads.
pub trait Codec: Send + Sync {
    /// Encode a value to bytes.
    fn pack(&self, value: &Value) -> EventBusResult<Vec<u8>>;

    /// Decode bytes produced by `pack`.
    fn unpack(&self, bytes: &[u8]) -> EventBusResult<Value>;

    /// Codec name, for logs.
    fn name(&self) -> &str;
}

/// Options for [`MsgPackCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodecOptions {
    /// Reject payloads larger than this many bytes, packed or received
    pub max_payload: Option<usize>,
}

/// MessagePack codec backed by `rmp-serde`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec {
    options: MsgPackCodecOptions,
}

impl MsgPackCodec {
    /// Create a codec with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with the given options.
    pub fn with_options(options: MsgPackCodecOptions) -> Self {
        Self { options }
    }

    fn check_size(&self, len: usize) -> EventBusResult<()> {
        match self.options.max_payload {
            Some(max) if len > max => Err(EventBusError::Codec(format!(
                "payload of {} bytes exceeds limit of {}",
                len, max
            ))),
            _ => Ok(()),
        }
    }
}

impl Codec for MsgPackCodec {
    fn pack(&self, value: &Value) -> EventBusResult<Vec<u8>> {
        let bytes = rmp_serde::to_vec(value).map_err(|e| EventBusError::Codec(e.to_string()))?;
        self.check_size(bytes.len())?;
        Ok(bytes)
    }

    fn unpack(&self, bytes: &[u8]) -> EventBusResult<Value> {
        self.check_size(bytes.len())?;
        rmp_serde::from_slice(bytes).map_err(|e| {
            EventBusError::Codec(format!("invalid payload ({} bytes): {}", bytes.len(), e))
        })
    }

    fn name(&self) -> &str {
        "msgpack"
    }
}

/// Options forwarded to [`JsonCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodecOptions {
    /// Pretty-print packed payloads
    pub pretty: bool,
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    options: JsonCodecOptions,
}

impl JsonCodec {
    /// Create a codec with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with the given options.
    pub fn with_options(options: JsonCodecOptions) -> Self {
        Self { options }
    }
}

impl Codec for JsonCodec {
    fn pack(&self, value: &Value) -> EventBusResult<Vec<u8>> {
        let bytes = if self.options.pretty {
            serde_json::to_vec_pretty(value)?
        } else {
            serde_json::to_vec(value)?
        };
        Ok(bytes)
    }

    fn unpack(&self, bytes: &[u8]) -> EventBusResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            EventBusError::Codec(format!("invalid payload ({} bytes): {}", bytes.len(), e))
        })
    }

    fn name(&self) -> &str {
        "json"
    }
}
