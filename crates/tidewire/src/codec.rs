//! # Payload Codecs
//!
//! The framing layer treats payloads as opaque bytes. Codecs turn values into
//! those bytes and back; the header's serialization byte says which one
//! produced a given payload.
//!
//! JSON and MessagePack are built in and reached directly through
//! `Serialization::encode` / `decode`. Any other byte is served by a `Codec`
//! registered in a `Registry`, which exchanges values with the codec as
//! `serde_json::Value` trees.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// A payload format that can be registered under a serialization byte.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON via `serde_json`.
pub struct JsonCodec;

impl JsonCodec {
    pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Self::to_vec(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Self::from_slice(bytes)
    }
}

/// MessagePack via `rmp-serde`, structs encoded as maps.
pub struct MsgPackCodec;

impl MsgPackCodec {
    pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

impl Codec for MsgPackCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Self::to_vec(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Self::from_slice(bytes)
    }
}

/// The serialization byte of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serialization(pub u8);

impl Serialization {
    pub const JSON: Self = Self(0);
    pub const MSGPACK: Self = Self(1);

    pub fn is_builtin(self) -> bool {
        matches!(self, Self::JSON | Self::MSGPACK)
    }

    /// Encodes with a built-in codec. Other kinds need a `Registry`.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::JSON => JsonCodec::to_vec(value),
            Self::MSGPACK => MsgPackCodec::to_vec(value),
            Self(other) => Err(Error::UnknownSerialization(other)),
        }
    }

    /// Decodes with a built-in codec. Other kinds need a `Registry`.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::JSON => JsonCodec::from_slice(bytes),
            Self::MSGPACK => MsgPackCodec::from_slice(bytes),
            Self(other) => Err(Error::UnknownSerialization(other)),
        }
    }
}

impl Default for Serialization {
    fn default() -> Self {
        Self::MSGPACK
    }
}
