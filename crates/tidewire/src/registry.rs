//! # Capability Registry
//!
//! Maps the header's serialization and compression bytes to implementations.
//! The built-in kinds are always available; an entry registered for a byte
//! takes precedence over them. A registry is built before use and shared
//! read-only by both ends of a connection.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::codec::JsonCodec;
use crate::codec::MsgPackCodec;
use crate::codec::Serialization;
use crate::compress::Compression;
use crate::compress::Compressor;
use crate::error::Error;
use crate::error::Result;

#[derive(Clone, Default)]
pub struct Registry {
    codecs: HashMap<u8, Arc<dyn Codec>>,
    compressors: HashMap<u8, Arc<dyn Compressor>>,
}

impl Registry {
    /// A registry holding only the built-in kinds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(mut self, kind: Serialization, codec: impl Codec + 'static) -> Self {
        self.codecs.insert(kind.0, Arc::new(codec));
        self
    }

    pub fn with_compressor(mut self, kind: Compression, compressor: impl Compressor + 'static) -> Self {
        self.compressors.insert(kind.0, Arc::new(compressor));
        self
    }

    pub fn codec(&self, kind: Serialization) -> Result<&dyn Codec> {
        if let Some(codec) = self.codecs.get(&kind.0) {
            return Ok(codec.as_ref());
        }
        match kind {
            Serialization::JSON => Ok(&JsonCodec),
            Serialization::MSGPACK => Ok(&MsgPackCodec),
            Serialization(other) => Err(Error::UnknownSerialization(other)),
        }
    }

    /// An unknown compression byte is a malformed header.
    pub fn compressor(&self, kind: Compression) -> Result<&dyn Compressor> {
        match self.compressors.get(&kind.0) {
            Some(compressor) => Ok(compressor.as_ref()),
            None => kind.builtin().ok_or(Error::InvalidHeader { field: "compression", value: kind.0 }),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, kind: Serialization, value: &T) -> Result<Vec<u8>> {
        match self.codecs.get(&kind.0) {
            Some(codec) => {
                let value = serde_json::to_value(value).map_err(|e| Error::Encode(e.to_string()))?;
                codec.encode(&value)
            }
            None => kind.encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, kind: Serialization, bytes: &[u8]) -> Result<T> {
        match self.codecs.get(&kind.0) {
            Some(codec) => serde_json::from_value(codec.decode(bytes)?).map_err(|e| Error::Decode(e.to_string())),
            None => kind.decode(bytes),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codecs: Vec<_> = self.codecs.keys().collect();
        codecs.sort();
        let mut compressors: Vec<_> = self.compressors.keys().collect();
        compressors.sort();
        f.debug_struct("Registry")
            .field("codecs", &codecs)
            .field("compressors", &compressors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::Value;

    /// Newline-terminated JSON, standing in for a third-party format.
    struct LineCodec;

    impl Codec for LineCodec {
        fn encode(&self, value: &Value) -> Result<Vec<u8>> {
            let mut bytes = JsonCodec::to_vec(value)?;
            bytes.push(b'\n');
            Ok(bytes)
        }

        fn decode(&self, bytes: &[u8]) -> Result<Value> {
            let line = bytes.strip_suffix(b"\n").ok_or_else(|| Error::Decode("missing newline".into()))?;
            JsonCodec::from_slice(line)
        }
    }

    /// Reverses the payload.
    struct Mirror;

    impl Compressor for Mirror {
        fn zip(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().rev().copied().collect())
        }

        fn unzip(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
            if data.len() > limit {
                return Err(Error::FrameTooLarge { len: data.len(), max: limit });
            }
            self.zip(data)
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        label: String,
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::new();
        assert!(registry.codec(Serialization::JSON).is_ok());
        assert!(registry.codec(Serialization::MSGPACK).is_ok());
        assert!(registry.compressor(Compression::NONE).unwrap().is_identity());
        assert!(registry.compressor(Compression::GZIP).is_ok());

        let bytes = registry.encode(Serialization::MSGPACK, &7i64).unwrap();
        assert_eq!(bytes, Serialization::MSGPACK.encode(&7i64).unwrap());
    }

    #[test]
    fn test_unknown_kinds() {
        let registry = Registry::new();
        let err = registry.codec(Serialization(5)).err().unwrap();
        assert_eq!(err, Error::UnknownSerialization(5));
        assert!(!err.is_framing());

        let err = registry.compressor(Compression(5)).err().unwrap();
        assert_eq!(err, Error::InvalidHeader { field: "compression", value: 5 });
        assert!(err.is_framing());
    }

    #[test]
    fn test_registered_codec_serves_its_byte() {
        let lines = Serialization(7);
        let registry = Registry::new().with_codec(lines, LineCodec);

        let p = Point { x: 3, label: "tide".into() };
        let bytes = registry.encode(lines, &p).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        let back: Point = registry.decode(lines, &bytes).unwrap();
        assert_eq!(back, p);

        let err = registry.decode::<Point>(lines, b"{}").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_registered_entry_replaces_builtin() {
        let registry = Registry::new().with_codec(Serialization::JSON, LineCodec);
        assert_eq!(registry.encode(Serialization::JSON, &1i64).unwrap(), b"1\n");
    }

    #[test]
    fn test_registered_compressor_serves_its_byte() {
        let mirror = Compression(9);
        let registry = Registry::new().with_compressor(mirror, Mirror);
        let compressor = registry.compressor(mirror).unwrap();
        assert_eq!(compressor.zip(b"abc").unwrap(), b"cba");
        assert!(!compressor.is_identity());
        assert_eq!(format!("{:?}", registry), "Registry { codecs: [], compressors: [9] }");
    }
}
