//! # Frame Header
//!
//! The fixed 14-byte prefix of every frame. Accessors are byte-level views:
//!
//! ```text
//! byte 0      version
//! byte 1      message type (0 request, 1 response)
//! byte 2      heartbeat flag (0 / 1)
//! byte 3      compression kind
//! byte 4      serialization kind
//! byte 5      status (0 normal, 1 error)
//! bytes 6-13  sequence number, big-endian u64
//! ```

use crate::codec::Serialization;
use crate::compress::Compression;
use crate::error::Error;
use crate::error::Result;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 14;

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Direction of a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Request = 0,
    Response = 1,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Outcome carried by a response frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Normal = 0,
    Error = 1,
}

impl Status {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Normal),
            1 => Some(Self::Error),
            _ => None,
        }
    }
}

/// The fixed-size frame header.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Header([u8; HEADER_LEN]);

impl Header {
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_LEN] {
        &self.0
    }

    pub fn version(&self) -> u8 {
        self.0[0]
    }

    pub fn set_version(&mut self, version: u8) {
        self.0[0] = version;
    }

    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::from_u8(self.0[1])
            .ok_or(Error::InvalidHeader { field: "message_type", value: self.0[1] })
    }

    pub fn set_message_type(&mut self, ty: MessageType) {
        self.0[1] = ty as u8;
    }

    pub fn is_heartbeat(&self) -> bool {
        self.0[2] == 1
    }

    pub fn set_heartbeat(&mut self, heartbeat: bool) {
        self.0[2] = heartbeat as u8;
    }

    pub fn compression(&self) -> Compression {
        Compression(self.0[3])
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.0[3] = compression.0;
    }

    pub fn serialization(&self) -> Serialization {
        Serialization(self.0[4])
    }

    pub fn set_serialization(&mut self, serialization: Serialization) {
        self.0[4] = serialization.0;
    }

    pub fn status(&self) -> Result<Status> {
        Status::from_u8(self.0[5]).ok_or(Error::InvalidHeader { field: "status", value: self.0[5] })
    }

    pub fn set_status(&mut self, status: Status) {
        self.0[5] = status as u8;
    }

    pub fn seq(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[6..]);
        u64::from_be_bytes(buf)
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.0[6..].copy_from_slice(&seq.to_be_bytes());
    }

    /// Checks the fixed-meaning fields.
    ///
    /// The kind bytes are resolved against a `Registry` when the payload is
    /// used: an unknown compressor fails the frame, an unknown codec fails
    /// only the call that names it.
    pub fn validate(&self) -> Result<()> {
        if self.version() != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(self.version()));
        }
        self.message_type()?;
        self.status()?;
        if self.0[2] > 1 {
            return Err(Error::InvalidHeader { field: "heartbeat", value: self.0[2] });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("version", &self.version())
            .field("message_type", &self.0[1])
            .field("heartbeat", &self.is_heartbeat())
            .field("compression", &self.0[3])
            .field("serialization", &self.0[4])
            .field("status", &self.0[5])
            .field("seq", &self.seq())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_byte_layout() {
        let mut h = Header::default();
        h.set_version(PROTOCOL_VERSION);
        h.set_message_type(MessageType::Response);
        h.set_heartbeat(true);
        h.set_compression(Compression::GZIP);
        h.set_serialization(Serialization::MSGPACK);
        h.set_status(Status::Error);
        h.set_seq(0x0102_0304_0506_0708);

        assert_eq!(
            h.as_bytes(),
            &[1, 1, 1, 1, 1, 1, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_eq!(h.seq(), 0x0102_0304_0506_0708);
        assert!(h.validate().is_ok());
    }

    #[test]
    fn test_header_rejects_version_mismatch() {
        let mut h = Header::default();
        h.set_version(9);
        assert_eq!(h.validate(), Err(Error::UnsupportedVersion(9)));
    }

    #[test]
    fn test_header_kind_bytes_pass_through() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = PROTOCOL_VERSION;
        bytes[3] = 7;
        bytes[4] = 42;
        let h = Header::from_bytes(bytes);
        assert!(h.validate().is_ok());
        assert_eq!(h.compression(), Compression(7));
        assert_eq!(h.serialization(), Serialization(42));
    }

    #[test]
    fn test_header_rejects_bad_heartbeat_flag() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = PROTOCOL_VERSION;
        bytes[2] = 3;
        let h = Header::from_bytes(bytes);
        assert_eq!(h.validate(), Err(Error::InvalidHeader { field: "heartbeat", value: 3 }));
    }
}
