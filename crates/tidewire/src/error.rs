//! # Error Definitions
//!
//! Every way a frame can fail to encode or decode, plus payload codec failures.

/// Failures of the framing layer and of the payload codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer closed the stream cleanly before a new frame began.
    Closed,
    /// Underlying reader or writer failed.
    Io(String),
    /// A declared length would read past the end of the frame body.
    Truncated { needed: usize, remaining: usize },
    /// Bytes were left over after the payload field.
    TrailingBytes(usize),
    /// The frame body exceeds `MAX_FRAME_LEN`.
    FrameTooLarge { len: usize, max: usize },
    /// The version byte does not match `PROTOCOL_VERSION`.
    UnsupportedVersion(u8),
    /// A header byte holds a value with no meaning for its field.
    InvalidHeader { field: &'static str, value: u8 },
    /// A string field is not valid UTF-8.
    InvalidUtf8(&'static str),
    /// Payload compression or decompression failed.
    Compression(String),
    /// The serialization byte names no known codec.
    UnknownSerialization(u8),
    /// A value could not be serialized into a payload.
    Encode(String),
    /// A payload could not be deserialized into a value.
    Decode(String),
}

impl Error {
    /// Framing errors poison the stream: nothing after them can be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::Closed
                | Self::Io(_)
                | Self::Truncated { .. }
                | Self::TrailingBytes(_)
                | Self::FrameTooLarge { .. }
                | Self::UnsupportedVersion(_)
                | Self::InvalidHeader { .. }
                | Self::InvalidUtf8(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "stream closed by peer"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Truncated { needed, remaining } => {
                write!(f, "truncated frame: needed {} bytes, {} remaining", needed, remaining)
            }
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after payload", n),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame body of {} bytes exceeds limit of {}", len, max)
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            Self::InvalidHeader { field, value } => {
                write!(f, "invalid header field {}: {:#04x}", field, value)
            }
            Self::InvalidUtf8(field) => write!(f, "field {} is not valid UTF-8", field),
            Self::Compression(msg) => write!(f, "compression error: {}", msg),
            Self::UnknownSerialization(b) => write!(f, "unknown serialization kind {}", b),
            Self::Encode(msg) => write!(f, "encode error: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A specialized Result type for framing operations.
pub type Result<T> = std::result::Result<T, Error>;
