//! # Messages and Frames
//!
//! A `Message` is the unit of exchange; a frame is its encoded form:
//!
//! ```text
//! +-------------+------------+-----------+------+-------------+--------+----------+------+-------------+---------+
//! | header 14B  | body len 4 | path len 4| path | method len 4| method | meta len 4| meta | payload len 4| payload |
//! +-------------+------------+-----------+------+-------------+--------+----------+------+-------------+---------+
//! ```
//!
//! All lengths are big-endian `u32`. The metadata block is a flat run of
//! `(key len, key, value len, value)` pairs with no count prefix; a reader
//! consumes pairs until it has read exactly the declared block length.
//!
//! ## Invariants
//! - Encoding always stamps `PROTOCOL_VERSION`; decoding rejects anything else.
//! - No declared length may reach past the body boundary.
//! - A compressed payload is framed at its compressed length. If compression
//!   fails, or the kind has no compressor, the header is rewritten to
//!   `Compression::NONE` and the raw payload is sent instead.
//! - A decompressed payload is held to `MAX_FRAME_LEN` like a raw one.
//!
//! The plain `encode` / `decode` / `read_from` / `write_to` resolve kinds
//! against the built-ins; the `_with` variants take a `Registry`.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::compress::Compression;
use crate::error::Error;
use crate::error::Result;
use crate::header::HEADER_LEN;
use crate::header::Header;
use crate::header::MessageType;
use crate::header::PROTOCOL_VERSION;
use crate::header::Status;
use crate::pool::Pool;
use crate::registry::Registry;

/// Largest body a frame may declare.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Per-call string metadata. Order carries no meaning.
pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    /// Service name.
    pub path: String,
    /// Method name within the service.
    pub method: String,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool of messages that keeps string and buffer capacity across uses.
    pub fn pool(capacity: usize) -> Arc<Pool<Message>> {
        Pool::new(capacity, Message::new, Message::reset)
    }

    /// Zeroes the header and clears every field, keeping allocations.
    pub fn reset(&mut self) {
        self.header = Header::default();
        self.path.clear();
        self.method.clear();
        self.metadata.clear();
        self.payload.clear();
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header.is_heartbeat()
    }

    /// Turns this message into the response skeleton for `req`.
    ///
    /// Echoes sequence number, serialization, compression and names; metadata
    /// and payload start empty.
    pub fn prepare_response(&mut self, req: &Message) {
        self.reset();
        self.header = req.header;
        self.header.set_message_type(MessageType::Response);
        self.header.set_heartbeat(false);
        self.header.set_status(Status::Normal);
        self.path.push_str(&req.path);
        self.method.push_str(&req.method);
    }

    /// Encodes this message into a complete frame.
    ///
    /// Takes `&mut self` because a failed compression downgrades the header.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        self.encode_with(&Registry::new())
    }

    pub fn encode_with(&mut self, registry: &Registry) -> Result<Vec<u8>> {
        self.header.set_version(PROTOCOL_VERSION);
        let meta = encode_metadata(&self.metadata);

        let zipped = registry.compressor(self.header.compression()).and_then(|compressor| {
            if compressor.is_identity() { Ok(None) } else { compressor.zip(&self.payload).map(Some) }
        });
        let payload: Cow<'_, [u8]> = match zipped {
            Ok(Some(zipped)) => Cow::Owned(zipped),
            Ok(None) => Cow::Borrowed(self.payload.as_slice()),
            Err(_) => {
                self.header.set_compression(Compression::NONE);
                Cow::Borrowed(self.payload.as_slice())
            }
        };

        let body_len = 16 + self.path.len() + self.method.len() + meta.len() + payload.len();
        if body_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge { len: body_len, max: MAX_FRAME_LEN });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + 4 + body_len);
        frame.extend_from_slice(self.header.as_bytes());
        put_u32(&mut frame, body_len);
        put_field(&mut frame, self.path.as_bytes());
        put_field(&mut frame, self.method.as_bytes());
        put_field(&mut frame, &meta);
        put_field(&mut frame, &payload);
        Ok(frame)
    }

    /// Decodes one complete frame held in memory.
    pub fn decode(&mut self, frame: &[u8]) -> Result<()> {
        self.decode_with(frame, &Registry::new())
    }

    pub fn decode_with(&mut self, frame: &[u8], registry: &Registry) -> Result<()> {
        let mut cur = Cursor::new(frame);
        let header = cur.take(HEADER_LEN)?;
        let mut bytes = [0u8; HEADER_LEN];
        bytes.copy_from_slice(header);
        let body_len = cur.u32()? as usize;
        let body = cur.take(body_len)?;
        if cur.remaining() != 0 {
            return Err(Error::TrailingBytes(cur.remaining()));
        }
        self.decode_body(Header::from_bytes(bytes), body, registry)
    }

    /// Reads and decodes the next frame from a stream.
    ///
    /// Returns `Error::Closed` if the stream ends before a header starts.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.read_from_with(reader, &Registry::new()).await
    }

    pub async fn read_from_with<R>(&mut self, reader: &mut R, registry: &Registry) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = [0u8; HEADER_LEN];
        let first = reader.read(&mut bytes[..1]).await?;
        if first == 0 {
            return Err(Error::Closed);
        }
        reader.read_exact(&mut bytes[1..]).await.map_err(truncated)?;
        let header = Header::from_bytes(bytes);
        header.validate()?;

        let body_len = reader.read_u32().await.map_err(truncated)? as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge { len: body_len, max: MAX_FRAME_LEN });
        }
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await.map_err(truncated)?;
        self.decode_body(header, &body, registry)
    }

    /// Encodes this message and writes the frame in one piece.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_to_with(writer, &Registry::new()).await
    }

    pub async fn write_to_with<W>(&mut self, writer: &mut W, registry: &Registry) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode_with(registry)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn decode_body(&mut self, header: Header, body: &[u8], registry: &Registry) -> Result<()> {
        header.validate()?;
        let compressor = registry.compressor(header.compression())?;
        self.reset();

        let mut cur = Cursor::new(body);
        let path = cur.field()?;
        let method = cur.field()?;
        let meta = cur.field()?;
        let payload = cur.field()?;
        if cur.remaining() != 0 {
            return Err(Error::TrailingBytes(cur.remaining()));
        }

        self.path.push_str(std::str::from_utf8(path).map_err(|_| Error::InvalidUtf8("path"))?);
        self.method.push_str(std::str::from_utf8(method).map_err(|_| Error::InvalidUtf8("method"))?);
        decode_metadata(meta, &mut self.metadata)?;

        if compressor.is_identity() {
            self.payload.extend_from_slice(payload);
        } else {
            let unzipped = compressor.unzip(payload, MAX_FRAME_LEN)?;
            if unzipped.len() > MAX_FRAME_LEN {
                return Err(Error::FrameTooLarge { len: unzipped.len(), max: MAX_FRAME_LEN });
            }
            self.payload = unzipped;
        }
        self.header = header;
        Ok(())
    }
}

/// Encodes metadata as flat length-prefixed pairs.
pub fn encode_metadata(metadata: &Metadata) -> Vec<u8> {
    let len = metadata.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut buf = Vec::with_capacity(len);
    for (k, v) in metadata {
        put_field(&mut buf, k.as_bytes());
        put_field(&mut buf, v.as_bytes());
    }
    buf
}

/// Decodes a metadata block into `out`, which is cleared first.
pub fn decode_metadata(block: &[u8], out: &mut Metadata) -> Result<()> {
    out.clear();
    let mut cur = Cursor::new(block);
    while cur.remaining() > 0 {
        let key = cur.field()?;
        let val = cur.field()?;
        let key = std::str::from_utf8(key).map_err(|_| Error::InvalidUtf8("metadata key"))?;
        let val = std::str::from_utf8(val).map_err(|_| Error::InvalidUtf8("metadata value"))?;
        out.insert(key.to_owned(), val.to_owned());
    }
    Ok(())
}

fn put_u32(buf: &mut Vec<u8>, n: usize) {
    buf.extend_from_slice(&(n as u32).to_be_bytes());
}

fn put_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len());
    buf.extend_from_slice(bytes);
}

fn truncated(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Io("stream ended mid-frame".into())
    } else {
        Error::from(e)
    }
}

/// Bounds-checked reader over a borrowed frame.
struct Cursor<'a> {
    slice: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(slice: &'a [u8]) -> Self {
        Self { slice, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.slice.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Truncated { needed: n, remaining: self.remaining() });
        }
        let bytes = &self.slice[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    /// A `u32` length followed by that many bytes.
    fn field(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
