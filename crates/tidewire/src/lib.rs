//! # Tidewire
//!
//! The binary framing layer of the tide RPC framework.
//!
//! ## Architecture
//!
//! - **Header**: a fixed 14-byte prefix viewed field by field (`header`).
//! - **Message**: path, method, metadata and payload behind the header, with a
//!   self-delimiting frame encoding (`message`).
//! - **Capabilities**: payload `Compressor`s and `Codec`s, chosen per frame by
//!   header bytes (`compress`, `codec`) and looked up in a `Registry` that
//!   callers may extend with their own kinds (`registry`).
//! - **Reuse**: a typed `Pool` so frames and handler values are recycled rather
//!   than reallocated per call (`pool`).

pub mod codec;
pub mod compress;
pub mod error;
pub mod header;
pub mod message;
pub mod pool;
pub mod registry;


pub use codec::Codec;
pub use codec::JsonCodec;
pub use codec::MsgPackCodec;
pub use codec::Serialization;
pub use compress::Compression;
pub use compress::Compressor;
pub use compress::GzipCompressor;
pub use compress::RawCompressor;
pub use error::Error;
pub use error::Result;
pub use header::HEADER_LEN;
pub use header::Header;
pub use header::MessageType;
pub use header::PROTOCOL_VERSION;
pub use header::Status;
pub use message::MAX_FRAME_LEN;
pub use message::Message;
pub use message::Metadata;
pub use pool::Pool;
pub use pool::Pooled;
pub use registry::Registry;

/// Metadata key carrying the caller's remaining deadline in milliseconds.
pub const SERVER_TIMEOUT_KEY: &str = "server_timeout";

/// Metadata key carrying the human-readable error of a failed call.
pub const RESPONSE_ERROR_KEY: &str = "response_error";

/// Metadata key carrying the responder's idle-CPU percentage on heartbeats.
pub const CPU_IDLE_KEY: &str = "cpu.idle";
