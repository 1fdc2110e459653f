//! Request-scoped call state.
//!
//! On the client a `CallContext` carries outgoing metadata and an optional
//! deadline. On the server the dispatcher builds one per request: request
//! metadata from the frame, a deadline derived from the caller's timeout hint,
//! and an empty response map the handler may fill.

use std::net::SocketAddr;
use std::time::Duration;

use tidewire::Metadata;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub request_metadata: Metadata,
    pub response_metadata: Metadata,
    pub deadline: Option<Instant>,
    /// Peer address, set by the server dispatcher.
    pub remote_addr: Option<SocketAddr>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_metadata.insert(key.into(), value.into());
        self
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}
