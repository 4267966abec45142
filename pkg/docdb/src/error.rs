//! Typed failure kinds, each a small `Fail`-implementing
//! struct converted to `common::errors::Error` at the point it is raised,
//! in the idiom of the reference codebase's `ProtocolError`
//! (`pkg/http/src/v2/types.rs`).

use common::errors::*;

#[derive(Debug, Clone, Fail)]
pub struct ConnectionLost {
    pub address: String,
}

impl ConnectionLost {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl std::fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection-lost: {}", self.address)
    }
}

#[derive(Debug, Clone, Fail)]
pub struct CannotConnect {
    pub reason: String,
}

impl std::fmt::Display for CannotConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot-connect: {}", self.reason)
    }
}

#[derive(Debug, Clone, Fail)]
pub struct ReplyShape {
    pub expected: &'static str,
    pub found: usize,
}

impl std::fmt::Display for ReplyShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reply-shape: expected {}, found {} documents",
            self.expected, self.found
        )
    }
}

#[derive(Debug, Clone, Fail)]
pub struct ServerError {
    pub code: i32,
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server-error: [{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Fail)]
pub struct DocumentTooLarge {
    pub size: usize,
    pub limit: usize,
}

impl std::fmt::Display for DocumentTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "document-too-large: {} bytes exceeds limit of {} bytes",
            self.size, self.limit
        )
    }
}

#[derive(Debug, Clone, Fail)]
pub struct DecodeFailure {
    pub reason: String,
}

impl std::fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode-failure: {}", self.reason)
    }
}

#[derive(Debug, Clone, Fail)]
pub struct CursorNotFound {
    pub cursor_id: i64,
}

impl std::fmt::Display for CursorNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cursor-not-found: {}", self.cursor_id)
    }
}

#[derive(Debug, Clone, Fail)]
pub struct ShardConfigStale;

impl std::fmt::Display for ShardConfigStale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-config-stale")
    }
}

#[derive(Debug, Clone, Fail)]
pub struct AuthFailed {
    pub reason: String,
}

impl std::fmt::Display for AuthFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "auth-failed: {}", self.reason)
    }
}

#[derive(Debug, Clone, Fail)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
