//! Components G & H: the FailOverCache client/server pair. Every cluster
//! write is mirrored to a remote FOC server before the local `LOC` is
//! durable in the TLog (contract 3 in §3); on restart, any entries the FOC
//! holds past the last backend cork are replayed (S3).

pub mod client;
pub mod server;
pub mod wire;

pub use client::{FailOverCacheClient, FocMode};
pub use server::FailOverCacheServer;

use crate::error::EngineErrorKind;
use snafu::Snafu;
use wire::WireError;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum FoCError {
    #[snafu(display("failed to connect to FOC server at {addr}: {message}"))]
    Connect { addr: String, message: String },
    #[snafu(display("FOC operation timed out after {millis}ms"))]
    Timeout { millis: u64 },
    #[snafu(display("FOC registration for {namespace} was fenced by owner tag {theirs}"))]
    Fenced { namespace: String, theirs: u64 },
    #[snafu(display("wire protocol error: {message}"))]
    Wire { message: String },
    #[snafu(display("FOC server returned error {code}: {message}"))]
    ServerError { code: u16, message: String },
    #[snafu(display("namespace {namespace} is not registered"))]
    NotRegistered { namespace: String },
}

impl FoCError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            FoCError::Connect { .. }
            | FoCError::Timeout { .. }
            | FoCError::Wire { .. } => EngineErrorKind::FocUnreachable,
            FoCError::Fenced { .. } => EngineErrorKind::Fenced,
            FoCError::ServerError { .. } => EngineErrorKind::TransientBackend,
            FoCError::NotRegistered { .. } => EngineErrorKind::BadRequest,
        }
    }
}

impl From<WireError> for FoCError {
    fn from(e: WireError) -> Self {
        FoCError::Wire {
            message: e.to_string(),
        }
    }
}
