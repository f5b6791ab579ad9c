//! Error types for the tree, the framing layer and the network manager.
//!
//! Lookup misses (unknown class, unresolved path, packet without a handler)
//! are not errors; they surface as `None` or an empty `Vec`.

use crate::types::InstanceId;
use thiserror::Error;

/// Class registration failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("class name must not be empty")]
    EmptyClassName,
}

/// Invalid use of the instance hierarchy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("instance {id} has been destroyed")]
    Destroyed { id: InstanceId },

    #[error("parenting {child} under {parent} would create a cycle")]
    WouldCycle { child: InstanceId, parent: InstanceId },

    #[error("instance {id} is the tree root and cannot be re-parented")]
    RootReparent { id: InstanceId },
}

/// Framing violations. Any of these desynchronises the stream, so the
/// connection that produced it is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame length {0} is below the minimum of 2")]
    FrameTooShort(u32),

    #[error("frame length {0} exceeds the configured maximum")]
    FrameTooLarge(u32),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network manager failures reported to the caller of `connect`, `serve`
/// or `send_packet`.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid network address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {op} while the manager is {state}")]
    InvalidState { state: &'static str, op: &'static str },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
