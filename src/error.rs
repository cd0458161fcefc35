//! Crate-wide error type and result alias.

use std::io;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, VesperError>;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum VesperError {
    /// Underlying channel or file failure, surfaced unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A page or transfer payload failed shape/integrity validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// A caller-supplied argument or configuration value is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The map has been closed; only `close`/`is_closed` remain legal.
    #[error("map {0:?} is closed")]
    Closed(String),
}
