//! Error kinds for the knowledge runtime.
//!
//! Per the error-handling design: parse errors propagate to the caller of
//! `compile`; everything else (bounds, IO, transport, filter mismatches) is
//! local — the affected record or packet is dropped and logged, and the
//! caller sees a `Result` only at the boundary that actually failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("bounds error: {0}")]
    Bounds(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("buffer filter {0:?} not registered, packet dropped")]
    FilterMismatch([u8; 4]),

    #[error("encode would exceed queue length ({size} > {limit})")]
    Memory { size: usize, limit: usize },

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;
