//! A distributed real-time knowledge-sharing runtime: a typed, versioned
//! record store, an embedded expression language ("KaRL"), and a
//! replicating transport pipeline.

pub mod config;
pub mod error;
pub mod eval;
pub mod facade;
pub mod filters;
pub mod fragment;
pub mod record;
pub mod store;
pub mod transport;
pub mod wire;

pub use error::{KnowledgeError, Result};
pub use facade::KnowledgeBase;
pub use record::{Record, RecordValue, TypeTag};
pub use store::Store;
