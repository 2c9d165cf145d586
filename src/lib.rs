//! funcbox: upload, version, and run untrusted functions.
//!
//! Submissions are written in a small Python subset, checked statically by
//! the policy validator, stored as immutable versions, and executed by an
//! in-process interpreter under time and memory ceilings. Every execution
//! attempt lands in a per-function ledger; registry and ledger state can be
//! made durable with a write-ahead log.

pub mod config;
pub mod error;
pub mod kernel;
pub mod lang;
pub mod policy;
pub mod registry;
pub mod sandbox;
pub mod service;

pub use error::ErrorKind;
pub use service::{Envelope, FunctionService, ServiceError, UploadRequest};
