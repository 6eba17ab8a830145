//! `bulkops-core`: identifiers and error primitives shared by the bulk-job engine.
//!
//! This crate contains no runtime or storage concerns.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, OwnerId};
