//! Plain data carried in and out of the storage engine.
//!
//! `metadata` is also the on-disk sidecar format, so its serde field names
//! are part of the persisted layout.

pub mod metadata;
pub mod multipart;
pub mod object;
