//! Filesystem-backed storage engine.
//!
//! [`backend::Backend`] owns the storage root and bucket lifecycle;
//! [`bucket::Bucket`] drives object and multipart operations; objects are
//! directories resolved into [`object::Object`] handles. Every path built
//! from client input passes through [`path_safety`] first.

pub mod backend;
pub mod bucket;
pub mod error;
pub mod layout;
pub mod lock;
pub mod object;
pub mod path_safety;
pub mod walker;

use error::{StorageError, StorageResult};
use tokio_util::sync::CancellationToken;

/// Fail with `Cancelled` once `cancel` has fired.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> StorageResult<()> {
    if cancel.is_cancelled() {
        Err(StorageError::Cancelled)
    } else {
        Ok(())
    }
}
