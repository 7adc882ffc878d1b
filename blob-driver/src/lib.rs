//! # Blob store driver interface
//!
//! The [`BlobStore`] trait and the types shared by every blob store
//! implementation: [`Digest`] keys, [`Metadata`] and [`StorageError`].

mod digest;
mod driver;
mod error;

pub use digest::{Digest, InvalidDigest, SHA256};
pub use driver::BlobStore;
pub use driver::Metadata;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
