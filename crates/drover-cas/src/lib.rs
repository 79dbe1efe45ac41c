//! # drover-cas
//!
//! Content-addressable build file cache for drover distribution nodes.
//!
//! Files are identified by the 40 character content hash the registry
//! assigns them, so content shared by many build versions is stored once.
//!
//! ## Directory Layout
//!
//! ```text
//! <cache root>/
//! ├── 00/
//! ├── ...
//! └── A9/
//!     └── A94A8FE5CCB19BA61C4C0873D391E987982FBBD3
//! ```
//!
//! All 256 shard directories are created up front. Nothing but the blobs is
//! persisted; the size index is rebuilt from the filesystem on start-up.
//!
//! ## Handles
//!
//! [`ContentStore::open`] returns a cloneable read handle and exactly one
//! [`StoreWriter`]. Only the writer touches the disk or the index, which keeps
//! the two in lock-step.

mod fetch;
mod hash;
mod store;

pub use fetch::{Fetch, FsFetch};
pub use hash::{ContentHash, HASH_HEX_LEN, HASH_LEN};
pub use store::{AddOutcome, ContentStore, IndexReport, RemoveOutcome, StoreWriter, SHARD_COUNT};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during cache store operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid content hash: {value:?}")]
    InvalidHash { value: String },

    #[error("Failed to fetch {hash} from {}: {error}", .from.display())]
    Fetch {
        hash: ContentHash,
        from: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("Blob {hash} still present after delete")]
    DeleteUnverified { hash: ContentHash },
}

pub type Result<T> = std::result::Result<T, CasError>;
