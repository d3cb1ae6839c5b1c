#![deny(missing_docs)]

//! An append-and-trim persistent blob store.
//!
//! Payloads are opaque byte blobs addressed by an opaque [`Locator`].
//! Storage is organized into generations, each a fixed-width index log
//! appended in lockstep with a raw data log. Appends go to the single
//! writable front generation; once it has absorbed the configured number
//! of entries it is retired to the read-only back set and a new front is
//! opened. Trimming an entry records a tombstone in the index, and a back
//! generation whose last live entry is trimmed is deleted from disk.

mod error;
mod rwlock;
mod store;

pub use error::{MachiError, Result};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
pub use store::{Locator, MachiStore};
