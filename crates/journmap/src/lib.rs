// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Memory-mapped window cache for random access reads into large,
//! append-only journal files.
//!
//! Readers ask the cache for `size` bytes at `offset` of a registered file
//! descriptor and get back a pointer into a page-aligned memory-mapped
//! "window" of that file. Windows are wide (8 MiB by default) so that
//! neighboring reads land in an existing mapping, and every reader names a
//! small context slot that remembers the last window it used, making the
//! repeat-read case a single bounds check. Windows that no longer serve
//! any context are parked on an LRU list and recycled once enough of them
//! are live, keeping the mapped footprint bounded.
//!
//! Files on disk can be truncated or go bad underneath a mapping, which
//! surfaces as `SIGBUS` on access. With the [`journmap_sigbus`] handler
//! installed the cache survives this: faulted files are poisoned, their
//! windows are replaced in place with zero-filled anonymous pages, and
//! every later read of the file fails with [`Error::FileIsPoisoned`]
//! instead of crashing the process.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod cache;
mod error;
mod geometry;
mod mmap;

pub use cache::{FdHandle, MAX_CONTEXTS, MmapCache, Stats};
pub use error::{Error, Result};
pub use geometry::{Limits, WINDOW_SIZE, WINDOWS_MIN};
pub use mmap::{Prot, page_size};
