// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Placement and sizing of the windows mapped to serve read requests.

use crate::mmap::page_size;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./geometry_test.rs"]
mod geometry_test;

/// Production window width. Wide windows amortize the cost of a mapping
/// across many neighboring reads.
pub const WINDOW_SIZE: u64 = 8 * 1024 * 1024;

/// Soft floor on the number of live windows: below it, unused windows are
/// kept mapped instead of being recycled.
pub const WINDOWS_MIN: usize = 64;

/// Sizing knobs for an [`MmapCache`](crate::MmapCache).
///
/// The defaults are right for production use; tests shrink them to force
/// the recycling paths. With the `debug-windows` feature the default
/// window width drops to a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Width of newly mapped windows; smaller requests are expanded to
    /// this size.
    pub window_size: u64,
    /// Number of live windows to accumulate before recycling starts.
    pub windows_min: usize,
}

impl Default for Limits {
    fn default() -> Self {
        #[cfg(feature = "debug-windows")]
        let window_size = page_size() as u64;
        #[cfg(not(feature = "debug-windows"))]
        let window_size = WINDOW_SIZE;
        Limits {
            window_size,
            windows_min: WINDOWS_MIN,
        }
    }
}

impl Limits {
    /// Window sizes are page granular; round up whatever was asked for.
    pub(crate) fn normalized(mut self) -> Self {
        self.window_size = align_up(self.window_size.max(1), page_size() as u64);
        self
    }
}

pub(crate) fn align_up(value: u64, page: u64) -> u64 {
    (value + page - 1) & !(page - 1)
}

/// A page-aligned span of one file, chosen to back a read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub offset: u64,
    pub size: u64,
}

/// Compute the window that should back a request for `size` bytes at
/// `offset`.
///
/// Requests narrower than `window_size` are expanded symmetrically so
/// that reads on either side land in the same window. When the current
/// file size is known the span is clamped to it: mappings that extend
/// past the end of the file have undefined behavior.
pub(crate) fn window_span(
    offset: u64,
    size: u64,
    window_size: u64,
    file_size: Option<u64>,
    page: u64,
) -> Result<Span> {
    let mut woffset = offset & !(page - 1);
    let mut wsize = align_up(size + (offset - woffset), page);

    if wsize < window_size {
        let delta = align_up((window_size - wsize) / 2, page);
        if delta > offset {
            woffset = 0;
        } else {
            woffset -= delta;
        }
        wsize = window_size;
    }

    if let Some(file_size) = file_size {
        if woffset >= file_size {
            return Err(Error::OffsetPastEndOfFile { offset, file_size });
        }
        if woffset + wsize > file_size {
            wsize = align_up(file_size - woffset, page);
        }
    }

    Ok(Span {
        offset: woffset,
        size: wsize,
    })
}
