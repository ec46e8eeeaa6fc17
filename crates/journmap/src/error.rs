// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    /// The file raised a bus fault earlier and its windows were replaced
    /// with anonymous pages; it can no longer serve reads. Sticky until
    /// the file handle is removed from the cache.
    #[error("file is poisoned after a bus fault")]
    FileIsPoisoned,

    /// A request started at or beyond the caller-provided file size.
    #[error("requested offset {offset} lies past the end of the file ({file_size} bytes)")]
    OffsetPastEndOfFile { offset: u64, file_size: u64 },

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// The closest errno equivalent, for callers that speak POSIX.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Error::FileIsPoisoned => libc::EIO,
            Error::OffsetPastEndOfFile { .. } => libc::EADDRNOTAVAIL,
            Error::Nix(errno) => *errno as i32,
        }
    }
}
