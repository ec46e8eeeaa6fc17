// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Nix(#[from] nix::Error),

    /// [`reset`](crate::reset) was called more times than
    /// [`install`](crate::install)
    #[error("the SIGBUS handler is not installed")]
    NotInstalled,
}
