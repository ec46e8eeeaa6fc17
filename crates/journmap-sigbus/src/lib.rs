// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Process-wide capture of `SIGBUS` faults for memory-mapped file readers.
//!
//! Reading a shared mapping of a file that was truncated underneath the
//! reader raises `SIGBUS`, which kills the process unless handled. This
//! crate installs a handler that records the faulting address on a fixed,
//! lock-free queue and plasters a zeroed anonymous page over the faulting
//! page so that the interrupted instruction can be retried immediately.
//!
//! The handler does the absolute minimum that is async-signal-safe; all
//! real recovery (finding the owning mapping, refusing further reads from
//! the file) is expected to happen later on a regular thread by draining
//! [`pop`]. The queue is shared by the whole process: every consumer must
//! treat addresses it does not recognize as somebody else's problem only
//! if another consumer exists, and as fatal otherwise.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod error;
mod handler;
mod queue;

pub use error::{Error, Result};
pub use handler::{install, reset};
pub use queue::{Pop, clear, pop, push};
