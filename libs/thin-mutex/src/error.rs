// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Errors surfaced by lock and condition-variable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A release or a condition wait was attempted on a lock that is not
    /// held by the calling thread.
    #[error("lock is not held by the calling thread")]
    NotOwner,
    /// A timed condition wait reached its deadline before being signalled.
    #[error("timed out waiting on the condition variable")]
    TimedOut,
    /// A host mutex or condition-variable call failed; the payload is the
    /// raw errno value, passed through verbatim.
    #[error("os error {0}")]
    Os(i32),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
