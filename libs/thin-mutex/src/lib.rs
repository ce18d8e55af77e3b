// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A blocking mutex the size of one pointer.
//!
//! [`ThinMutex`] idles as a single word: null while unheld, a sentinel
//! while held without contention. The first contended acquire or condition
//! wait inflates it into a heap record carrying a host mutex and condition
//! variable, and the record is reclaimed once the last thread with a stake
//! in it moves on. Programs that instantiate very large numbers of rarely
//! contended locks therefore pay one word per lock, not one kernel object.
//!
//! [`Mutex`] and [`MutexGuard`] wrap the raw lock with data and RAII in the
//! usual shape, [`Condvar`] pairs with either form, and `ThinMutex`
//! implements [`lock_api::RawMutex`] for use with that ecosystem.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod condvar;
mod error;
mod inflate;
mod loom;
mod mutex;
mod record;
mod sys;

pub use condvar::Condvar;
pub use error::{Error, Result};
pub use mutex::{Mutex, MutexGuard, ThinMutex};

#[cfg(feature = "tracing")]
macro_rules! trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) };
}
#[cfg(not(feature = "tracing"))]
macro_rules! trace {
    ($($t:tt)*) => {{}};
}

pub(crate) use trace;
