// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Heap records reachable from an inflated lock word.
//!
//! Two record kinds exist: the terminal [`FatMutex`] carrying the blocking
//! state, and the transient [`PinRecord`] links installed in front of it
//! while a thread chases the word down to the record. Both are separate
//! allocations that begin with a one-byte tag so a chain can be walked
//! through `*mut Header` without knowing what each link is in advance.

use alloc::boxed::Box;

use crate::loom::{AtomicPtr, AtomicUsize, Ordering, UnsafeCell};
use crate::sys;

/// Tag discriminating what a record pointer reaches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum Kind {
    /// The terminal record of every chain.
    Fat = 0,
    /// A transient link pinning everything behind it.
    Pin = 1,
}

/// Leading field shared by both record kinds.
#[repr(C)]
pub(crate) struct Header {
    kind: Kind,
}

impl Header {
    /// Reads the tag of the record `ptr` points at.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live [`FatMutex`] or [`PinRecord`].
    pub(crate) unsafe fn kind_of(ptr: *mut Header) -> Kind {
        // Safety: both record types are `#[repr(C)]` with a leading `Header`.
        unsafe { (*ptr).kind }
    }
}

/// Blocking state of an inflated lock, accessed only under the record's
/// inner mutex.
pub(crate) struct LockState {
    /// Whether the lock is logically held by some thread.
    pub(crate) held: bool,
    /// Threads currently parked on `held_cond` inside the acquire loop.
    pub(crate) waiters: usize,
}

/// The inflated form of a lock.
///
/// Allocated on first contention or first condition wait, reclaimed when the
/// last reference is retired while the lock word still points here.
#[repr(C)]
pub(crate) struct FatMutex {
    header: Header,
    /// Every reason this record must stay allocated: one for the holder
    /// while `held` is set, one per parked acquirer, one per parked
    /// condition waiter, and one per surviving pin chain that is not rooted
    /// at the lock word. The chain rooted at the lock word itself does not
    /// count; dropping it while observing zero here is what permits
    /// reclamation.
    pub(crate) refs: AtomicUsize,
    /// Serializes `state`; also the mutex every condition wait runs on.
    pub(crate) mutex: sys::Mutex,
    /// Signalled when the lock is handed back while acquirers are parked.
    pub(crate) held_cond: sys::Cond,
    pub(crate) state: UnsafeCell<LockState>,
}

impl FatMutex {
    /// Allocates a record mirroring a lock observed in state `held`. The
    /// holder's reference is pre-counted when the lock is held.
    pub(crate) fn alloc(held: bool) -> *mut FatMutex {
        #[cfg(test)]
        RECORD_ALLOCS.with(|allocs| allocs.set(allocs.get() + 1));
        Box::into_raw(Box::new(FatMutex {
            header: Header { kind: Kind::Fat },
            refs: AtomicUsize::new(usize::from(held)),
            mutex: sys::Mutex::new(),
            held_cond: sys::Cond::new(),
            state: UnsafeCell::new(LockState { held, waiters: 0 }),
        }))
    }

    /// Frees a record.
    ///
    /// # Safety
    ///
    /// `ptr` must be the sole remaining way to reach the record, and its
    /// inner mutex must be unlocked.
    pub(crate) unsafe fn dealloc(ptr: *mut FatMutex) {
        // Safety: reverses `alloc` per the contract above.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// A transient pin installed in front of a chain while one thread chases
/// the lock word down to the fat record.
///
/// The installing thread and the lock-word slot the pin is exchanged into
/// account for the two initial references; the collapse walk retires them
/// with decrements of one or two.
#[repr(C)]
pub(crate) struct PinRecord {
    header: Header,
    pub(crate) refs: AtomicUsize,
    /// Next record toward the fat record. Written only by the installing
    /// thread, and only before the pin is published.
    pub(crate) next: AtomicPtr<Header>,
}

impl PinRecord {
    pub(crate) fn alloc(next: *mut Header) -> *mut PinRecord {
        #[cfg(test)]
        RECORD_ALLOCS.with(|allocs| allocs.set(allocs.get() + 1));
        Box::into_raw(Box::new(PinRecord {
            header: Header { kind: Kind::Pin },
            refs: AtomicUsize::new(2),
            next: AtomicPtr::new(next),
        }))
    }

    /// # Safety
    ///
    /// `ptr` must be a pin whose last reference was just retired.
    pub(crate) unsafe fn dealloc(ptr: *mut PinRecord) {
        // Safety: reverses `alloc` per the contract above.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Follows `next` links from `start` down to the terminal fat record.
///
/// # Safety
///
/// Every record from `start` down must stay live for the walk; the caller
/// guarantees this by holding a reference on a pin that reaches `start`.
pub(crate) unsafe fn find_fat(start: *mut Header) -> *mut FatMutex {
    let mut cur = start;
    loop {
        // Safety: `cur` is live per the contract above.
        match unsafe { Header::kind_of(cur) } {
            Kind::Fat => return cur.cast::<FatMutex>(),
            // Safety: a `Pin` tag means `cur` is a live `PinRecord`.
            Kind::Pin => cur = unsafe { (*cur.cast::<PinRecord>()).next.load(Ordering::Acquire) },
        }
    }
}

/// Records allocated by the current thread; lets tests assert that the
/// uncontended paths never touch the allocator.
#[cfg(test)]
std::thread_local! {
    pub(crate) static RECORD_ALLOCS: core::cell::Cell<usize> =
        const { core::cell::Cell::new(0) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_survive_header_casts() {
        let fat = FatMutex::alloc(false);
        let pin = PinRecord::alloc(fat.cast());
        // Safety: both records are live, private to this thread, and torn
        // down exactly once at the end.
        unsafe {
            assert_eq!(Header::kind_of(fat.cast()), Kind::Fat);
            assert_eq!(Header::kind_of(pin.cast()), Kind::Pin);
            assert_eq!(find_fat(pin.cast()), fat);
            assert_eq!((*pin).refs.load(Ordering::Relaxed), 2);
            PinRecord::dealloc(pin);
            FatMutex::dealloc(fat);
        }
    }

    #[test]
    fn fresh_record_mirrors_observed_state() {
        let fat = FatMutex::alloc(true);
        // Safety: the record is live and private to this thread.
        unsafe {
            assert_eq!((*fat).refs.load(Ordering::Relaxed), 1);
            (*fat).state.with(|s| assert!((*s).held));
            FatMutex::dealloc(fat);
        }
    }
}
