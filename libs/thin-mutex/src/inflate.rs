// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The inflation protocol.
//!
//! A lock word holds null (unheld), [`HELD`] (held, uncontended) or a
//! pointer into a chain of records ending in a [`FatMutex`]. This module
//! covers every transition between those shapes:
//!
//! - [`promote`]: bare word to freshly allocated fat record,
//! - [`chase`]: safe dereference of a published pointer by installing a
//!   [`PinRecord`] in front of it, then collapsing the chain again,
//! - [`release_fat`] / [`settle_fat`]: reference retirement and the
//!   deflation back to a bare word.
//!
//! The word is the only lock-free coordination point. Everything else lives
//! behind the record's inner mutex, except the reference counts, whose
//! decrement-and-test is the serialization point for reclamation.
//!
//! `get_fat` leaves its caller holding the inner mutex and no reference of
//! its own; the mutex alone keeps the record alive until the caller either
//! takes a reference (acquire paths) or leaves through one of the release
//! functions.

use crate::error::{Error, Result};
use crate::loom::{AtomicPtr, Ordering};
use crate::record::{self, FatMutex, Header, PinRecord};
use crate::trace;

/// Lock-word sentinel for "held, uncontended": no record exists yet.
pub(crate) const HELD: *mut Header = core::ptr::without_provenance_mut(1);

/// True if `p` is one of the two record-free word values.
pub(crate) fn is_bare(p: *mut Header) -> bool {
    p.is_null() || p.addr() == HELD.addr()
}

/// Reaches the fat record of a lock whose word was observed as `cur`,
/// inflating first if the word is still bare.
///
/// `Ok(None)` reports a lost race: the word changed underneath and the
/// caller must restart from a fresh read.
///
/// # Safety
///
/// `word` must be the lock word `cur` was loaded from.
pub(crate) unsafe fn get_fat(
    word: &AtomicPtr<Header>,
    cur: *mut Header,
) -> Result<Option<*mut FatMutex>> {
    if is_bare(cur) {
        promote(word, cur)
    } else {
        // Safety: contract forwarded from the caller.
        unsafe { chase(word, cur) }
    }
}

/// Inflates a bare word: allocates a record mirroring the observed state
/// and publishes it with one CAS. The inner mutex is locked before the
/// record becomes visible, so no thread can act on it half-built.
fn promote(word: &AtomicPtr<Header>, cur: *mut Header) -> Result<Option<*mut FatMutex>> {
    let held = cur.addr() == HELD.addr();
    let fat = FatMutex::alloc(held);
    // Safety: freshly allocated, not yet shared.
    if let Err(errno) = unsafe { (*fat).mutex.lock() } {
        // Safety: still unshared.
        unsafe { FatMutex::dealloc(fat) };
        return Err(Error::Os(errno));
    }
    if word
        .compare_exchange(cur, fat.cast(), Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        trace!("lock inflated");
        Ok(Some(fat))
    } else {
        // Lost the install race; the record was never visible to anyone.
        // Safety: still unshared, and the mutex is unlocked before teardown.
        unsafe {
            let _ = (*fat).mutex.unlock();
            FatMutex::dealloc(fat);
        }
        Ok(None)
    }
}

/// Safely dereferences a pointer-valued word down to its fat record.
///
/// A pin with two references (this thread, plus the word slot it is
/// exchanged into) is installed in front of the chain. Once the record's
/// inner mutex is held, the word is swapped to point straight at the record
/// and the detached chain is retired link by link. A link whose count stays
/// positive roots a surviving secondary chain and stops the walk; a chain
/// that dissolves all the way to the record gives back exactly one of the
/// record references counted for it.
///
/// # Safety
///
/// `word` must be the lock word `cur` was loaded from, and `cur` must be a
/// record pointer, not a bare value.
unsafe fn chase(word: &AtomicPtr<Header>, cur: *mut Header) -> Result<Option<*mut FatMutex>> {
    let mut chain = cur;
    let pin = PinRecord::alloc(chain);
    loop {
        match word.compare_exchange(chain, pin.cast(), Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(now) if is_bare(now) => {
                // The chain collapsed away entirely; nothing left to pin.
                // Safety: the pin was never published.
                unsafe { PinRecord::dealloc(pin) };
                return Ok(None);
            }
            Err(now) => {
                // Re-point the still-private pin at the moved chain head.
                // Safety: not yet published.
                unsafe { (*pin).next.store(now, Ordering::Relaxed) };
                chain = now;
            }
        }
    }

    // Safety: our pin keeps every record from `next` down alive.
    let fat = unsafe { record::find_fat((*pin).next.load(Ordering::Relaxed)) };
    // Safety: alive for the same reason.
    let locked = unsafe { (*fat).mutex.lock() };
    if let Err(errno) = locked {
        // Retire this thread's own reference; whoever holds the remaining
        // one reclaims the pin later.
        // Safety: the pin is alive until its last reference is retired.
        unsafe {
            if (*pin).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                PinRecord::dealloc(pin);
            }
        }
        return Err(Error::Os(errno));
    }

    // Collapse the primary chain: the word points straight at the record
    // again, and the detached chain becomes a secondary one. Count it as
    // such up front; the walks below revoke the count if it dissolves.
    let detached = word.swap(fat.cast(), Ordering::SeqCst);
    // Safety: inner mutex held.
    unsafe { (*fat).refs.fetch_add(1, Ordering::SeqCst) };

    // First walk: retire the detached chain until it reaches our own pin,
    // the record itself, or a link some other thread still references.
    let mut node = detached;
    let own_on_primary = loop {
        if node == pin.cast::<Header>() {
            break true;
        }
        if node == fat.cast::<Header>() {
            // Dissolved without creating a secondary chain.
            // Safety: inner mutex held.
            unsafe { (*fat).refs.fetch_sub(1, Ordering::SeqCst) };
            break false;
        }
        let link = node.cast::<PinRecord>();
        // Safety: the word's reference on the chain head transferred to us
        // with the swap, and each freed link transfers its `next` reference
        // the same way.
        unsafe {
            if (*link).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                let next = (*link).next.load(Ordering::Acquire);
                PinRecord::dealloc(link);
                node = next;
            } else {
                break false;
            }
        }
    };

    // Second walk: retire our own pin. Both of its references go when the
    // first walk arrived here (the chain reference and ours), only ours
    // otherwise. Freed links cascade downward with single decrements.
    let mut delta = if own_on_primary { 2 } else { 1 };
    let mut node = pin.cast::<Header>();
    loop {
        if node == fat.cast::<Header>() {
            // The cascade dissolved a counted chain down to the record.
            // Safety: inner mutex held.
            unsafe { (*fat).refs.fetch_sub(1, Ordering::SeqCst) };
            break;
        }
        let link = node.cast::<PinRecord>();
        // Safety: each link is alive until its last reference is retired,
        // which is exactly what the zero branch below detects.
        unsafe {
            if (*link).refs.fetch_sub(delta, Ordering::AcqRel) == delta {
                let next = (*link).next.load(Ordering::Acquire);
                PinRecord::dealloc(link);
                node = next;
                delta = 1;
            } else {
                break;
            }
        }
    }

    Ok(Some(fat))
}

/// Finishes an acquisition: parks until `held` clears, takes the lock, and
/// drops the inner mutex.
///
/// # Safety
///
/// The caller must hold the inner mutex of the live record `fat` and must
/// own one of its references; that reference stands for the parked waiter
/// while waiting and for the holder afterwards.
pub(crate) unsafe fn lock_fat(word: &AtomicPtr<Header>, fat: *mut FatMutex) -> Result<()> {
    // Safety: the caller's reference keeps the record alive.
    let record = unsafe { &*fat };
    loop {
        let acquired = record.state.with_mut(|s| {
            // Safety: `state` is only accessed under the inner mutex.
            unsafe {
                if (*s).held {
                    (*s).waiters += 1;
                    false
                } else {
                    (*s).held = true;
                    true
                }
            }
        });
        if acquired {
            break;
        }
        let waited = record.held_cond.wait(&record.mutex);
        record.state.with_mut(|s| {
            // Safety: the wait returned with the inner mutex re-held.
            unsafe { (*s).waiters -= 1 };
        });
        if let Err(errno) = waited {
            // Safety: inner mutex held; our reference is retired with us.
            let _ = unsafe { release_fat(word, fat) };
            return Err(Error::Os(errno));
        }
    }
    record.mutex.unlock().map_err(Error::Os)
}

/// Retires one reference, deflates the lock if that was the last reason
/// for the record to exist, and drops the inner mutex.
///
/// # Safety
///
/// The caller must hold the inner mutex and own the reference it retires.
pub(crate) unsafe fn release_fat(word: &AtomicPtr<Header>, fat: *mut FatMutex) -> Result<()> {
    // Safety: caller's reference and mutex keep the record alive.
    let last = unsafe { (*fat).refs.fetch_sub(1, Ordering::SeqCst) } == 1;
    // Safety: inner mutex still held.
    unsafe { deflate_or_unlock(word, fat, last) }
}

/// Deflates if the record has become unreferenced, then drops the inner
/// mutex. Exit path for callers that never took a reference of their own;
/// also heals a record left unreferenced by a vetoed deflation.
///
/// # Safety
///
/// The caller must hold the inner mutex of the live record `fat`.
pub(crate) unsafe fn settle_fat(word: &AtomicPtr<Header>, fat: *mut FatMutex) -> Result<()> {
    // Safety: inner mutex held.
    let idle = unsafe { (*fat).refs.load(Ordering::SeqCst) } == 0;
    // Safety: inner mutex still held.
    unsafe { deflate_or_unlock(word, fat, idle) }
}

/// # Safety
///
/// The caller must hold the inner mutex; `may_free` means it observed the
/// reference count at zero while holding it.
unsafe fn deflate_or_unlock(
    word: &AtomicPtr<Header>,
    fat: *mut FatMutex,
    may_free: bool,
) -> Result<()> {
    // The exchange must not fail spuriously: a failure means a pin was
    // installed after the zero observation, and the record must survive.
    if may_free
        && word
            .compare_exchange(
                fat.cast(),
                core::ptr::null_mut(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    {
        trace!("lock deflated");
        // Safety: unreferenced and no longer published, so this thread is
        // the only one that can still reach the record.
        match unsafe { (*fat).mutex.unlock() } {
            Ok(()) => {
                // Safety: unreachable and unlocked.
                unsafe { FatMutex::dealloc(fat) };
                Ok(())
            }
            Err(errno) => Err(Error::Os(errno)),
        }
    } else {
        // Safety: the record stays; only the inner mutex is given up.
        unsafe { (*fat).mutex.unlock() }.map_err(Error::Os)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::ThinMutex;

    // Exercises promotion, pinning and deflation against each other from
    // many threads at once; the counter checks mutual exclusion did not
    // tear, and the final word must be bare again.
    #[test]
    fn churn() {
        const THREADS: usize = 8;
        const ITERS: usize = 200;

        let lock = Arc::new(ThinMutex::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let hits = Arc::clone(&hits);
                thread::spawn(move || {
                    for n in 0..ITERS {
                        if i % 2 == 0 && n % 8 == 0 {
                            if lock.try_lock().unwrap() {
                                hits.fetch_add(1, Ordering::Relaxed);
                                lock.unlock().unwrap();
                            } else {
                                lock.lock().unwrap();
                                hits.fetch_add(1, Ordering::Relaxed);
                                lock.unlock().unwrap();
                            }
                        } else {
                            lock.lock().unwrap();
                            hits.fetch_add(1, Ordering::Relaxed);
                            lock.unlock().unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(hits.load(Ordering::Relaxed), THREADS * ITERS);
        assert!(!lock.is_inflated());
    }

    #[test]
    fn try_lock_against_inflated_word() {
        let lock = Arc::new(ThinMutex::new());
        lock.lock().unwrap();

        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock().unwrap();
                lock.unlock().unwrap();
            })
        };

        // The contender inflates the word before it parks.
        while !lock.is_inflated() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(lock.try_lock(), Ok(false));

        lock.unlock().unwrap();
        contender.join().unwrap();
        assert!(lock.try_lock().unwrap());
        lock.unlock().unwrap();
        assert!(!lock.is_inflated());
    }
}
