// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

use crate::error::{Error, Result};
use crate::inflate;
use crate::loom::Ordering;
use crate::mutex::{MutexGuard, ThinMutex};
use crate::sys;

/// A condition variable paired with [`ThinMutex`] locks.
///
/// Waiting releases the lock, parks until notified, and holds the lock
/// again on return. A wait forces the lock to inflate, since parking needs
/// the host primitives the fat record carries; the record stays pinned by
/// the waiter for the whole wait and is reclaimed like any other once the
/// waiters are gone.
///
/// The same condition variable must not be used with two different locks at
/// the same time.
pub struct Condvar {
    cond: sys::Cond,
}

// Safety: the host condition variable is a thread-shared object.
unsafe impl Send for Condvar {}
// Safety: as above.
unsafe impl Sync for Condvar {}

impl Condvar {
    #[must_use]
    pub const fn new() -> Condvar {
        Condvar {
            cond: sys::Cond::new(),
        }
    }

    /// Wakes one thread parked in a wait on this condition variable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when the host signal call fails.
    pub fn notify_one(&self) -> Result<()> {
        self.cond.signal().map_err(Error::Os)
    }

    /// Wakes every thread parked in a wait on this condition variable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when the host broadcast call fails.
    pub fn notify_all(&self) -> Result<()> {
        self.cond.broadcast().map_err(Error::Os)
    }

    /// Releases the guarded lock and parks until notified; the lock is held
    /// again when this returns. Spurious wakeups are possible, so callers
    /// re-check their condition in a loop.
    ///
    /// The exclusive borrow keeps the guarded data out of reach while the
    /// lock is released under the caller.
    ///
    /// # Errors
    ///
    /// As [`ThinMutex::wait`].
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> Result<()> {
        MutexGuard::mutex(guard).raw().wait(self)
    }

    /// Like [`Condvar::wait`] with a timeout.
    ///
    /// # Errors
    ///
    /// As [`ThinMutex::wait_timeout`].
    pub fn wait_timeout<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<()> {
        MutexGuard::mutex(guard).raw().wait_timeout(self, timeout)
    }
}

impl Default for Condvar {
    #[inline]
    fn default() -> Condvar {
        Condvar::new()
    }
}

/// The wait protocol shared by the timed and untimed entry points.
///
/// The caller must hold `lock`. Its holder reference on the fat record is
/// carried through the park (`held` is cleared without touching the count)
/// and turns back into the holder reference when the lock is re-taken, so
/// the record outlives the whole wait with no refcount traffic at either
/// boundary.
pub(crate) fn wait_inner(
    cond: &Condvar,
    lock: &ThinMutex,
    deadline: Option<libc::timespec>,
) -> Result<()> {
    let word = lock.word();
    let fat = loop {
        let cur = word.load(Ordering::SeqCst);
        if cur.is_null() {
            return Err(Error::NotOwner);
        }
        // Safety: `cur` was loaded from this lock's word.
        let Some(fat) = (unsafe { inflate::get_fat(word, cur) })? else {
            continue;
        };
        break fat;
    };
    // Safety: the inner mutex held since `get_fat`, and then the carried
    // holder reference, keep the record alive for the rest of the call.
    let record = unsafe { &*fat };

    let (held, waiters) = record.state.with(|s| {
        // Safety: `state` is only accessed under the inner mutex.
        unsafe { ((*s).held, (*s).waiters) }
    });
    if !held {
        // Safety: inner mutex held; no reference was taken.
        unsafe { inflate::settle_fat(word, fat) }?;
        return Err(Error::NotOwner);
    }

    // A parked acquirer may take the lock while this thread is off-CPU.
    if waiters > 0 {
        if let Err(errno) = record.held_cond.signal() {
            // Safety: inner mutex held; nothing has been given up yet.
            let _ = unsafe { inflate::settle_fat(word, fat) };
            return Err(Error::Os(errno));
        }
    }
    record.state.with_mut(|s| {
        // Safety: `state` is only accessed under the inner mutex.
        unsafe { (*s).held = false };
    });

    let outcome = match deadline {
        None => cond.cond.wait(&record.mutex).map(|()| true),
        Some(deadline) => cond.cond.timedwait(&record.mutex, &deadline),
    };

    match outcome {
        Ok(notified) => {
            // Re-take the lock with the carried reference; a failure here
            // outranks a timeout.
            // Safety: the wait returned with the inner mutex re-held, and
            // this thread still owns its reference on the record.
            unsafe { inflate::lock_fat(word, fat) }?;
            if notified { Ok(()) } else { Err(Error::TimedOut) }
        }
        Err(errno) => {
            // The lock must appear held again when a wait fails outright,
            // so cleanup running above this frame finds it consistent.
            record.state.with_mut(|s| {
                // Safety: the wait re-held the inner mutex even on failure.
                unsafe { (*s).held = true };
            });
            let _ = record.mutex.unlock();
            Err(Error::Os(errno))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));

        let mut guard = pair.0.lock().unwrap();
        let signaller = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                let mut flag = pair.0.lock().unwrap();
                *flag = true;
                pair.1.notify_one().unwrap();
            })
        };

        while !*guard {
            pair.1.wait(&mut guard).unwrap();
        }
        assert!(*guard);
        drop(guard);
        signaller.join().unwrap();
        assert!(!pair.0.raw().is_inflated());
    }

    #[test]
    fn timed_wait_expires() {
        let lock = ThinMutex::new();
        let cond = Condvar::new();

        lock.lock().unwrap();
        assert_eq!(
            lock.wait_timeout(&cond, Duration::from_millis(1)),
            Err(Error::TimedOut)
        );
        // The lock came back held and everything still works.
        lock.unlock().unwrap();
        lock.lock().unwrap();
        lock.unlock().unwrap();
        assert!(!lock.is_inflated());
    }

    #[test]
    fn timed_wait_notified_in_time() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));

        let mut guard = pair.0.lock().unwrap();
        let signaller = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                let mut flag = pair.0.lock().unwrap();
                *flag = true;
                pair.1.notify_one().unwrap();
            })
        };

        while !*guard {
            pair.1
                .wait_timeout(&mut guard, Duration::from_secs(60))
                .unwrap();
        }
        drop(guard);
        signaller.join().unwrap();
    }

    #[test]
    fn wait_without_lock() {
        let lock = ThinMutex::new();
        let cond = Condvar::new();
        assert_eq!(lock.wait(&cond), Err(Error::NotOwner));

        // Also after the lock has seen use.
        lock.lock().unwrap();
        lock.unlock().unwrap();
        assert_eq!(
            lock.wait_timeout(&cond, Duration::from_millis(1)),
            Err(Error::NotOwner)
        );
    }

    #[test]
    fn notify_all_wakes_everyone() {
        const WAITERS: usize = 4;

        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let pair = Arc::clone(&pair);
                thread::spawn(move || {
                    let mut guard = pair.0.lock().unwrap();
                    while !*guard {
                        pair.1.wait(&mut guard).unwrap();
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        {
            let mut flag = pair.0.lock().unwrap();
            *flag = true;
        }
        pair.1.notify_all().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!pair.0.raw().is_inflated());
    }
}
