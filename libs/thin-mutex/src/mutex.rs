// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::time::Duration;
use core::{fmt, ptr};

use crate::condvar::{self, Condvar};
use crate::error::{Error, Result};
use crate::inflate::{self, HELD};
use crate::loom::{AtomicPtr, Ordering, UnsafeCell, loom_const_fn};
use crate::record::{FatMutex, Header, Kind};
use crate::sys;

/// A blocking mutual exclusion primitive the size of one pointer.
///
/// An unheld or uncontended `ThinMutex` is nothing but its word; the first
/// contended acquire or condition wait inflates it into a heap record
/// carrying a host mutex and condition variable, and the record is freed
/// again once the last thread with a stake in it leaves. Tens of thousands
/// of instances therefore cost one word each as long as they stay quiet.
///
/// This is the raw, status-returning form; [`Mutex`] wraps it with data and
/// RAII guards. All operations are callable from any thread, but release
/// and wait are only meaningful from the thread that holds the lock:
/// holdership is tracked as a flag, not a thread id, so a release from a
/// different thread while the lock is held cannot be told apart from the
/// owner and corrupts the exclusion discipline (never memory safety).
pub struct ThinMutex {
    word: AtomicPtr<Header>,
}

// Safety: the word is atomic and every record behind it is designed for
// multi-threaded access.
unsafe impl Send for ThinMutex {}
// Safety: as above.
unsafe impl Sync for ThinMutex {}

impl ThinMutex {
    loom_const_fn! {
        /// Creates an unheld lock.
        ///
        /// The all-zero bit pattern is the same state, so zeroed static
        /// storage is a valid lock without any call having run.
        #[must_use]
        pub const fn new() -> ThinMutex {
            ThinMutex {
                word: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    pub(crate) fn word(&self) -> &AtomicPtr<Header> {
        &self.word
    }

    /// Acquires the lock, parking the thread while another holds it.
    ///
    /// The uncontended path is a single CAS and never allocates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when a host mutex or condition-variable call
    /// fails underneath, with the raw errno preserved.
    pub fn lock(&self) -> Result<()> {
        if self
            .word
            .compare_exchange(ptr::null_mut(), HELD, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        self.lock_slow()
    }

    #[cold]
    fn lock_slow(&self) -> Result<()> {
        loop {
            let cur = self.word.load(Ordering::SeqCst);
            if cur.is_null() {
                if self
                    .word
                    .compare_exchange(cur, HELD, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            // Safety: `cur` was loaded from this lock's word.
            let Some(fat) = (unsafe { inflate::get_fat(&self.word, cur) })? else {
                continue;
            };
            // Take the reference that stands for this thread from here on:
            // a parked waiter's until `held` clears, the holder's after.
            // Safety: `get_fat` left the inner mutex held.
            unsafe { (*fat).refs.fetch_add(1, Ordering::SeqCst) };
            // Safety: inner mutex held, reference owned.
            return unsafe { inflate::lock_fat(&self.word, fat) };
        }
    }

    /// Acquires the lock if nobody holds it. `Ok(false)` reports a held
    /// lock; the thread never parks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when a host mutex call fails while an
    /// inflated lock is consulted.
    pub fn try_lock(&self) -> Result<bool> {
        match self
            .word
            .compare_exchange(ptr::null_mut(), HELD, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(true),
            Err(cur) if cur.addr() == HELD.addr() => Ok(false),
            Err(_) => self.try_lock_slow(),
        }
    }

    #[cold]
    fn try_lock_slow(&self) -> Result<bool> {
        loop {
            let cur = self.word.load(Ordering::SeqCst);
            if cur.is_null() {
                if self
                    .word
                    .compare_exchange(cur, HELD, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(true);
                }
                continue;
            }
            if cur.addr() == HELD.addr() {
                return Ok(false);
            }
            // Safety: `cur` was loaded from this lock's word.
            let Some(fat) = (unsafe { inflate::get_fat(&self.word, cur) })? else {
                continue;
            };
            // Safety: the inner mutex held since `get_fat` keeps the
            // record alive.
            let record = unsafe { &*fat };
            let held = record.state.with(|s| {
                // Safety: `state` is only accessed under the inner mutex.
                unsafe { (*s).held }
            });
            if held {
                // Safety: inner mutex held; no reference was taken.
                unsafe { inflate::settle_fat(&self.word, fat) }?;
                return Ok(false);
            }
            record.state.with_mut(|s| {
                // Safety: as above.
                unsafe { (*s).held = true };
            });
            // The holder's reference.
            record.refs.fetch_add(1, Ordering::SeqCst);
            record.mutex.unlock().map_err(Error::Os)?;
            return Ok(true);
        }
    }

    /// Releases the lock, waking one parked acquirer if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOwner`] when the lock is not held at all, and
    /// [`Error::Os`] when a host call fails.
    pub fn unlock(&self) -> Result<()> {
        if self
            .word
            .compare_exchange(HELD, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(());
        }
        self.unlock_slow()
    }

    #[cold]
    fn unlock_slow(&self) -> Result<()> {
        loop {
            let cur = self.word.load(Ordering::SeqCst);
            if cur.is_null() {
                return Err(Error::NotOwner);
            }
            if cur.addr() == HELD.addr() {
                if self
                    .word
                    .compare_exchange(cur, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            // Safety: `cur` was loaded from this lock's word.
            let Some(fat) = (unsafe { inflate::get_fat(&self.word, cur) })? else {
                continue;
            };
            // Safety: the inner mutex held since `get_fat` keeps the
            // record alive.
            let record = unsafe { &*fat };
            let (held, waiters) = record.state.with_mut(|s| {
                // Safety: `state` is only accessed under the inner mutex.
                unsafe {
                    if (*s).held {
                        (*s).held = false;
                        (true, (*s).waiters)
                    } else {
                        (false, 0)
                    }
                }
            });
            if !held {
                // Safety: inner mutex held; no reference was taken.
                unsafe { inflate::settle_fat(&self.word, fat) }?;
                return Err(Error::NotOwner);
            }
            let signalled = if waiters > 0 {
                record.held_cond.signal()
            } else {
                Ok(())
            };
            // Retire the holder's reference; deflates when it was the last.
            // Safety: inner mutex held, reference owned.
            let released = unsafe { inflate::release_fat(&self.word, fat) };
            return match signalled {
                Err(errno) => Err(Error::Os(errno)),
                Ok(()) => released,
            };
        }
    }

    /// Atomically releases the lock and parks on `cond` until notified.
    ///
    /// The lock is held again when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOwner`] when the lock is not held, and
    /// [`Error::Os`] when a host call fails; the lock is made to appear
    /// held again before a wait failure surfaces.
    pub fn wait(&self, cond: &Condvar) -> Result<()> {
        condvar::wait_inner(cond, self, None)
    }

    /// Like [`ThinMutex::wait`] with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] when the deadline passes before a
    /// notification arrives, reported only after the lock has been
    /// re-acquired; otherwise as [`ThinMutex::wait`].
    pub fn wait_timeout(&self, cond: &Condvar, timeout: Duration) -> Result<()> {
        let deadline = sys::deadline_after(timeout).map_err(Error::Os)?;
        condvar::wait_inner(cond, self, Some(deadline))
    }

    #[cfg(test)]
    pub(crate) fn is_inflated(&self) -> bool {
        !inflate::is_bare(self.word.load(Ordering::SeqCst))
    }
}

impl Drop for ThinMutex {
    fn drop(&mut self) {
        let cur = self.word.load(Ordering::SeqCst);
        if !inflate::is_bare(cur) {
            // Exclusive access means no operation is in flight, so no pins
            // exist and the word reaches the fat record directly, with its
            // inner mutex unlocked.
            // Safety: see above; nothing can reach the record anymore.
            unsafe {
                debug_assert_eq!(Header::kind_of(cur), Kind::Fat);
                FatMutex::dealloc(cur.cast::<FatMutex>());
            }
        }
    }
}

impl Default for ThinMutex {
    #[inline]
    fn default() -> ThinMutex {
        ThinMutex::new()
    }
}

impl fmt::Debug for ThinMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cur = self.word.load(Ordering::SeqCst);
        let state = if cur.is_null() {
            "unlocked"
        } else if cur.addr() == HELD.addr() {
            "locked"
        } else {
            "inflated"
        };
        f.debug_struct("ThinMutex")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

// The `lock_api` signatures cannot carry errors, so host failures, which
// cannot occur on a correctly used default mutex, panic instead.
#[cfg(not(loom))]
// Safety: `ThinMutex` provides mutual exclusion between `lock` and
// `unlock` as the trait demands, from any thread.
unsafe impl lock_api::RawMutex for ThinMutex {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "lock_api requires an initializer constant"
    )]
    const INIT: Self = ThinMutex::new();
    type GuardMarker = lock_api::GuardSend;

    /// # Panics
    ///
    /// Panics when [`ThinMutex::lock`] reports a host error.
    fn lock(&self) {
        if let Err(err) = ThinMutex::lock(self) {
            panic!("thin mutex lock failed: {err}");
        }
    }

    fn try_lock(&self) -> bool {
        ThinMutex::try_lock(self).unwrap_or(false)
    }

    /// # Panics
    ///
    /// Panics when [`ThinMutex::unlock`] reports a host error or a release
    /// of a lock that is not held.
    unsafe fn unlock(&self) {
        if let Err(err) = ThinMutex::unlock(self) {
            panic!("thin mutex unlock failed: {err}");
        }
    }
}

/// A mutual exclusion primitive useful for protecting shared data, built
/// on [`ThinMutex`].
///
/// The data can only be accessed through the RAII guards returned from
/// [`Mutex::lock`] and [`Mutex::try_lock`], which guarantees the data is
/// only ever accessed when the lock is held. Idle instances cost one word
/// on top of the data.
pub struct Mutex<T: ?Sized> {
    raw: ThinMutex,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a mutex. When this
/// structure is dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be accessed through this guard via
/// its `Deref` and `DerefMut` implementations.
#[clippy::has_significant_drop]
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the lock serializes access to the data, which itself moves
// between threads.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// Safety: as above.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    loom_const_fn! {
        pub const fn new(val: T) -> Mutex<T> {
            Mutex {
                raw: ThinMutex::new(),
                data: UnsafeCell::new(val),
            }
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Creates a `MutexGuard` without checking if the lock is held.
    ///
    /// # Safety
    ///
    /// This method must only be called if the thread logically holds the
    /// lock and no guard for it exists already.
    #[inline]
    unsafe fn make_guard_unchecked(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Acquires the mutex, parking the current thread until it is able to
    /// do so, and returns a guard scoping the access to the data.
    ///
    /// # Errors
    ///
    /// As [`ThinMutex::lock`].
    #[inline]
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.raw.lock()?;
        // Safety: the lock is held, as required.
        Ok(unsafe { self.make_guard_unchecked() })
    }

    /// Attempts to acquire the mutex without parking; `Ok(None)` reports a
    /// held lock.
    ///
    /// # Errors
    ///
    /// As [`ThinMutex::try_lock`].
    #[inline]
    pub fn try_lock(&self) -> Result<Option<MutexGuard<'_, T>>> {
        if self.raw.try_lock()? {
            // Safety: the lock is held, as required.
            Ok(Some(unsafe { self.make_guard_unchecked() }))
        } else {
            Ok(None)
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no locking needs to
    /// take place.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: the mutable borrow statically guarantees sole access.
        self.data.with_mut(|data| unsafe { &mut *data })
    }

    /// The underlying raw lock.
    #[inline]
    pub fn raw(&self) -> &ThinMutex {
        &self.raw
    }
}

impl<T: Default> Default for Mutex<T> {
    #[inline]
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    #[inline]
    fn from(t: T) -> Mutex<T> {
        Mutex::new(t)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Ok(Some(guard)) => f
                .debug_struct("Mutex")
                .field("data", &&*guard)
                .finish_non_exhaustive(),
            _ => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }

                f.debug_struct("Mutex")
                    .field("data", &LockedPlaceholder)
                    .finish_non_exhaustive()
            }
        }
    }
}

// Safety: holding a guard only permits the access a `&T` would.
unsafe impl<'a, T: ?Sized + Sync + 'a> Sync for MutexGuard<'a, T> {}

impl<'a, T: ?Sized + 'a> MutexGuard<'a, T> {
    /// Returns a reference to the original `Mutex` object.
    pub fn mutex(s: &Self) -> &'a Mutex<T> {
        s.mutex
    }
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: a guard exists only while the lock is held.
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a guard exists only while the lock is held.
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // A guard can only exist for a held lock, so the only conceivable
        // failure is a host error with nowhere to go.
        let _ = self.mutex.raw.unlock();
    }
}

impl<'a, T: fmt::Debug + ?Sized + 'a> fmt::Debug for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: fmt::Display + ?Sized + 'a> fmt::Display for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(not(loom))]
static_assertions::assert_eq_size!(ThinMutex, usize);
static_assertions::assert_impl_all!(ThinMutex: Send, Sync);
static_assertions::assert_impl_all!(Mutex<alloc::vec::Vec<u8>>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RECORD_ALLOCS;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use std::time::Duration;

    #[derive(Eq, PartialEq, Debug)]
    struct NonCopy(i32);

    #[test]
    fn smoke() {
        let m = ThinMutex::new();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn static_storage_needs_no_setup() {
        static M: ThinMutex = ThinMutex::new();
        M.lock().unwrap();
        M.unlock().unwrap();
        assert!(M.try_lock().unwrap());
        M.unlock().unwrap();
    }

    #[test]
    fn unlock_without_lock() {
        let m = ThinMutex::new();
        assert_eq!(m.unlock(), Err(Error::NotOwner));
        // Still a perfectly good lock afterwards.
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn try_lock_on_bare_word() {
        let m = ThinMutex::new();
        assert!(m.try_lock().unwrap());
        assert!(!m.try_lock().unwrap());
        m.unlock().unwrap();
        assert!(m.try_lock().unwrap());
        m.unlock().unwrap();
    }

    #[test]
    fn uncontended_paths_never_allocate() {
        let m = ThinMutex::new();
        let before = RECORD_ALLOCS.with(std::cell::Cell::get);
        for _ in 0..100 {
            m.lock().unwrap();
            assert!(!m.is_inflated());
            m.unlock().unwrap();
            assert!(m.try_lock().unwrap());
            m.unlock().unwrap();
        }
        assert_eq!(RECORD_ALLOCS.with(std::cell::Cell::get), before);
    }

    #[test]
    fn contended_counter() {
        const WORKERS: usize = 10;

        let lock = Arc::new(ThinMutex::new());
        let in_critical = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        lock.lock().unwrap();
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let in_critical = Arc::clone(&in_critical);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    lock.lock().unwrap();
                    assert!(!in_critical.swap(true, std::sync::atomic::Ordering::SeqCst));
                    thread::sleep(Duration::from_millis(1));
                    in_critical.store(false, std::sync::atomic::Ordering::SeqCst);
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    lock.unlock().unwrap();
                })
            })
            .collect();
        lock.unlock().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), WORKERS);
        assert!(!in_critical.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!lock.is_inflated());
    }

    #[test]
    fn guarded_counter() {
        const WORKERS: usize = 8;
        const ITERS: usize = 100;

        let m = Arc::new(Mutex::new(0_usize));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        *m.lock().unwrap() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*m.lock().unwrap(), WORKERS * ITERS);
    }

    #[test]
    fn try_lock_guard() {
        let mutex = Mutex::new(42);

        let a = mutex.try_lock().unwrap();
        assert_eq!(a.as_ref().map(|r| **r), Some(42));

        let b = mutex.try_lock().unwrap();
        assert!(b.is_none());

        drop(a);
        let c = mutex.try_lock().unwrap();
        assert_eq!(c.as_ref().map(|r| **r), Some(42));
    }

    #[test]
    fn test_into_inner() {
        let m = Mutex::new(NonCopy(10));
        assert_eq!(m.into_inner(), NonCopy(10));
    }

    #[test]
    fn test_into_inner_drop() {
        struct Foo(Arc<AtomicUsize>);
        impl Drop for Foo {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let num_drops = Arc::new(AtomicUsize::new(0));
        let m = Mutex::new(Foo(num_drops.clone()));
        assert_eq!(num_drops.load(std::sync::atomic::Ordering::SeqCst), 0);
        {
            let _inner = m.into_inner();
            assert_eq!(num_drops.load(std::sync::atomic::Ordering::SeqCst), 0);
        }
        assert_eq!(num_drops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_mut() {
        let mut m = Mutex::new(NonCopy(10));
        *m.get_mut() = NonCopy(20);
        assert_eq!(m.into_inner(), NonCopy(20));
    }

    #[test]
    fn debug_states() {
        let m = ThinMutex::new();
        assert_eq!(format!("{m:?}"), "ThinMutex { state: \"unlocked\", .. }");
        m.lock().unwrap();
        assert_eq!(format!("{m:?}"), "ThinMutex { state: \"locked\", .. }");
        m.unlock().unwrap();

        let m = Mutex::new(1);
        assert_eq!(format!("{m:?}"), "Mutex { data: 1, .. }");
        let g = m.lock().unwrap();
        assert_eq!(format!("{m:?}"), "Mutex { data: <locked>, .. }");
        drop(g);
    }

    #[test]
    fn lock_api_adapter() {
        let m: lock_api::Mutex<ThinMutex, i32> = lock_api::Mutex::new(5);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 6);
    }
}
