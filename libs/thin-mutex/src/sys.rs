// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin status-returning wrappers over the host pthread mutex and condition
//! variable.
//!
//! Both objects are built from the POSIX static initializers, so
//! construction is infallible and the bytes may be moved into their final
//! heap slot before first use. Teardown happens in `Drop`.

use core::cell::UnsafeCell;
use core::time::Duration;

/// Raw errno value from a failed pthread or clock call.
pub(crate) type Errno = i32;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub(crate) fn last_errno() -> Errno {
            // Safety: libc guarantees a valid thread-local errno pointer.
            unsafe { *libc::__errno_location() }
        }
    } else {
        pub(crate) fn last_errno() -> Errno {
            // Safety: as above, under the BSD spelling.
            unsafe { *libc::__error() }
        }
    }
}

/// A host blocking mutex.
#[repr(transparent)]
pub(crate) struct Mutex(UnsafeCell<libc::pthread_mutex_t>);

// Safety: the pthread mutex is a thread-shared object; all access goes
// through the raw calls below.
unsafe impl Send for Mutex {}
// Safety: as above.
unsafe impl Sync for Mutex {}

impl Mutex {
    pub(crate) const fn new() -> Mutex {
        Mutex(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER))
    }

    pub(crate) fn lock(&self) -> Result<(), Errno> {
        // Safety: the object stays valid and in place for the life of `self`.
        match unsafe { libc::pthread_mutex_lock(self.0.get()) } {
            0 => Ok(()),
            errno => Err(errno),
        }
    }

    pub(crate) fn unlock(&self) -> Result<(), Errno> {
        // Safety: as in `lock`.
        match unsafe { libc::pthread_mutex_unlock(self.0.get()) } {
            0 => Ok(()),
            errno => Err(errno),
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // Safety: exclusive access; records are only torn down unlocked.
        let errno = unsafe { libc::pthread_mutex_destroy(self.0.get()) };
        debug_assert_eq!(errno, 0, "pthread_mutex_destroy failed");
    }
}

/// A host condition variable, always used together with a [`Mutex`].
#[repr(transparent)]
pub(crate) struct Cond(UnsafeCell<libc::pthread_cond_t>);

// Safety: the pthread condition variable is a thread-shared object.
unsafe impl Send for Cond {}
// Safety: as above.
unsafe impl Sync for Cond {}

impl Cond {
    pub(crate) const fn new() -> Cond {
        Cond(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER))
    }

    pub(crate) fn signal(&self) -> Result<(), Errno> {
        // Safety: the object stays valid and in place for the life of `self`.
        match unsafe { libc::pthread_cond_signal(self.0.get()) } {
            0 => Ok(()),
            errno => Err(errno),
        }
    }

    pub(crate) fn broadcast(&self) -> Result<(), Errno> {
        // Safety: as in `signal`.
        match unsafe { libc::pthread_cond_broadcast(self.0.get()) } {
            0 => Ok(()),
            errno => Err(errno),
        }
    }

    /// Atomically releases `mutex` and parks until signalled. The mutex is
    /// held again when this returns, success or not.
    pub(crate) fn wait(&self, mutex: &Mutex) -> Result<(), Errno> {
        // Safety: the caller holds `mutex`, as pthread requires.
        match unsafe { libc::pthread_cond_wait(self.0.get(), mutex.0.get()) } {
            0 => Ok(()),
            errno => Err(errno),
        }
    }

    /// Like [`Cond::wait`] with an absolute `CLOCK_REALTIME` deadline.
    /// `Ok(false)` reports that the deadline passed without a signal.
    pub(crate) fn timedwait(&self, mutex: &Mutex, deadline: &libc::timespec) -> Result<bool, Errno> {
        // Safety: the caller holds `mutex`, as pthread requires.
        match unsafe { libc::pthread_cond_timedwait(self.0.get(), mutex.0.get(), deadline) } {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            errno => Err(errno),
        }
    }
}

impl Drop for Cond {
    fn drop(&mut self) {
        // Safety: exclusive access; no waiter can exist at teardown.
        let errno = unsafe { libc::pthread_cond_destroy(self.0.get()) };
        debug_assert_eq!(errno, 0, "pthread_cond_destroy failed");
    }
}

/// Absolute `CLOCK_REALTIME` deadline `timeout` from now.
pub(crate) fn deadline_after(timeout: Duration) -> Result<libc::timespec, Errno> {
    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;

    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: `now` is a valid out-pointer for the duration of the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &raw mut now) } != 0 {
        return Err(last_errno());
    }

    let secs = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
    let nanos = libc::c_long::try_from(timeout.subsec_nanos()).unwrap_or(NANOS_PER_SEC - 1);
    let mut tv_sec = now.tv_sec.saturating_add(secs);
    let mut tv_nsec = now.tv_nsec + nanos;
    if tv_nsec >= NANOS_PER_SEC {
        tv_sec = tv_sec.saturating_add(1);
        tv_nsec -= NANOS_PER_SEC;
    }
    Ok(libc::timespec { tv_sec, tv_nsec })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_round_trip() {
        let m = Mutex::new();
        m.lock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn deadline_nanos_carry() {
        let ts = deadline_after(Duration::new(1, 999_999_999)).unwrap();
        assert!(ts.tv_nsec < 1_000_000_000);
        assert!(ts.tv_sec > 0);
    }

    #[test]
    fn timedwait_expires() {
        let m = Mutex::new();
        let c = Cond::new();
        m.lock().unwrap();
        let deadline = deadline_after(Duration::from_millis(1)).unwrap();
        assert_eq!(c.timedwait(&m, &deadline), Ok(false));
        m.unlock().unwrap();
    }
}
