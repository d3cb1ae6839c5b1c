//! A reader-writer lock with optional reader reentrancy.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::{MachiError, Result};

/// A lock admitting either one exclusive writer or any number of shared
/// readers.
///
/// Readers are tracked per thread with a hold count, so in reentrant mode
/// (the default) a thread may take nested shared guards; each guard must
/// still be released. In non-reentrant mode a nested [`read`](Self::read)
/// on the same thread fails with [`MachiError::NotReentrant`].
///
/// Fairness is not guaranteed: a waiting writer does not block new
/// readers from acquiring the lock.
pub struct RwLock<T> {
    state: Mutex<LockState>,
    cond: Condvar,
    reentrant: bool,
    data: UnsafeCell<T>,
}

struct LockState {
    writer: Option<ThreadId>,
    /// Shared hold count per reader thread.
    readers: HashMap<ThreadId, usize>,
}

// Same pairings as `std::sync::RwLock`.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a reader-reentrant lock wrapping the supplied data.
    pub fn new(data: T) -> RwLock<T> {
        RwLock::with_reentrancy(data, true)
    }

    /// Creates a lock that rejects nested shared guards on one thread.
    pub fn non_reentrant(data: T) -> RwLock<T> {
        RwLock::with_reentrancy(data, false)
    }

    fn with_reentrancy(data: T, reentrant: bool) -> RwLock<T> {
        RwLock {
            state: Mutex::new(LockState {
                writer: None,
                readers: HashMap::new(),
            }),
            cond: Condvar::new(),
            reentrant,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires shared access, blocking while a writer holds the lock.
    pub fn read(&self) -> Result<ReadGuard<'_, T>> {
        let mut state = self.state.lock().unwrap();
        while state.writer.is_some() {
            state = self.cond.wait(state).unwrap();
        }
        let id = thread::current().id();
        if !self.reentrant && state.readers.contains_key(&id) {
            return Err(MachiError::NotReentrant);
        }
        *state.readers.entry(id).or_insert(0) += 1;
        Ok(ReadGuard {
            lock: self,
            data: self.data.get(),
        })
    }

    /// Acquires exclusive access, blocking while any guard is live.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.writer.is_some() || !state.readers.is_empty() {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = Some(thread::current().id());
        WriteGuard {
            lock: self,
            data: self.data.get(),
        }
    }

    /// Consumes the lock, returning the wrapped data.
    pub fn into_inner(self) -> T {
        // No guard can be live once the lock itself is owned.
        self.data.into_inner()
    }
}

/// Shared access to the data behind an [`RwLock`].
///
/// Dropping the guard releases one shared hold and wakes all waiters.
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    // Raw pointer keeps the guard on the acquiring thread; release
    // bookkeeping is keyed by thread id.
    data: *const T,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        let id = thread::current().id();
        if let Some(held) = state.readers.get_mut(&id) {
            *held -= 1;
            if *held == 0 {
                state.readers.remove(&id);
            }
        }
        drop(state);
        self.lock.cond.notify_all();
    }
}

/// Exclusive access to the data behind an [`RwLock`].
///
/// Dropping the guard releases the writer and wakes all waiters.
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    data: *mut T,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.data }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer = None;
        drop(state);
        self.lock.cond.notify_all();
    }
}
