// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Reference counted, close-when-unused lifetime for long lived cache
//! resources.
//!
//! The whole state lives in a single atomic word: the low bits hold the
//! number of outstanding acquisitions and the two high bits record whether
//! `close()` was called and whether teardown has already fired. Every
//! transition is a single compare-and-swap, so the teardown hook runs exactly
//! once regardless of how `close()` and the final `release()` interleave.

use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CLOSED: usize = 1 << (usize::BITS - 1);
const FIRED: usize = 1 << (usize::BITS - 2);
const COUNT: usize = FIRED - 1;

#[derive(Default)]
pub struct RefCount {
    state: AtomicUsize,
}

impl RefCount {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Increments the count and returns the number of outstanding
    /// acquisitions including this one.
    pub fn acquire(&self) -> usize {
        let previous = self.state.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous & COUNT != COUNT, "reference count overflow");
        (previous & COUNT) + 1
    }

    /// Decrements the count. Returns true if this call is the one that must
    /// run teardown, which happens when the object was already closed and
    /// this was the last outstanding acquisition.
    ///
    /// Releasing more times than acquired is a programming error. It panics
    /// in debug builds and is otherwise ignored without touching the state.
    pub fn release(&self) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & COUNT == 0 {
                    return None;
                }
                let next = state - 1;
                if next == CLOSED {
                    Some(CLOSED | FIRED)
                } else {
                    Some(next)
                }
            });

        match result {
            Ok(previous) => previous - 1 == CLOSED,
            Err(_) => {
                debug_assert!(false, "release without matching acquire");
                false
            }
        }
    }

    /// Marks the object closed. Returns true if teardown must run now because
    /// nothing is currently acquired. Repeated calls return false.
    pub fn close(&self) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state & CLOSED != 0 {
                    None
                } else if state & COUNT == 0 {
                    Some(CLOSED | FIRED)
                } else {
                    Some(state | CLOSED)
                }
            });

        matches!(result, Ok(previous) if previous & COUNT == 0)
    }

    pub fn count(&self) -> usize {
        self.state.load(Ordering::Acquire) & COUNT
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLOSED != 0
    }

    /// True once teardown has been triggered.
    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) & FIRED != 0
    }
}

/// A resource whose teardown is deferred until it has been closed and every
/// acquisition has been released.
pub trait CacheObject {
    fn refs(&self) -> &RefCount;

    /// Runs exactly once, after `close()` and the last `release()`.
    fn on_closed(&self);

    fn acquire(&self) -> &Self
    where
        Self: Sized,
    {
        self.refs().acquire();
        self
    }

    fn release(&self) {
        if self.refs().release() {
            self.on_closed();
        }
    }

    fn close(&self) {
        if self.refs().close() {
            self.on_closed();
        }
    }

    fn closed(&self) -> bool {
        self.refs().is_closed()
    }
}

/// A shared object held acquired. The acquisition is released when the
/// handle is dropped, so a closed object is only torn down once every handle
/// is gone.
pub struct Acquired<T: CacheObject> {
    object: Arc<T>,
}

impl<T: CacheObject> Acquired<T> {
    pub fn new(object: Arc<T>) -> Self {
        object.refs().acquire();
        Self { object }
    }

    /// True if both handles refer to the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.object, &other.object)
    }
}

impl<T: CacheObject> Clone for Acquired<T> {
    fn clone(&self) -> Self {
        Self::new(self.object.clone())
    }
}

impl<T: CacheObject> Deref for Acquired<T> {
    type Target = Arc<T>;

    fn deref(&self) -> &Arc<T> {
        &self.object
    }
}

impl<T: CacheObject + core::fmt::Display> core::fmt::Display for Acquired<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&*self.object, f)
    }
}

impl<T: CacheObject> Drop for Acquired<T> {
    fn drop(&mut self) {
        self.object.release();
    }
}
