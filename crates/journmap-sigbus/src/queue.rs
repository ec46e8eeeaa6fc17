// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::c_void;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

#[cfg(test)]
#[path = "./queue_test.rs"]
mod queue_test;

/// Capacity of the fault queue. The handler invalidates one page per fault
/// and consumers are expected to drain eagerly, so the queue stays tiny in
/// practice; filling it up means faults arrived faster than anyone drained
/// them and addresses were lost.
pub(crate) const QUEUE_MAX: usize = 64;

static QUEUE: [AtomicPtr<c_void>; QUEUE_MAX] = [const { AtomicPtr::new(null_mut()) }; QUEUE_MAX];
static QUEUED: AtomicUsize = AtomicUsize::new(0);
static OVERFLOW: AtomicBool = AtomicBool::new(false);

/// One drain step of the process-wide fault queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop {
    /// A recorded fault address.
    Fault(*mut c_void),
    /// Nothing is queued.
    Empty,
    /// Fault addresses were dropped because the queue was full. Sticky
    /// until [`clear`] is called; consumers cannot trust their bookkeeping
    /// after this.
    Overflow,
}

/// Record a faulting address.
///
/// Async-signal-safe: touches nothing but process statics, through atomic
/// loads and stores. Also the fault-injection seam for tests.
pub fn push(addr: *mut c_void) {
    if addr.is_null() {
        // a null fault address can never be attributed to a mapping;
        // report it as an overflow so consumers treat it as fatal
        OVERFLOW.store(true, Ordering::SeqCst);
        return;
    }

    // an address that is already queued does not need a second entry
    for slot in &QUEUE {
        if slot.load(Ordering::SeqCst) == addr {
            return;
        }
    }

    for slot in &QUEUE {
        if slot
            .compare_exchange(null_mut(), addr, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            QUEUED.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }

    OVERFLOW.store(true, Ordering::SeqCst);
}

/// Take one recorded address off the queue, without blocking.
pub fn pop() -> Pop {
    if OVERFLOW.load(Ordering::SeqCst) {
        return Pop::Overflow;
    }
    if QUEUED.load(Ordering::SeqCst) == 0 {
        return Pop::Empty;
    }
    for slot in &QUEUE {
        let addr = slot.swap(null_mut(), Ordering::SeqCst);
        if !addr.is_null() {
            QUEUED.fetch_sub(1, Ordering::SeqCst);
            return Pop::Fault(addr);
        }
    }
    // a push may still be in flight; the next drain will see it
    Pop::Empty
}

/// Forget all queued addresses and any overflow condition.
pub fn clear() {
    for slot in &QUEUE {
        slot.store(null_mut(), Ordering::SeqCst);
    }
    QUEUED.store(0, Ordering::SeqCst);
    OVERFLOW.store(false, Ordering::SeqCst);
}
