// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::ffi::c_void;

use rstest::rstest;
use serial_test::serial;

use super::{Pop, QUEUE_MAX, clear, pop, push};

fn addr(value: usize) -> *mut c_void {
    value as *mut c_void
}

#[rstest]
#[serial(sigbus)]
fn test_pop_empty() {
    clear();
    assert_eq!(pop(), Pop::Empty);
}

#[rstest]
#[serial(sigbus)]
fn test_push_pop_roundtrip() {
    clear();
    push(addr(0x1000));
    push(addr(0x2000));

    let mut drained = vec![];
    while let Pop::Fault(a) = pop() {
        drained.push(a as usize);
    }
    drained.sort_unstable();
    assert_eq!(drained, vec![0x1000, 0x2000]);
    assert_eq!(pop(), Pop::Empty);
}

#[rstest]
#[serial(sigbus)]
fn test_push_deduplicates() {
    clear();
    push(addr(0x1000));
    push(addr(0x1000));
    push(addr(0x1000));

    assert_eq!(pop(), Pop::Fault(addr(0x1000)));
    assert_eq!(pop(), Pop::Empty);
}

#[rstest]
#[serial(sigbus)]
fn test_overflow_is_sticky() {
    clear();
    for i in 0..QUEUE_MAX + 1 {
        push(addr(0x1000 + i * 0x1000));
    }

    assert_eq!(pop(), Pop::Overflow);
    assert_eq!(pop(), Pop::Overflow, "overflow should persist until cleared");

    clear();
    assert_eq!(pop(), Pop::Empty);
}

#[rstest]
#[serial(sigbus)]
fn test_null_address_reports_overflow() {
    clear();
    push(std::ptr::null_mut());
    assert_eq!(pop(), Pop::Overflow);
    clear();
}
