// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use rstest::rstest;

use super::{Span, WINDOW_SIZE, align_up, window_span};
use crate::Error;

const PAGE: u64 = 4096;

#[rstest]
#[case(0, 0)]
#[case(1, PAGE)]
#[case(PAGE, PAGE)]
#[case(PAGE + 1, 2 * PAGE)]
fn test_align_up(#[case] value: u64, #[case] expected: u64) {
    assert_eq!(align_up(value, PAGE), expected);
}

#[rstest]
fn test_small_request_expands_to_full_window() {
    let span = window_span(0, 10, WINDOW_SIZE, None, PAGE).unwrap();
    assert_eq!(
        span,
        Span {
            offset: 0,
            size: WINDOW_SIZE
        }
    );
}

#[rstest]
fn test_expansion_is_roughly_symmetric() {
    // half a window (page aligned) is carved out in front of the request
    let span = window_span(20_000_000, 10, WINDOW_SIZE, None, PAGE).unwrap();
    assert_eq!(
        span,
        Span {
            offset: 15_802_368,
            size: WINDOW_SIZE
        }
    );
    assert_eq!(span.offset % PAGE, 0);
}

#[rstest]
fn test_window_sized_request_is_not_expanded() {
    let span = window_span(PAGE, WINDOW_SIZE, WINDOW_SIZE, None, PAGE).unwrap();
    assert_eq!(
        span,
        Span {
            offset: PAGE,
            size: WINDOW_SIZE
        }
    );
}

#[rstest]
fn test_request_wider_than_window_keeps_its_size() {
    // a request spilling over a page boundary with one-page windows
    let span = window_span(4090, 20, PAGE, None, PAGE).unwrap();
    assert_eq!(
        span,
        Span {
            offset: 0,
            size: 2 * PAGE
        }
    );
}

#[rstest]
fn test_clamped_to_known_file_size() {
    let span = window_span(50, 10, WINDOW_SIZE, Some(100), PAGE).unwrap();
    assert_eq!(
        span,
        Span {
            offset: 0,
            size: PAGE
        }
    );
}

#[rstest]
fn test_tail_clamp_keeps_page_alignment() {
    let file_size = 6 * 1024 * 1024;
    let span = window_span(5 * 1024 * 1024, 10, WINDOW_SIZE, Some(file_size), PAGE).unwrap();
    assert_eq!(span.offset, 1024 * 1024);
    assert_eq!(span.size, file_size - span.offset);
    assert_eq!(span.size % PAGE, 0);
}

#[rstest]
fn test_window_start_past_end_of_file() {
    let err = window_span(10 * 1024 * 1024, 10, WINDOW_SIZE, Some(100), PAGE).unwrap_err();
    assert!(matches!(err, Error::OffsetPastEndOfFile { .. }));
    assert_eq!(err.raw_os_error(), libc::EADDRNOTAVAIL);
}

#[rstest]
fn test_window_start_at_exact_end_of_file() {
    let err = window_span(2 * PAGE, 1, PAGE, Some(2 * PAGE), PAGE).unwrap_err();
    assert!(matches!(err, Error::OffsetPastEndOfFile { .. }));
}
