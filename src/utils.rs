// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small helpers shared by the frame buffer list, the stream buffer and the transport.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up<T>(value: T, alignment: T) -> T
where
    T: Copy
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::BitAnd<Output = T>
        + std::ops::Not<Output = T>
        + From<u8>,
{
    (value + alignment - T::from(1)) & !(alignment - T::from(1))
}

/// Rounds `value` up to the next multiple of `alignment`, a power of two, or returns `None` if the
/// result does not fit in a `u32`.
pub fn checked_align_up(value: u32, alignment: u32) -> Option<u32> {
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// A panicking client thread must not wedge the deferred procedure call, which takes the same
/// locks to deliver firmware events.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
