// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Collaborators the decoder core is driven by.
//!
//! On hardware the mailbox, the firmware and the blitter are provided by the host environment.
//! This module contains implementations that are not tied to any particular host and can be used
//! to run the core in isolation.

#[cfg(any(test, feature = "dummy"))]
pub mod dummy;
