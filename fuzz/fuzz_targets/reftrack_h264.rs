// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

mod common;

use cros_reftrack::encoder::Codec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Rejected configurations are skipped, any other tracker error is a bug.
    if let Err(e) = common::run_tracker(Codec::H264, data) {
        panic!("tracker failed: {:#}", e);
    }
});
