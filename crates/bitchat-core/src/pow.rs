// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Proof-of-work admission gate.
//!
//! The digest of an item doubles as its inventory key. An item is admitted
//! when its digest has at least [`required_bits`] leading zero bits; the
//! requirement grows with `log2` of the payload size in KiB, so the expected
//! number of attempts grows linearly with size.

use sha2::{Digest, Sha512};

use crate::ids::ContentId;

/// Hard ceiling so a hostile target cannot overflow the requirement.
pub const MAX_REQUIRED_BITS: u32 = 256;

/// Most leading zero bits a local search will attempt to find.
pub const MAX_MINEABLE_BITS: u32 = 48;

/// Largest per-KiB target a node accepts in its configuration. Leaves room
/// for the size term of frames up to a few MiB under [`MAX_MINEABLE_BITS`].
pub const MAX_TARGET_BITS_PER_KB: u32 = 32;

pub fn compute_digest(bytes: &[u8]) -> ContentId {
    let first = Sha512::digest(bytes);
    let second = Sha512::digest(first);
    let mut id = [0u8; 32];
    id.copy_from_slice(&second[..32]);
    ContentId(id)
}

/// Leading zero bits a digest of a `size_bytes` payload must carry.
pub fn required_bits(target_bits_per_kb: u32, size_bytes: usize) -> u32 {
    let kib = size_bytes.div_ceil(1024).max(1);
    let size_bits = usize::BITS - (kib - 1).leading_zeros();
    target_bits_per_kb
        .saturating_add(size_bits)
        .min(MAX_REQUIRED_BITS)
}

pub fn meets_target(digest: &ContentId, target_bits_per_kb: u32, size_bytes: usize) -> bool {
    digest.leading_zero_bits() >= required_bits(target_bits_per_kb, size_bytes)
}
