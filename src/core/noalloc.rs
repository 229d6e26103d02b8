// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Frozen-allocator guard: a debug-only tripwire marking the point after
//! which the steady-state tick loop must not grow the heap. Bounded types
//! (`BoundedString`, `Catalog`, `PeerBook`, the replay window) already avoid
//! unbounded growth; this guard catches a regression that creeps one back in.

use std::sync::atomic::{AtomicBool, Ordering};

static FROZEN: AtomicBool = AtomicBool::new(false);

/// Mark startup complete. Called once, after the catalog/WAL/peer book have
/// finished their one-time recovery allocations.
pub fn freeze() {
    FROZEN.store(true, Ordering::SeqCst);
}

/// True once [`freeze`] has been called.
pub fn is_frozen() -> bool {
    FROZEN.load(Ordering::SeqCst)
}

/// Assert (debug builds only) that the allocator has not yet been frozen —
/// call at any one-time startup allocation site to document the invariant
/// and catch it firing after `freeze()` during development/testing.
#[macro_export]
macro_rules! debug_assert_not_frozen {
    () => {
        debug_assert!(
            !$crate::core::noalloc::is_frozen(),
            "unexpected allocation after startup freeze"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unfrozen_and_freezes_once() {
        assert!(!is_frozen());
        freeze();
        assert!(is_frozen());
    }
}
