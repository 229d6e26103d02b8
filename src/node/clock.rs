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

//! Time source abstraction so the tick function (`node::tick`) runs
//! identically against a real timer in production and a virtual clock in
//! the simulation harness (spec.md §4.9: "behavior is identical except for
//! time source and network transport").

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of milliseconds-since-epoch wall time.
pub trait Clock {
    /// Current time, in milliseconds since the UNIX epoch.
    fn now_ms(&self) -> u64;
}

/// Real-time clock backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

/// A clock whose value is advanced explicitly, for deterministic
/// simulation and unit tests (never reachable from a production build path).
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_ms: std::cell::Cell<u64>,
}

impl ManualClock {
    /// A manual clock starting at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: std::cell::Cell::new(start_ms) }
    }

    /// Move the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.set(self.now_ms.get() + delta_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}
