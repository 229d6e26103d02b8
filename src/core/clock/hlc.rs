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

//! Hybrid Logical Clock: `(wall_ms, logical, node_id)`, totally ordered
//! lexicographically, monotone within a process and across `observe()` calls.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::NodeId;

/// HLC errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HlcError {
    /// The logical counter saturated at `u32::MAX` with wall-clock time
    /// unchanged; the caller must wait for wall time to advance.
    #[error("logical counter exhausted for current wall_ms")]
    LogicalOverflow,
}

/// A single HLC reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Wall-clock component, milliseconds since UNIX epoch.
    pub wall_ms: u64,
    /// Logical tie-breaker, bumped when wall_ms does not advance.
    pub logical: u32,
    /// Issuing node, breaks ties between equal (wall_ms, logical) pairs from
    /// distinct writers (should not happen for a single honest node).
    pub node: NodeId,
}

impl HlcTimestamp {
    /// The zero timestamp for a given node (used as a sentinel "never written").
    pub const fn zero(node: NodeId) -> Self {
        Self { wall_ms: 0, logical: 0, node }
    }
}

fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hybrid Logical Clock state for a single node.
///
/// Invariant: every value returned by [`Hlc::now`] or [`Hlc::observe`] is
/// strictly greater than every value previously returned or observed.
pub struct Hlc {
    node: NodeId,
    last: HlcTimestamp,
}

impl Hlc {
    /// Create a fresh clock for `node`, starting at the zero timestamp.
    pub fn new(node: NodeId) -> Self {
        Self { node, last: HlcTimestamp::zero(node) }
    }

    /// Restore a clock from a previously-issued timestamp (e.g. after WAL
    /// recovery), so monotonicity survives a restart.
    pub fn restore(node: NodeId, last_known: HlcTimestamp) -> Self {
        let mut last = last_known;
        last.node = node;
        Self { node, last }
    }

    /// Current highest-issued timestamp, without advancing the clock.
    pub fn last(&self) -> HlcTimestamp {
        self.last
    }

    /// Issue the next local timestamp.
    ///
    /// Advances `logical` if wall time has not moved forward (or moved
    /// backward, absorbing clock skew); otherwise resets `logical` to zero.
    pub fn now(&mut self) -> Result<HlcTimestamp, HlcError> {
        let wall = wall_now_ms().max(self.last.wall_ms);
        let next = if wall > self.last.wall_ms {
            HlcTimestamp { wall_ms: wall, logical: 0, node: self.node }
        } else {
            let logical = self
                .last
                .logical
                .checked_add(1)
                .ok_or(HlcError::LogicalOverflow)?;
            HlcTimestamp { wall_ms: self.last.wall_ms, logical, node: self.node }
        };
        self.last = next;
        Ok(next)
    }

    /// Merge a remote timestamp into local state and issue the timestamp that
    /// causally supersedes it (per the HLC receive rule).
    pub fn observe(&mut self, remote: HlcTimestamp) -> Result<HlcTimestamp, HlcError> {
        let wall = wall_now_ms().max(self.last.wall_ms).max(remote.wall_ms);

        let next = if wall > self.last.wall_ms && wall > remote.wall_ms {
            HlcTimestamp { wall_ms: wall, logical: 0, node: self.node }
        } else if wall == self.last.wall_ms && wall == remote.wall_ms {
            let logical = self
                .last
                .logical
                .max(remote.logical)
                .checked_add(1)
                .ok_or(HlcError::LogicalOverflow)?;
            HlcTimestamp { wall_ms: wall, logical, node: self.node }
        } else if wall == self.last.wall_ms {
            let logical = self.last.logical.checked_add(1).ok_or(HlcError::LogicalOverflow)?;
            HlcTimestamp { wall_ms: wall, logical, node: self.node }
        } else {
            let logical = remote.logical.checked_add(1).ok_or(HlcError::LogicalOverflow)?;
            HlcTimestamp { wall_ms: wall, logical, node: self.node }
        };

        self.last = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId::from_bytes([b; 32])
    }

    #[test]
    fn now_is_strictly_increasing() {
        let mut clock = Hlc::new(node(1));
        let mut prev = clock.now().unwrap();
        for _ in 0..100 {
            let next = clock.now().unwrap();
            assert!(next > prev, "{next:?} should be > {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn observe_never_decreases() {
        let mut clock = Hlc::new(node(1));
        let t0 = clock.now().unwrap();

        let remote = HlcTimestamp { wall_ms: t0.wall_ms + 1000, logical: 7, node: node(2) };
        let observed = clock.observe(remote).unwrap();
        assert!(observed > t0);
        assert!(observed > remote);
        assert_eq!(observed.wall_ms, remote.wall_ms);
    }

    #[test]
    fn observe_absorbs_backwards_remote() {
        let mut clock = Hlc::new(node(1));
        let t0 = clock.now().unwrap();

        let stale_remote = HlcTimestamp { wall_ms: 0, logical: 0, node: node(2) };
        let observed = clock.observe(stale_remote).unwrap();
        assert!(observed > t0);
    }

    #[test]
    fn logical_overflow_is_reported() {
        let mut clock = Hlc::new(node(1));
        clock.last = HlcTimestamp { wall_ms: 1_000, logical: u32::MAX, node: node(1) };
        // wall_now_ms() is almost certainly >> 1000ms since epoch, so `now`
        // will roll wall forward and reset logical rather than overflow; to
        // exercise the overflow branch directly we call the internal math by
        // pinning last.wall_ms far in the future instead.
        clock.last = HlcTimestamp { wall_ms: u64::MAX, logical: u32::MAX, node: node(1) };
        assert_eq!(clock.now(), Err(HlcError::LogicalOverflow));
    }
}
