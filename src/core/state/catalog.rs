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

//! Fixed-capacity service catalog with deterministic last-write-wins merge.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::types::{NodeId, ServiceName, ServiceRecord};

/// Compile-time catalog capacity (spec.md §3: "Fixed slab of up to
/// `MAX_SERVICES` (compile-time, default 512)").
pub const MAX_SERVICES: usize = 512;

/// Catalog errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CatalogError {
    /// The catalog is at `MAX_SERVICES` distinct names and the incoming
    /// record's name is not already present.
    #[error("catalog at capacity")]
    AtCapacity,
}

/// Outcome of a merge attempt, per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No prior record (or prior record superseded); `r_in` is now current.
    Accepted,
    /// `r_in` is stale relative to the current record; silently dropped.
    Rejected,
    /// `r_in` tied the current record's `(version, hlc)` exactly
    /// (idempotent re-delivery); no state change.
    Ignored,
    /// Tie on `(version, hlc)` with differing payloads — should not happen
    /// under honest writers. Treated as `Rejected` but counted separately.
    Divergent,
}

/// Fixed-capacity, name-keyed slab of [`ServiceRecord`]s with deterministic
/// iteration order (supports cursor-based gossip summaries).
#[derive(Default)]
pub struct Catalog {
    records: BTreeMap<ServiceName, ServiceRecord>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self { records: BTreeMap::new() }
    }

    /// Number of distinct names currently stored (including tombstones).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by name.
    pub fn get(&self, name: &ServiceName) -> Option<&ServiceRecord> {
        self.records.get(name)
    }

    /// Iterate records in stable, deterministic name order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.records.values()
    }

    /// Per spec.md §4.6: merge an incoming record against current state.
    ///
    /// Pure function: does not touch the WAL. The caller (the node tick) is
    /// responsible for journaling `Accepted` merges before exposing them.
    pub fn merge(&mut self, incoming: ServiceRecord) -> Result<MergeOutcome, CatalogError> {
        match self.records.get(&incoming.name) {
            None => {
                if self.records.len() >= MAX_SERVICES {
                    return Err(CatalogError::AtCapacity);
                }
                let name = incoming.name;
                self.records.insert(name, incoming);
                Ok(MergeOutcome::Accepted)
            }
            Some(current) => {
                let (cur_key, in_key) = (current.order_key(), incoming.order_key());
                if in_key > cur_key {
                    let name = incoming.name;
                    self.records.insert(name, incoming);
                    Ok(MergeOutcome::Accepted)
                } else if in_key < cur_key {
                    Ok(MergeOutcome::Rejected)
                } else if *current == incoming {
                    Ok(MergeOutcome::Ignored)
                } else {
                    Ok(MergeOutcome::Divergent)
                }
            }
        }
    }

    /// Directly install a record without going through merge rules (used only
    /// during WAL/checkpoint replay, where history is already accepted).
    pub(crate) fn install(&mut self, record: ServiceRecord) {
        self.records.insert(record.name, record);
    }

    /// Drop tombstones older than `retention_ms` relative to `now_ms` — the
    /// WAL compaction GC step.
    pub fn gc_tombstones(&mut self, now_ms: u64, retention_ms: u64) {
        self.records.retain(|_, rec| {
            if !rec.tombstone {
                return true;
            }
            now_ms.saturating_sub(rec.hlc.wall_ms) < retention_ms
        });
    }

    /// The node identity that issued the newest HLC timestamp in the catalog,
    /// used only for diagnostics.
    pub fn newest_writer(&self) -> Option<NodeId> {
        self.records.values().max_by_key(|r| r.hlc).map(|r| r.hlc.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::HlcTimestamp;
    use crate::core::types::{ExecName, FlakeUri};

    fn rec(name: &str, version: u64, wall_ms: u64, logical: u32, node: u8) -> ServiceRecord {
        ServiceRecord {
            name: ServiceName::new(name).unwrap(),
            version,
            hlc: HlcTimestamp { wall_ms, logical, node: NodeId::from_bytes([node; 32]) },
            flake_uri: FlakeUri::new("github:nixos/nixpkgs#redis").unwrap(),
            exec_name: ExecName::new("redis").unwrap(),
            tombstone: false,
        }
    }

    #[test]
    fn first_write_is_accepted() {
        let mut cat = Catalog::new();
        assert_eq!(cat.merge(rec("redis", 1, 100, 0, 1)).unwrap(), MergeOutcome::Accepted);
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn newer_version_wins() {
        let mut cat = Catalog::new();
        cat.merge(rec("redis", 1, 100, 0, 1)).unwrap();
        assert_eq!(cat.merge(rec("redis", 2, 50, 0, 1)).unwrap(), MergeOutcome::Accepted);
        assert_eq!(cat.get(&ServiceName::new("redis").unwrap()).unwrap().version, 2);
    }

    #[test]
    fn stale_write_is_rejected() {
        let mut cat = Catalog::new();
        cat.merge(rec("redis", 2, 100, 0, 1)).unwrap();
        assert_eq!(cat.merge(rec("redis", 1, 200, 0, 1)).unwrap(), MergeOutcome::Rejected);
        assert_eq!(cat.get(&ServiceName::new("redis").unwrap()).unwrap().version, 2);
    }

    #[test]
    fn exact_replay_is_ignored() {
        let mut cat = Catalog::new();
        let r = rec("redis", 1, 100, 0, 1);
        cat.merge(r.clone()).unwrap();
        assert_eq!(cat.merge(r).unwrap(), MergeOutcome::Ignored);
    }

    #[test]
    fn tie_with_different_payload_is_divergent() {
        let mut cat = Catalog::new();
        cat.merge(rec("redis", 1, 100, 0, 1)).unwrap();
        let mut conflicting = rec("redis", 1, 100, 0, 1);
        conflicting.exec_name = ExecName::new("other").unwrap();
        assert_eq!(cat.merge(conflicting).unwrap(), MergeOutcome::Divergent);
    }

    #[test]
    fn hlc_breaks_ties_on_equal_version() {
        let mut cat = Catalog::new();
        // A deploys nginx v=2 at H_A = (1000, 0, A); B deploys v=2 at
        // H_B = (1000, 1, B) > H_A. Scenario 2 from spec.md §8.
        let h_a = rec("nginx", 2, 1000, 0, 0x01);
        let h_b = rec("nginx", 2, 1000, 1, 0x02);
        cat.merge(h_a).unwrap();
        assert_eq!(cat.merge(h_b.clone()).unwrap(), MergeOutcome::Accepted);
        assert_eq!(cat.get(&ServiceName::new("nginx").unwrap()).unwrap().hlc, h_b.hlc);
    }

    #[test]
    fn merge_is_idempotent_applied_twice() {
        let mut cat = Catalog::new();
        let r = rec("redis", 5, 100, 0, 1);
        cat.merge(r.clone()).unwrap();
        let snapshot_len = cat.len();
        cat.merge(r).unwrap();
        assert_eq!(cat.len(), snapshot_len);
    }

    #[test]
    fn capacity_rejects_new_distinct_names() {
        let mut cat = Catalog::new();
        for i in 0..MAX_SERVICES {
            let name = format!("svc-{i}");
            cat.merge(ServiceRecord {
                name: ServiceName::new(&name).unwrap(),
                version: 1,
                hlc: HlcTimestamp { wall_ms: 1, logical: 0, node: NodeId::from_bytes([1; 32]) },
                flake_uri: FlakeUri::new("x").unwrap(),
                exec_name: ExecName::new("x").unwrap(),
                tombstone: false,
            })
            .unwrap();
        }
        assert_eq!(cat.len(), MAX_SERVICES);
        let err = cat.merge(rec("one-too-many", 1, 1, 0, 1)).unwrap_err();
        assert_eq!(err, CatalogError::AtCapacity);
    }

    #[test]
    fn later_tombstone_supersedes_earlier_upsert() {
        let mut cat = Catalog::new();
        cat.merge(rec("redis", 1, 100, 0, 1)).unwrap();
        let mut tomb = rec("redis", 2, 200, 0, 1);
        tomb.tombstone = true;
        assert_eq!(cat.merge(tomb).unwrap(), MergeOutcome::Accepted);
        assert!(cat.get(&ServiceName::new("redis").unwrap()).unwrap().tombstone);
    }
}
