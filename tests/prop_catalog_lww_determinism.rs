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

use myco::core::clock::HlcTimestamp;
use myco::core::state::catalog::Catalog;
use myco::core::types::{ExecName, FlakeUri, NodeId, ServiceName, ServiceRecord};
use proptest::prelude::*;

fn node(b: u8) -> NodeId {
    NodeId::from_bytes([b; 32])
}

fn record(version: u64, wall_ms: u64, logical: u32, writer: u8) -> ServiceRecord {
    ServiceRecord {
        name: ServiceName::new("redis").unwrap(),
        version,
        hlc: HlcTimestamp { wall_ms, logical, node: node(writer) },
        flake_uri: FlakeUri::new("github:nixos/nixpkgs#redis").unwrap(),
        exec_name: ExecName::new("redis").unwrap(),
        tombstone: false,
    }
}

fn merge_all(records: &[ServiceRecord]) -> Option<ServiceRecord> {
    let mut cat = Catalog::new();
    for r in records {
        cat.merge(r.clone()).unwrap();
    }
    cat.get(&ServiceName::new("redis").unwrap()).cloned()
}

proptest! {
    // Merging the same set of competing writes for one name, in any delivery
    // order, must land on the same final record — the one with the greatest
    // (version, hlc) key (spec.md §4.6: LWW merge is a deterministic function
    // of the ordering key, not of arrival order).
    #[test]
    fn catalog_lww_merge_is_order_independent(
        seeds in prop::collection::hash_set((1u64..1000, 0u64..10_000u64, any::<u32>(), any::<u8>()), 1..12)
    ) {
        let records: Vec<ServiceRecord> = seeds
            .into_iter()
            .map(|(version, wall_ms, logical, writer)| record(version, wall_ms, logical, writer))
            .collect();

        let forward = merge_all(&records);

        let mut reversed = records.clone();
        reversed.reverse();
        let backward = merge_all(&reversed);

        let mut by_key = records.clone();
        by_key.sort_by_key(|r| r.order_key());
        let ascending = merge_all(&by_key);

        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(&forward, &ascending);

        // The winner must be exactly the max order_key among the inputs.
        let expected_key = records.iter().map(|r| r.order_key()).max().unwrap();
        prop_assert_eq!(forward.unwrap().order_key(), expected_key);
    }
}
