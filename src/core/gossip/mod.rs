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

//! Gossip engine: bounded summary generation from a persistent round-robin
//! cursor, summary comparison to find what a peer needs, and fanout peer
//! selection.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::state::catalog::Catalog;
use crate::core::types::{encode_canonical, NodeId, ServiceName, ServiceRecord};
use crate::core::wire::frame::PAYLOAD_CAPACITY;

/// Conservative per-entry encoded size bound (name length prefix + up to
/// `SERVICE_NAME_CAP` bytes + an 8-byte version), used only for the
/// compile-time capacity check; actual summaries are built by incremental
/// encoding, not this estimate.
const PER_ENTRY_SIZE_BOUND: usize = crate::core::types::SERVICE_NAME_CAP + 16;

/// Maximum `(name, version)` entries in one gossip summary.
pub const MAX_GOSSIP_SUMMARY: usize = 9;

/// Maximum names requested in one `PullRequest`.
pub const MAX_PULL_NAMES: usize = MAX_GOSSIP_SUMMARY;

/// Maximum peer entries carried in one `PeerExchange` frame.
pub const MAX_PEER_EXCHANGE: usize = 8;

/// Upper bound on fanout peers contacted per tick, regardless of mesh size.
pub const MAX_FANOUT: usize = 8;

const _: () = assert!(MAX_GOSSIP_SUMMARY * PER_ENTRY_SIZE_BOUND <= PAYLOAD_CAPACITY);

/// One `(name, version)` digest entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipSummaryEntry {
    /// Catalog key.
    pub name: ServiceName,
    /// Writer-maintained version at the advertiser.
    pub version: u64,
}

/// A bounded digest of catalog contents, advertised to a neighbor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GossipSummary {
    /// Entries, in cursor order.
    pub entries: Vec<GossipSummaryEntry>,
}

/// Persistent position in the catalog's name order, so repeated summaries
/// eventually cover every service rather than always starting from the top.
#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryCursor {
    after: Option<ServiceName>,
}

/// Build the next bounded summary starting just after `cursor`, wrapping
/// around to the start of the catalog. Stops at `MAX_GOSSIP_SUMMARY`
/// entries or when adding the next entry would push the canonical encoding
/// past [`PAYLOAD_CAPACITY`], whichever comes first.
pub fn build_summary(catalog: &Catalog, cursor: SummaryCursor) -> (GossipSummary, SummaryCursor) {
    let all: Vec<&ServiceRecord> = catalog.iter().collect();
    if all.is_empty() {
        return (GossipSummary::default(), cursor);
    }

    let start = match cursor.after {
        Some(ref name) => all.iter().position(|r| &r.name > name).unwrap_or(0),
        None => 0,
    };

    let mut summary = GossipSummary::default();
    let mut last_included: Option<ServiceName> = None;

    for i in 0..all.len() {
        if summary.entries.len() >= MAX_GOSSIP_SUMMARY {
            break;
        }
        let record = all[(start + i) % all.len()];
        let candidate = GossipSummaryEntry { name: record.name, version: record.version };

        let mut trial = summary.entries.clone();
        trial.push(candidate.clone());
        let encoded_len = encode_canonical(&GossipSummary { entries: trial }).map(|b| b.len()).unwrap_or(usize::MAX);
        if encoded_len > PAYLOAD_CAPACITY {
            break;
        }

        last_included = Some(candidate.name);
        summary.entries.push(candidate);
    }

    let next_cursor = SummaryCursor { after: last_included.or(cursor.after) };
    (summary, next_cursor)
}

/// Given a remote summary, return the names this node should pull: those
/// the remote holds at a strictly newer version, or that are unknown
/// locally. Capped at [`MAX_PULL_NAMES`].
pub fn compare(local: &Catalog, remote: &GossipSummary) -> Vec<ServiceName> {
    let mut needed = Vec::new();
    for entry in &remote.entries {
        if needed.len() >= MAX_PULL_NAMES {
            break;
        }
        let should_pull = match local.get(&entry.name) {
            Some(current) => entry.version > current.version,
            None => true,
        };
        if should_pull {
            needed.push(entry.name);
        }
    }
    needed
}

/// A `PullRequest` message body: names the sender wants full records for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequestBody {
    /// Requested names, already capped at [`MAX_PULL_NAMES`] by the caller.
    pub names: Vec<ServiceName>,
}

/// A `PullResponse` message body: the record, or `None` if the requester's
/// peer no longer has (or never had) that name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullResponseBody {
    /// The requested record, if present.
    pub record: Option<ServiceRecord>,
}

/// One entry offered in a `PeerExchange` frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerExchangeEntry {
    /// Alias (unauthenticated, display-only).
    pub alias: String,
    /// Network address ("host:port").
    pub address: String,
    /// Hex-encoded Ed25519 public key.
    pub pubkey_hex: String,
}

/// A `PeerExchange` message body, bounded to [`MAX_PEER_EXCHANGE`] peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerExchangeBody {
    /// Offered peers.
    pub peers: Vec<PeerExchangeEntry>,
}

/// Number of peers to gossip with this tick: `floor(sqrt(n))`, clamped to
/// `[1, MAX_FANOUT]` (spec §4.8: "default √N bounded by a constant").
pub fn fanout_count(known_peers: usize) -> usize {
    if known_peers == 0 {
        return 0;
    }
    ((known_peers as f64).sqrt() as usize).clamp(1, MAX_FANOUT.min(known_peers))
}

/// Uniformly select `fanout_count(peers.len())` peers to gossip with this
/// tick.
pub fn select_fanout<R: Rng + ?Sized>(peers: &[NodeId], rng: &mut R) -> Vec<NodeId> {
    let k = fanout_count(peers.len());
    peers.choose_multiple(rng, k).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::HlcTimestamp;
    use crate::core::types::{ExecName, FlakeUri};
    use rand::SeedableRng;

    fn rec(name: &str, version: u64) -> ServiceRecord {
        ServiceRecord {
            name: ServiceName::new(name).unwrap(),
            version,
            hlc: HlcTimestamp::zero(NodeId::from_bytes([1; 32])),
            flake_uri: FlakeUri::new("github:nixos/nixpkgs#x").unwrap(),
            exec_name: ExecName::new("x").unwrap(),
            tombstone: false,
        }
    }

    #[test]
    fn summary_covers_everything_across_successive_calls_when_over_cap() {
        let mut catalog = Catalog::new();
        for i in 0..(MAX_GOSSIP_SUMMARY * 3) {
            catalog.merge(rec(&format!("svc-{i:03}"), 1)).unwrap();
        }

        let mut cursor = SummaryCursor::default();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..10 {
            let (summary, next) = build_summary(&catalog, cursor);
            assert!(!summary.entries.is_empty());
            for e in &summary.entries {
                seen.insert(e.name);
            }
            cursor = next;
        }
        assert_eq!(seen.len(), MAX_GOSSIP_SUMMARY * 3);
    }

    #[test]
    fn empty_catalog_yields_empty_summary() {
        let catalog = Catalog::new();
        let (summary, _) = build_summary(&catalog, SummaryCursor::default());
        assert!(summary.entries.is_empty());
    }

    #[test]
    fn compare_finds_unknown_and_newer_names() {
        let mut local = Catalog::new();
        local.merge(rec("redis", 1)).unwrap();

        let remote = GossipSummary {
            entries: vec![
                GossipSummaryEntry { name: ServiceName::new("redis").unwrap(), version: 2 },
                GossipSummaryEntry { name: ServiceName::new("nginx").unwrap(), version: 1 },
                GossipSummaryEntry { name: ServiceName::new("stale").unwrap(), version: 1 },
            ],
        };
        // Mark "stale" as already-current locally so it's excluded.
        local.merge(rec("stale", 1)).unwrap();

        let needed = compare(&local, &remote);
        assert!(needed.contains(&ServiceName::new("redis").unwrap()));
        assert!(needed.contains(&ServiceName::new("nginx").unwrap()));
        assert!(!needed.contains(&ServiceName::new("stale").unwrap()));
    }

    #[test]
    fn fanout_count_is_sqrt_bounded() {
        assert_eq!(fanout_count(0), 0);
        assert_eq!(fanout_count(1), 1);
        assert_eq!(fanout_count(100), 10);
        assert_eq!(fanout_count(10_000), MAX_FANOUT);
    }

    #[test]
    fn select_fanout_never_exceeds_known_peers_or_max() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let peers: Vec<NodeId> = (0..20u8).map(|i| NodeId::from_bytes([i; 32])).collect();
        let chosen = select_fanout(&peers, &mut rng);
        assert!(chosen.len() <= MAX_FANOUT);
        assert!(chosen.len() <= peers.len());
        let unique: std::collections::BTreeSet<_> = chosen.iter().collect();
        assert_eq!(unique.len(), chosen.len());
    }
}
