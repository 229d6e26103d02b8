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

//! Owned node state: catalog, WAL, peer book, HLC, per-peer secure channels,
//! and the bookkeeping the tick loop needs between calls. Per spec.md §9
//! ("no component holds a back-reference to the node"), this struct has no
//! pointer to anything that composes it — the tick function takes it as a
//! plain `&mut` parameter alongside a transport, clock, and executor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::core::clock::Hlc;
use crate::core::gossip::SummaryCursor;
use crate::core::reconcile::Reconciler;
use crate::core::security::identity::Identity;
use crate::core::state::catalog::Catalog;
use crate::core::state::wal::Wal;
use crate::core::types::{NodeId, ServiceName};
use crate::core::wire::channel::SecureChannel;
use crate::monitoring::metrics::Metrics;
use crate::networking::peer_book::PeerBook;
use crate::node::config::Settings;

/// Per-source crypto-failure tracking for temporary peer quarantine
/// (spec.md §7: "repeated failure from a source above a threshold triggers
/// temporary peer quarantine (no gossip TX to that peer for a backoff
/// interval)").
#[derive(Clone, Copy, Debug, Default)]
pub struct Quarantine {
    consecutive_failures: u32,
    quarantined_until_ms: u64,
}

impl Quarantine {
    fn record_failure(&mut self, now_ms: u64, threshold: u32, backoff: Duration) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= threshold {
            self.quarantined_until_ms = now_ms + backoff.as_millis() as u64;
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.quarantined_until_ms = 0;
    }

    /// True if gossip TX to this peer is currently suppressed.
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.quarantined_until_ms
    }
}

/// Everything the tick function mutates across one call. Constructed once
/// at startup by [`crate::node::Node::bootstrap`].
pub struct NodeState {
    /// This node's long-lived Ed25519 identity.
    pub identity: Identity,
    /// Replicated service catalog.
    pub catalog: Catalog,
    /// Durable journal of accepted merges.
    pub wal: Wal,
    /// Bounded table of known peers.
    pub peer_book: PeerBook,
    /// Hybrid logical clock, seeded from WAL recovery.
    pub hlc: Hlc,
    /// Per-remote secure channels, built lazily on first contact (key
    /// derivation needs no prior handshake: spec.md §4.2).
    pub channels: BTreeMap<NodeId, SecureChannel>,
    /// Gossip summary round-robin cursor.
    pub gossip_cursor: SummaryCursor,
    /// Executor-facing reconciliation state.
    pub reconciler: Reconciler,
    /// Crypto-failure quarantine state per source.
    pub quarantine: BTreeMap<NodeId, Quarantine>,
    /// Names mutated since the last reconcile pass (step 5, §4.9).
    pub dirty: BTreeSet<ServiceName>,
    /// Names currently submitted to the reconcile worker pool, awaiting a
    /// result; excluded from re-submission until the result drains.
    pub in_flight: BTreeSet<ServiceName>,
    /// Wall-clock time (ms) of the last executor attempt per name, tracked
    /// here because [`Reconciler`] only knows backoff *durations*, not
    /// wall-clock deadlines (spec.md §4.10).
    pub last_reconcile_attempt_ms: BTreeMap<ServiceName, u64>,
    /// True if the WAL has an append not yet covered by a flush-deadline
    /// fsync decision this tick (append() always fsyncs synchronously
    /// today; this flag exists for the deadline-based coalescing policy
    /// named in §4.9 step 6, exercised once batched writes are added).
    pub wal_pending: bool,
    /// Wall-clock time (ms) of the last gossip emission.
    pub last_gossip_ms: u64,
    /// Wall-clock time (ms) of the last heartbeat emission.
    pub last_heartbeat_ms: u64,
    /// Observability counters.
    pub metrics: Arc<Metrics>,
    /// Resolved startup configuration (PSK, epoch, intervals, thresholds).
    pub settings: Settings,
    /// Polled once per tick; true once a shutdown has been requested.
    pub shutdown: bool,
}

impl NodeState {
    /// Get-or-create the secure channel to `remote`, deriving its key from
    /// the cluster PSK and current epoch (no handshake round-trip required).
    pub fn channel_for(&mut self, remote: NodeId) -> &mut SecureChannel {
        let local = self.identity.node_id();
        let epoch = self.settings.epoch;
        let psk = self.settings.psk.clone();
        self.channels
            .entry(remote)
            .or_insert_with(|| SecureChannel::new(local, remote, &psk, epoch).expect("AES-256-GCM key setup"))
    }

    /// Record a crypto failure from `source`, quarantining it once the
    /// consecutive-failure threshold is crossed.
    pub fn record_crypto_failure(&mut self, source: NodeId, now_ms: u64) {
        let threshold = self.settings.quarantine_threshold;
        let backoff = self.settings.quarantine_backoff;
        let entry = self.quarantine.entry(source).or_default();
        entry.record_failure(now_ms, threshold, backoff);
        if entry.is_active(now_ms) {
            warn!(peer = %source, "quarantining peer after repeated crypto failures");
        }
    }

    /// Clear quarantine bookkeeping after a successfully authenticated frame.
    pub fn record_crypto_success(&mut self, source: NodeId) {
        self.quarantine.entry(source).or_default().record_success();
    }

    /// True if `peer` is currently excluded from gossip TX.
    pub fn is_quarantined(&self, peer: &NodeId, now_ms: u64) -> bool {
        self.quarantine.get(peer).map(|q| q.is_active(now_ms)).unwrap_or(false)
    }

    /// Peers eligible for gossip fanout this tick: known, and not quarantined.
    pub fn fanout_candidates(&self, now_ms: u64) -> Vec<NodeId> {
        self.peer_book
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !self.is_quarantined(id, now_ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_activates_only_after_threshold() {
        let mut q = Quarantine::default();
        for _ in 0..3 {
            q.record_failure(1_000, 5, Duration::from_secs(30));
        }
        assert!(!q.is_active(1_000));
        for _ in 0..2 {
            q.record_failure(1_000, 5, Duration::from_secs(30));
        }
        assert!(q.is_active(1_000));
        assert!(!q.is_active(1_000 + 31_000));
    }

    #[test]
    fn success_resets_failure_count() {
        let mut q = Quarantine::default();
        q.record_failure(1_000, 5, Duration::from_secs(30));
        q.record_failure(1_000, 5, Duration::from_secs(30));
        q.record_success();
        assert_eq!(q.consecutive_failures, 0);
        for _ in 0..4 {
            q.record_failure(1_000, 5, Duration::from_secs(30));
        }
        assert!(!q.is_active(1_000));
    }
}
