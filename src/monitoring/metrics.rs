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

//! Prometheus counters/gauges for the node tick loop and admin surface,
//! per spec.md §7/§8 ("each tick is a transactional unit with counters for
//! observability").

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A counter/gauge failed to construct or register with the registry.
    #[error("prometheus")]
    Prom,
}

/// Metrics container, handed to the node and admin surface as `Arc<Metrics>`.
#[derive(Clone)]
pub struct Metrics {
    /// Registry backing all metrics below; scraped by the admin `/metrics` route.
    pub registry: Registry,

    /// Currently known (not necessarily reachable) peers.
    pub peers_known: IntGauge,
    /// Currently quarantined peers (spec §7: repeated crypto failure).
    pub peers_quarantined: IntGauge,
    /// Services currently tracked in the catalog (including tombstones).
    pub catalog_size: IntGauge,

    /// Frames dropped for AEAD tag failure.
    pub mac_failures_total: IntCounter,
    /// Frames dropped as replayed or below the replay window floor.
    pub replay_drops_total: IntCounter,
    /// Frames dropped at the protocol layer (bad magic/version/msg_type/len).
    pub protocol_drops_total: IntCounter,
    /// Merge attempts rejected as stale.
    pub merge_rejected_total: IntCounter,
    /// Merge attempts accepted.
    pub merge_accepted_total: IntCounter,
    /// Equal-`(version, hlc)` merges with differing payloads (spec §4.6).
    pub divergence_events_total: IntCounter,

    /// WAL records appended (and fsynced).
    pub wal_appends_total: IntCounter,
    /// WAL recoveries that truncated a torn tail record.
    pub wal_truncations_total: IntCounter,

    /// Gossip summaries sent.
    pub gossip_summaries_sent_total: IntCounter,
    /// Pull requests sent.
    pub gossip_pulls_sent_total: IntCounter,

    /// Reconciler calls that returned a transient failure.
    pub reconcile_transient_total: IntCounter,
    /// Reconciler calls that returned a permanent failure.
    pub reconcile_permanent_total: IntCounter,
    /// Reconciler calls that applied successfully.
    pub reconcile_applied_total: IntCounter,
}

macro_rules! counter {
    ($registry:expr, $name:expr, $help:expr) => {{
        let c = IntCounter::new($name, $help).map_err(|_| MetricsError::Prom)?;
        $registry.register(Box::new(c.clone())).map_err(|_| MetricsError::Prom)?;
        c
    }};
}

macro_rules! gauge {
    ($registry:expr, $name:expr, $help:expr) => {{
        let g = IntGauge::new($name, $help).map_err(|_| MetricsError::Prom)?;
        $registry.register(Box::new(g.clone())).map_err(|_| MetricsError::Prom)?;
        g
    }};
}

impl Metrics {
    /// Construct and register every metric against a fresh [`Registry`].
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers_known = gauge!(registry, "myco_peers_known", "Known peers in the peer book");
        let peers_quarantined = gauge!(registry, "myco_peers_quarantined", "Peers currently quarantined");
        let catalog_size = gauge!(registry, "myco_catalog_size", "Services tracked in the catalog");

        let mac_failures_total =
            counter!(registry, "myco_mac_failures_total", "Frames dropped for AEAD tag failure");
        let replay_drops_total =
            counter!(registry, "myco_replay_drops_total", "Frames dropped as replayed or stale");
        let protocol_drops_total =
            counter!(registry, "myco_protocol_drops_total", "Frames dropped at the protocol layer");
        let merge_rejected_total =
            counter!(registry, "myco_merge_rejected_total", "Stale merges rejected");
        let merge_accepted_total =
            counter!(registry, "myco_merge_accepted_total", "Merges accepted");
        let divergence_events_total = counter!(
            registry,
            "myco_divergence_events_total",
            "Equal (version, hlc) merges with differing payloads"
        );

        let wal_appends_total = counter!(registry, "myco_wal_appends_total", "WAL records appended");
        let wal_truncations_total = counter!(
            registry,
            "myco_wal_truncations_total",
            "WAL recoveries that truncated a torn tail record"
        );

        let gossip_summaries_sent_total =
            counter!(registry, "myco_gossip_summaries_sent_total", "Gossip summaries sent");
        let gossip_pulls_sent_total =
            counter!(registry, "myco_gossip_pulls_sent_total", "Pull requests sent");

        let reconcile_transient_total = counter!(
            registry,
            "myco_reconcile_transient_total",
            "Reconciler calls that returned a transient failure"
        );
        let reconcile_permanent_total = counter!(
            registry,
            "myco_reconcile_permanent_total",
            "Reconciler calls that returned a permanent failure"
        );
        let reconcile_applied_total =
            counter!(registry, "myco_reconcile_applied_total", "Reconciler calls applied successfully");

        Ok(Self {
            registry,
            peers_known,
            peers_quarantined,
            catalog_size,
            mac_failures_total,
            replay_drops_total,
            protocol_drops_total,
            merge_rejected_total,
            merge_accepted_total,
            divergence_events_total,
            wal_appends_total,
            wal_truncations_total,
            gossip_summaries_sent_total,
            gossip_pulls_sent_total,
            reconcile_transient_total,
            reconcile_permanent_total,
            reconcile_applied_total,
        })
    }
}
