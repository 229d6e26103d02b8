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

//! Node assembly: bootstrap from [`config::Settings`], then drive
//! [`tick::tick`] in a blocking loop fed by a real UDP socket and system
//! clock. The admin HTTP surface (`crate::admin`) talks to a running node
//! only through [`NodeHandle`]'s bounded command channel.

pub mod clock;
pub mod config;
pub mod state;
pub mod tick;
pub mod transport;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::core::clock::Hlc;
use crate::core::gossip::SummaryCursor;
use crate::core::reconcile::{Executor, LoggingExecutor, Reconciler};
use crate::core::security::identity::{Identity, IdentityError};
use crate::core::state::catalog::Catalog;
use crate::core::state::wal::{Wal, WalError};
use crate::core::types::ServiceRecord;
use crate::monitoring::metrics::{Metrics, MetricsError};
use crate::networking::peer_book::{PeerBook, PeerBookEntry, PeerBookError};
use crate::node::clock::{Clock, SystemClock};
use crate::node::config::Settings;
use crate::node::state::NodeState;
use crate::node::transport::UdpTransport;

/// Bound on the admin-surface-to-tick-loop command queue.
pub const COMMAND_QUEUE_DEPTH: usize = 256;

/// Errors that can prevent a node from starting.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Filesystem setup failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Identity load/create failed.
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    /// WAL open or recovery failed.
    #[error("wal: {0}")]
    Wal(#[from] WalError),
    /// Peer book load/persist failed.
    #[error("peer book: {0}")]
    PeerBook(#[from] PeerBookError),
    /// Metrics registration failed.
    #[error("metrics: {0}")]
    Metrics(#[from] MetricsError),
}

/// A command submitted by the admin surface (or a test), applied by the
/// tick loop's local-command step (spec.md §4.9 step 2 / §6 admin surface).
pub enum Command {
    /// Deploy or update a service; the node stamps a fresh HLC timestamp
    /// before merging, so the caller does not race its own writes.
    Deploy {
        /// Record to deploy (caller-supplied `hlc` is overwritten).
        record: ServiceRecord,
        /// Reply channel.
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Add or update a peer book entry.
    PeerAdd {
        /// Entry to upsert.
        entry: PeerBookEntry,
        /// Reply channel.
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Remove every peer book entry with the given alias.
    PeerRemove {
        /// Alias to remove.
        alias: String,
        /// Reply channel; `true` if at least one entry was removed.
        reply: oneshot::Sender<bool>,
    },
    /// Request a point-in-time status snapshot.
    Status {
        /// Reply channel.
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// Point-in-time node status, returned by the admin `/status` route.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StatusSnapshot {
    /// This node's identity, hex-encoded.
    pub node_id: String,
    /// Distinct names in the catalog, including tombstones.
    pub catalog_size: usize,
    /// Entries in the peer book.
    pub peers_known: usize,
    /// Peers currently excluded from gossip TX.
    pub peers_quarantined: usize,
    /// Names awaiting a reconcile pass.
    pub dirty_count: usize,
}

impl StatusSnapshot {
    /// Capture a snapshot of `state` at the current wall-clock time.
    pub fn capture(state: &NodeState) -> Self {
        let now = SystemClock.now_ms();
        let quarantined = state.quarantine.values().filter(|q| q.is_active(now)).count();
        Self {
            node_id: state.identity.node_id().to_hex(),
            catalog_size: state.catalog.len(),
            peers_known: state.peer_book.len(),
            peers_quarantined: quarantined,
            dirty_count: state.dirty.len(),
        }
    }
}

/// A cloneable sender the admin surface uses to submit commands to the
/// running node without sharing its state across threads.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Submit a deploy request and wait for the tick loop's reply.
    pub async fn deploy(&self, record: ServiceRecord) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Deploy { record, reply: tx })
            .await
            .map_err(|_| "node is shutting down".to_string())?;
        rx.await.map_err(|_| "node is shutting down".to_string())?
    }

    /// Submit a peer-add request.
    pub async fn peer_add(&self, entry: PeerBookEntry) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PeerAdd { entry, reply: tx })
            .await
            .map_err(|_| "node is shutting down".to_string())?;
        rx.await.map_err(|_| "node is shutting down".to_string())?
    }

    /// Submit a peer-remove request; `true` if an entry was removed.
    pub async fn peer_remove(&self, alias: String) -> Result<bool, String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PeerRemove { alias, reply: tx })
            .await
            .map_err(|_| "node is shutting down".to_string())?;
        rx.await.map_err(|_| "node is shutting down".to_string())
    }

    /// Request a status snapshot.
    pub async fn status(&self) -> Result<StatusSnapshot, String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply: tx })
            .await
            .map_err(|_| "node is shutting down".to_string())?;
        rx.await.map_err(|_| "node is shutting down".to_string())
    }
}

/// An assembled, not-yet-running node.
pub struct Node {
    state: NodeState,
    commands: mpsc::Receiver<Command>,
}

/// Load identity, recover the WAL, load the peer book, and register
/// metrics, producing a [`Node`] ready for [`Node::run`] plus the
/// [`NodeHandle`] its admin surface should be built around.
pub fn bootstrap(settings: Settings) -> Result<(Node, NodeHandle), NodeError> {
    std::fs::create_dir_all(&settings.state_dir)?;

    let identity = Identity::load_or_create(&settings.state_dir)?;

    let wal_path = settings.state_dir.join("catalog.wal");
    let recovery = Wal::recover(&wal_path)?;
    let wal = Wal::open(&wal_path, identity.node_id())?;

    let mut catalog = Catalog::new();
    let mut dirty = BTreeSet::new();
    let mut newest_hlc = None;
    for recovered in recovery.records {
        dirty.insert(recovered.record.name);
        newest_hlc = Some(match newest_hlc {
            Some(prev) if prev >= recovered.record.hlc => prev,
            _ => recovered.record.hlc,
        });
        catalog.install(recovered.record);
    }
    if recovery.truncated {
        warn!(path = %wal_path.display(), "WAL recovery truncated a torn tail record");
    }
    if !dirty.is_empty() {
        info!(count = dirty.len(), "marking all recovered services dirty for post-restart reconciliation");
    }

    let hlc = match newest_hlc {
        Some(ts) => Hlc::restore(identity.node_id(), ts),
        None => Hlc::new(identity.node_id()),
    };

    let mut peer_book = PeerBook::load(&settings.state_dir)?;
    if peer_book.is_empty() && !settings.node_config.bootstrap.is_empty() {
        let seed = settings
            .node_config
            .bootstrap
            .iter()
            .filter_map(|b| PeerBookEntry::new(&b.alias, &b.address, &b.pubkey_hex).ok());
        peer_book.seed(seed)?;
        peer_book.persist()?;
    }

    let metrics = Arc::new(Metrics::new()?);

    let state = NodeState {
        identity,
        catalog,
        wal,
        peer_book,
        hlc,
        channels: BTreeMap::new(),
        gossip_cursor: SummaryCursor::default(),
        reconciler: Reconciler::new(),
        quarantine: BTreeMap::new(),
        dirty,
        in_flight: BTreeSet::new(),
        last_reconcile_attempt_ms: BTreeMap::new(),
        wal_pending: false,
        last_gossip_ms: 0,
        last_heartbeat_ms: 0,
        metrics,
        settings,
        shutdown: false,
    };

    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    Ok((Node { state, commands: rx }, NodeHandle { commands: tx }))
}

impl Node {
    /// This node's public identity, for logging before [`Node::run`] starts.
    pub fn node_id(&self) -> crate::core::types::NodeId {
        self.state.identity.node_id()
    }

    /// Clone of the metrics registry the tick loop updates, shared with the
    /// admin surface so `/metrics` scrapes the same counters (not a second,
    /// empty registry).
    pub fn metrics(&self) -> Arc<Metrics> {
        self.state.metrics.clone()
    }

    /// Run the blocking tick loop against a real UDP socket, system clock,
    /// and the packaged [`LoggingExecutor`] stand-in. Returns only on a
    /// bind failure or an explicit shutdown request.
    pub fn run(self) -> Result<(), NodeError> {
        self.run_with_executor(LoggingExecutor)
    }

    /// As [`Node::run`], but against a caller-supplied [`Executor`] — the
    /// seam a real systemd/Nix collaborator plugs into. `executor` is moved
    /// into a bounded worker pool (spec §5) so a slow or hanging `apply()`
    /// call never blocks the tick thread.
    pub fn run_with_executor<E: Executor + Send + 'static>(mut self, executor: E) -> Result<(), NodeError> {
        let port = self.state.settings.port;
        let mut transport = UdpTransport::bind(port)?;
        let clock = SystemClock;
        let mut rng = rand::thread_rng();
        let workers = self.state.settings.reconcile_workers;
        let queue_depth = self.state.settings.reconcile_queue_depth;
        let pool = crate::core::reconcile::WorkerPool::spawn(executor, workers, queue_depth);

        // Startup's one-time allocations (WAL recovery, peer book load) are
        // behind us; the tick loop below should never need to grow the heap.
        crate::core::noalloc::freeze();

        info!(
            port,
            node = %self.state.identity.node_id(),
            admin = %self.state.settings.admin_addr,
            "node tick loop started"
        );

        loop {
            let report = tick::tick(
                &mut self.state,
                &mut transport,
                &clock,
                &mut self.commands,
                &pool,
                &mut rng,
                Duration::from_millis(100),
            );
            tracing::trace!(?report, "tick complete");
            if self.state.shutdown {
                info!("shutdown requested, exiting tick loop");
                return Ok(());
            }
        }
    }
}
