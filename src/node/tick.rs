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

//! The single-threaded cooperative tick (spec.md §4.9): drain inbound
//! frames, process local commands, emit gossip/heartbeats on schedule,
//! reconcile dirty catalog entries, and flush the WAL. Invoked from a real
//! timer in production and from a virtual clock in tests; the function
//! itself is oblivious to which.

use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::core::gossip::{build_summary, compare, select_fanout, GossipSummary, PeerExchangeBody, PullRequestBody, PullResponseBody};
use crate::core::reconcile::{DesiredState, Executor, ReconcileRequest};
use crate::core::security::identity::verify as verify_signature;
use crate::core::types::{decode_canonical_limited, encode_canonical, NodeId};
use crate::core::wire::channel::{ChannelError, HelloBody};
use crate::core::wire::frame::{MsgType, RawFrame};
use crate::networking::peer_book::PeerBookEntry;
use crate::node::clock::Clock;
use crate::node::state::NodeState;
use crate::node::transport::{RecvOutcome, Transport};
use crate::node::Command;

/// Bound on the wire-level decode size for any message body (generous:
/// the largest legal body is a gossip summary already capped to fit one
/// frame's plaintext capacity).
const MAX_BODY_LEN: usize = crate::core::wire::frame::PAYLOAD_CAPACITY;

/// Per-tick counters, for tests and logging; production observability goes
/// through `NodeState::metrics` directly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Datagrams drained from the transport this tick (step 1).
    pub frames_drained: usize,
    /// Local commands processed this tick (step 2).
    pub commands_processed: usize,
    /// True if gossip summaries were emitted this tick (step 3).
    pub gossip_emitted: bool,
    /// True if heartbeats were emitted this tick (step 4).
    pub heartbeats_emitted: bool,
    /// Catalog entries newly submitted to the reconcile worker pool this
    /// tick (step 5); completion is asynchronous and may land on a later
    /// tick's result drain.
    pub reconciled: usize,
}

fn resolve(addr: &str) -> Option<SocketAddr> {
    addr.to_socket_addrs().ok()?.next()
}

/// Run exactly one tick. `rx_timeout` bounds how long step 1 may block
/// waiting for the first datagram; subsequent drains within the same tick
/// are non-blocking up to `state.settings.rx_batch`.
#[allow(clippy::too_many_arguments)]
pub fn tick<T: Transport, C: Clock, E: Executor + Send + 'static, R: Rng + ?Sized>(
    state: &mut NodeState,
    transport: &mut T,
    clock: &C,
    commands: &mut tokio::sync::mpsc::Receiver<Command>,
    pool: &WorkerPool<E>,
    rng: &mut R,
    rx_timeout: Duration,
) -> TickReport {
    let mut report = TickReport::default();

    // Step 1: drain up to RX_BATCH datagrams.
    let mut first = true;
    for _ in 0..state.settings.rx_batch {
        let timeout = if first { rx_timeout } else { Duration::from_millis(0) };
        first = false;
        match transport.recv(timeout) {
            Ok(RecvOutcome::Frame(frame, from)) => {
                report.frames_drained += 1;
                dispatch(state, transport, clock, &frame, from);
            }
            Ok(RecvOutcome::WrongSize) => {
                state.metrics.protocol_drops_total.inc();
            }
            Ok(RecvOutcome::Idle) => break,
            Err(e) => {
                warn!(?e, "transport recv error");
                break;
            }
        }
    }

    // Step 2: local command queue.
    while let Ok(cmd) = commands.try_recv() {
        report.commands_processed += 1;
        apply_command(state, cmd);
    }

    // Step 3: gossip emission. MUST run even if step 1 produced no input
    // (spec.md §4.9 "cold-start convergence" critical property) — nothing
    // above gates this on `report.frames_drained`.
    let now = clock.now_ms();
    if now.saturating_sub(state.last_gossip_ms) >= state.settings.gossip_interval.as_millis() as u64 {
        emit_hellos(state, transport);
        emit_gossip(state, transport, rng, now);
        state.last_gossip_ms = now;
        report.gossip_emitted = true;
    }

    // Step 4: heartbeats.
    if now.saturating_sub(state.last_heartbeat_ms) >= state.settings.heartbeat_interval.as_millis() as u64 {
        emit_heartbeats(state, transport, now);
        state.last_heartbeat_ms = now;
        report.heartbeats_emitted = true;
    }

    // Step 5: reconcile dirty entries.
    report.reconciled = reconcile_dirty(state, pool, rng, now);

    // Step 6: WAL flush deadline. `Wal::append` fsyncs synchronously before
    // returning, so there is never an un-fsynced write waiting here; this
    // step is a deliberate no-op kept to mirror the spec's six-step shape
    // and as the hook point if batched (non-synchronous) appends are added.
    debug_assert!(!state.wal_pending, "append() is always fsync-before-ack; nothing should ever set this");

    state.metrics.catalog_size.set(state.catalog.len() as i64);
    state.metrics.peers_known.set(state.peer_book.len() as i64);
    let quarantined = state.quarantine.values().filter(|q| q.is_active(now)).count();
    state.metrics.peers_quarantined.set(quarantined as i64);

    trace!(?report, "tick complete");
    report
}

fn dispatch<T: Transport, C: Clock>(
    state: &mut NodeState,
    transport: &mut T,
    clock: &C,
    frame: &RawFrame,
    from: SocketAddr,
) {
    let now = clock.now_ms();
    let header = match frame.header() {
        Ok(h) => h,
        Err(_) => {
            state.metrics.protocol_drops_total.inc();
            return;
        }
    };
    let sender = header.sender_id;

    let opened = state.channel_for(sender).open(frame);
    let (_header, plaintext) = match opened {
        Ok(v) => {
            state.record_crypto_success(sender);
            v
        }
        Err(ChannelError::TagInvalid) => {
            state.metrics.mac_failures_total.inc();
            state.record_crypto_failure(sender, now);
            return;
        }
        Err(ChannelError::Replay) => {
            state.metrics.replay_drops_total.inc();
            state.record_crypto_failure(sender, now);
            return;
        }
        Err(ChannelError::EpochMismatch) => {
            state.metrics.protocol_drops_total.inc();
            state.record_crypto_failure(sender, now);
            return;
        }
        Err(_) => {
            state.metrics.protocol_drops_total.inc();
            return;
        }
    };

    state.peer_book.touch(sender, now);

    match header.msg_type {
        MsgType::Hello => {
            let local = state.identity.node_id();
            let signed_ok = match decode_canonical_limited::<HelloBody>(&plaintext, MAX_BODY_LEN) {
                Ok(body) => {
                    let expected = HelloBody::signed_message(sender, local);
                    verify_signature(sender, &expected, &body.signature).is_ok()
                }
                Err(_) => false,
            };
            if !signed_ok {
                state.metrics.protocol_drops_total.inc();
                return;
            }
            let ack = state.channel_for(sender).seal_auto(MsgType::HelloAck, b"");
            send_to(transport, ack, from, sender);
        }
        MsgType::HelloAck => {}
        MsgType::Heartbeat => {}
        MsgType::GossipSummary => {
            let summary: GossipSummary = match decode_canonical_limited(&plaintext, MAX_BODY_LEN) {
                Ok(s) => s,
                Err(_) => {
                    state.metrics.protocol_drops_total.inc();
                    return;
                }
            };
            let needed = compare(&state.catalog, &summary);
            if !needed.is_empty() {
                let body = PullRequestBody { names: needed };
                if let Ok(bytes) = encode_canonical(&body) {
                    let frame = state.channel_for(sender).seal_auto(MsgType::PullRequest, &bytes);
                    send_to(transport, frame, from, sender);
                    state.metrics.gossip_pulls_sent_total.inc();
                }
            }
        }
        MsgType::PullRequest => {
            let request: PullRequestBody = match decode_canonical_limited(&plaintext, MAX_BODY_LEN) {
                Ok(r) => r,
                Err(_) => {
                    state.metrics.protocol_drops_total.inc();
                    return;
                }
            };
            for name in request.names {
                let record = state.catalog.get(&name).cloned();
                let body = PullResponseBody { record };
                if let Ok(bytes) = encode_canonical(&body) {
                    let frame = state.channel_for(sender).seal_auto(MsgType::PullResponse, &bytes);
                    send_to(transport, frame, from, sender);
                }
            }
        }
        MsgType::PullResponse => {
            let response: PullResponseBody = match decode_canonical_limited(&plaintext, MAX_BODY_LEN) {
                Ok(r) => r,
                Err(_) => {
                    state.metrics.protocol_drops_total.inc();
                    return;
                }
            };
            if let Some(record) = response.record {
                accept_remote_record(state, record);
            }
        }
        MsgType::PeerExchange => {
            let body: PeerExchangeBody = match decode_canonical_limited(&plaintext, MAX_BODY_LEN) {
                Ok(b) => b,
                Err(_) => {
                    state.metrics.protocol_drops_total.inc();
                    return;
                }
            };
            for peer in body.peers {
                let Ok(entry) = PeerBookEntry::new(&peer.alias, &peer.address, &peer.pubkey_hex) else {
                    state.metrics.protocol_drops_total.inc();
                    continue;
                };
                let _ = state.peer_book.upsert(entry);
            }
        }
    }
}

fn accept_remote_record(state: &mut NodeState, record: crate::core::types::ServiceRecord) {
    use crate::core::state::catalog::MergeOutcome;

    let name = record.name;
    let hlc = record.hlc;
    match state.catalog.merge(record) {
        Ok(MergeOutcome::Accepted) => {
            if let Err(e) = state.wal.append(state.catalog.get(&name).expect("just inserted")) {
                warn!(?e, "wal append failed for accepted merge");
            } else {
                state.metrics.wal_appends_total.inc();
            }
            let _ = state.hlc.observe(hlc);
            state.dirty.insert(name);
            state.metrics.merge_accepted_total.inc();
        }
        Ok(MergeOutcome::Rejected) => {
            state.metrics.merge_rejected_total.inc();
        }
        Ok(MergeOutcome::Ignored) => {}
        Ok(MergeOutcome::Divergent) => {
            state.metrics.divergence_events_total.inc();
            warn!(name = %name.as_str(), "divergent record observed at identical (version, hlc)");
        }
        Err(e) => {
            debug!(?e, "catalog at capacity, dropping remote record");
        }
    }
}

fn send_to<T: Transport>(transport: &mut T, frame: Result<RawFrame, ChannelError>, addr: SocketAddr, peer: NodeId) {
    match frame {
        Ok(frame) => {
            if let Err(e) = transport.send(&frame, addr) {
                warn!(?e, %peer, "failed to send frame");
            }
        }
        Err(e) => warn!(?e, %peer, "failed to seal frame"),
    }
}

/// Send a signed `Hello` (spec.md §4.3) to every peer book entry never yet
/// successfully contacted (`last_seen_ms == 0`). A channel's AEAD key alone
/// authenticates *a* claimed `sender_id`, not that the claimant holds that
/// identity's private key; `Hello` closes that gap before gossip/heartbeat
/// traffic is trusted to or from a fresh peer. Runs on the gossip cadence so
/// an unresponsive peer is retried rather than hello'd once and forgotten.
fn emit_hellos<T: Transport>(state: &mut NodeState, transport: &mut T) {
    let local = state.identity.node_id();
    let targets: Vec<NodeId> = state
        .peer_book
        .iter()
        .filter(|(_, entry)| entry.last_seen_ms == 0)
        .map(|(id, _)| *id)
        .collect();

    for target in targets {
        let Some(entry) = state.peer_book.lookup(&target) else { continue };
        let Some(addr) = resolve(entry.address.as_str()) else { continue };
        let signature = state.identity.sign(&HelloBody::signed_message(local, target));
        let Ok(bytes) = encode_canonical(&HelloBody { signature }) else { continue };
        let frame = state.channel_for(target).seal_auto(MsgType::Hello, &bytes);
        send_to(transport, frame, addr, target);
    }
}

fn emit_gossip<T: Transport, R: Rng + ?Sized>(state: &mut NodeState, transport: &mut T, rng: &mut R, now: u64) {
    let candidates = state.fanout_candidates(now);
    if candidates.is_empty() {
        return;
    }
    let targets = select_fanout(&candidates, rng);
    let (summary, next_cursor) = build_summary(&state.catalog, state.gossip_cursor);
    state.gossip_cursor = next_cursor;

    let bytes = match encode_canonical(&summary) {
        Ok(b) => b,
        Err(_) => return,
    };

    for target in targets {
        let Some(entry) = state.peer_book.lookup(&target) else { continue };
        let Some(addr) = resolve(entry.address.as_str()) else { continue };
        let frame = state.channel_for(target).seal_auto(MsgType::GossipSummary, &bytes);
        send_to(transport, frame, addr, target);
        state.metrics.gossip_summaries_sent_total.inc();
    }
}

fn emit_heartbeats<T: Transport>(state: &mut NodeState, transport: &mut T, now: u64) {
    let candidates = state.fanout_candidates(now);
    for target in candidates {
        let Some(entry) = state.peer_book.lookup(&target) else { continue };
        let Some(addr) = resolve(entry.address.as_str()) else { continue };
        let frame = state.channel_for(target).seal_auto(MsgType::Heartbeat, b"");
        send_to(transport, frame, addr, target);
    }
}

/// Drain completed jobs from `pool`, then submit newly-due dirty names to
/// it. Executor calls never run inline on the tick thread (spec §5): a
/// name stays in `state.in_flight` until its result is drained, which may
/// be a later tick if the pool's bounded queue was full when submitted.
/// Returns the number of names newly submitted this tick.
fn reconcile_dirty<E: Executor + Send + 'static, R: Rng + ?Sized>(
    state: &mut NodeState,
    pool: &crate::core::reconcile::WorkerPool<E>,
    rng: &mut R,
    now: u64,
) -> usize {
    for result in pool.drain_results() {
        state.in_flight.remove(&result.name);
        match result.outcome.clone() {
            crate::core::reconcile::ExecOutcome::Applied => {
                state.metrics.reconcile_applied_total.inc();
            }
            crate::core::reconcile::ExecOutcome::Transient => {
                state.metrics.reconcile_transient_total.inc();
                state.dirty.insert(result.name);
            }
            crate::core::reconcile::ExecOutcome::Permanent => {
                state.metrics.reconcile_permanent_total.inc();
            }
        }
        state.reconciler.record_outcome(result.name, result.version, result.outcome, rng);
    }

    let pending = std::mem::take(&mut state.dirty);
    let mut still_dirty = BTreeSet::new();
    let mut submitted = 0;

    for name in pending {
        if state.in_flight.contains(&name) {
            still_dirty.insert(name);
            continue;
        }
        let Some(record) = state.catalog.get(&name) else { continue };
        let version = record.version;
        if state.reconciler.is_up_to_date(&name, version) {
            continue;
        }
        let elapsed = match state.last_reconcile_attempt_ms.get(&name) {
            Some(&last) => Duration::from_millis(now.saturating_sub(last)),
            None => Duration::MAX,
        };
        if state.reconciler.is_backing_off(&name, elapsed) {
            still_dirty.insert(name);
            continue;
        }

        let desired_state = if record.tombstone { DesiredState::Absent } else { DesiredState::Present };
        let request = ReconcileRequest {
            name,
            flake_uri: record.flake_uri,
            exec_name: record.exec_name,
            desired_state,
        };

        state.last_reconcile_attempt_ms.insert(name, now);
        if pool.try_submit(name, version, request) {
            state.in_flight.insert(name);
            submitted += 1;
        } else {
            // Bounded queue is full; retry next tick rather than block.
            still_dirty.insert(name);
        }
    }

    state.dirty = still_dirty;
    submitted
}

fn apply_command(state: &mut NodeState, cmd: Command) {
    match cmd {
        Command::Deploy { mut record, reply } => {
            let Ok(next_hlc) = state.hlc.now() else {
                let _ = reply.send(Err("hlc exhausted".to_string()));
                return;
            };
            record.hlc = next_hlc;
            let name = record.name;
            match state.catalog.merge(record) {
                Ok(_) => {
                    if let Some(stored) = state.catalog.get(&name) {
                        if let Err(e) = state.wal.append(stored) {
                            let _ = reply.send(Err(format!("wal append failed: {e}")));
                            return;
                        }
                        state.metrics.wal_appends_total.inc();
                    }
                    state.dirty.insert(name);
                    state.reconciler.reset_for_new_version(&name);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(format!("{e}")));
                }
            }
        }
        Command::PeerAdd { entry, reply } => {
            let result = state.peer_book.upsert(entry).map_err(|e| e.to_string());
            if result.is_ok() {
                let _ = state.peer_book.persist();
            }
            let _ = reply.send(result);
        }
        Command::PeerRemove { alias, reply } => {
            let removed = state.peer_book.remove_by_alias(&alias);
            if removed {
                let _ = state.peer_book.persist();
            }
            let _ = reply.send(removed);
        }
        Command::Status { reply } => {
            let _ = reply.send(crate::node::StatusSnapshot::capture(state));
        }
    }
}
