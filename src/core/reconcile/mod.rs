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

//! Reconciler: drives the external executor collaborator toward each
//! catalog record's desired state, with exponential backoff and jitter on
//! transient failures.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::core::types::{ExecName, FlakeUri, ServiceName};

/// Desired end state for a service, derived from its tombstone bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesiredState {
    /// Record is live; the executor should ensure it is running.
    Present,
    /// Record is tombstoned; the executor should tear it down.
    Absent,
}

/// One unit of work handed to the executor.
#[derive(Clone, Debug)]
pub struct ReconcileRequest {
    /// Catalog key.
    pub name: ServiceName,
    /// Artifact descriptor.
    pub flake_uri: FlakeUri,
    /// Executor token.
    pub exec_name: ExecName,
    /// Target state.
    pub desired_state: DesiredState,
}

/// Result of attempting one reconcile request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The executor completed the request.
    Applied,
    /// The executor failed in a way expected to clear on retry (resource
    /// contention, transient I/O, a lock held by a concurrent operation).
    Transient,
    /// The executor failed in a way that will not clear without a new
    /// version (bad flake reference, unresolvable dependency, invalid config).
    Permanent,
}

/// Executor collaborator interface (spec §4.10 / §6): `apply`, `remove`,
/// and `status`, implemented by whatever drives the host's service manager
/// (systemd units built from Nix derivations, in the reference deployment).
pub trait Executor {
    /// Bring `request.name` to `request.desired_state`.
    fn apply(&mut self, request: &ReconcileRequest) -> ExecOutcome;
    /// Tear down `name` unconditionally (used when a tombstone GCs out of
    /// the catalog and the executor should forget it too).
    fn remove(&mut self, name: &ServiceName) -> ExecOutcome;
    /// Current executor-reported status for `name`, if tracked.
    fn status(&self, name: &ServiceName) -> Option<ExecOutcome>;
}

/// A logging-only stand-in [`Executor`], used when no real systemd/Nix
/// collaborator is wired in (development, simulation, and the packaged
/// binary's default). Always reports success; the host integration that
/// actually drives service units is an external collaborator (out of scope,
/// spec.md §1) that replaces this at startup.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingExecutor;

impl Executor for LoggingExecutor {
    fn apply(&mut self, request: &ReconcileRequest) -> ExecOutcome {
        tracing::info!(name = %request.name.as_str(), flake = %request.flake_uri.as_str(), state = ?request.desired_state, "executor apply (stand-in)");
        ExecOutcome::Applied
    }

    fn remove(&mut self, name: &ServiceName) -> ExecOutcome {
        tracing::info!(name = %name.as_str(), "executor remove (stand-in)");
        ExecOutcome::Applied
    }

    fn status(&self, _name: &ServiceName) -> Option<ExecOutcome> {
        None
    }
}

/// Reconciler errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileError {
    /// No work is due for this name yet (backoff has not elapsed).
    #[error("backoff not yet elapsed")]
    Backoff,
}

#[derive(Clone, Copy, Debug)]
struct RetryState {
    attempts: u32,
    next_attempt_after: Duration,
    permanently_failed: bool,
}

impl RetryState {
    fn fresh() -> Self {
        Self { attempts: 0, next_attempt_after: Duration::ZERO, permanently_failed: false }
    }
}

/// Backoff ceiling: retries never wait longer than this between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Backoff floor for the first retry.
const BASE_BACKOFF: Duration = Duration::from_millis(500);

fn backoff_for(attempts: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32.checked_shl(attempts.min(16)).unwrap_or(u32::MAX));
    if exp > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        exp
    }
}

fn jittered<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let jitter_ms = rng.gen_range(0..=(base.as_millis() as u64 / 4 + 1));
    base + Duration::from_millis(jitter_ms)
}

/// Tracks, per service, the last reconciled version and retry/backoff state,
/// and drives an [`Executor`] toward catalog-declared desired states.
pub struct Reconciler {
    last_applied_version: BTreeMap<ServiceName, u64>,
    retry: BTreeMap<ServiceName, RetryState>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    /// Empty reconciler, no history.
    pub fn new() -> Self {
        Self { last_applied_version: BTreeMap::new(), retry: BTreeMap::new() }
    }

    /// True if `name` at `version` has already been successfully applied.
    pub fn is_up_to_date(&self, name: &ServiceName, version: u64) -> bool {
        self.last_applied_version.get(name) == Some(&version)
    }

    /// True if `name` is within an unexpired backoff window and should be
    /// skipped this tick.
    pub fn is_backing_off(&self, name: &ServiceName, elapsed_since_last_attempt: Duration) -> bool {
        match self.retry.get(name) {
            Some(state) if state.permanently_failed => true,
            Some(state) => elapsed_since_last_attempt < state.next_attempt_after,
            None => false,
        }
    }

    /// Attempt `request` against `executor` synchronously, updating
    /// retry/backoff and last-applied-version bookkeeping based on the
    /// outcome. Exercised by tests and by anything driving an [`Executor`]
    /// directly; the tick loop instead goes through [`WorkerPool`] and
    /// [`Reconciler::record_outcome`] so a slow `apply()` does not block it.
    pub fn reconcile<E: Executor, R: Rng + ?Sized>(
        &mut self,
        executor: &mut E,
        request: &ReconcileRequest,
        version: u64,
        rng: &mut R,
    ) -> ExecOutcome {
        let outcome = executor.apply(request);
        self.record_outcome(request.name, version, outcome, rng);
        outcome
    }

    /// Update retry/backoff and last-applied-version bookkeeping for an
    /// `outcome` that was produced off-thread by a [`WorkerPool`] worker.
    pub fn record_outcome<R: Rng + ?Sized>(&mut self, name: ServiceName, version: u64, outcome: ExecOutcome, rng: &mut R) {
        match outcome {
            ExecOutcome::Applied => {
                self.last_applied_version.insert(name, version);
                self.retry.remove(&name);
            }
            ExecOutcome::Transient => {
                let state = self.retry.entry(name).or_insert_with(RetryState::fresh);
                state.attempts = state.attempts.saturating_add(1);
                state.next_attempt_after = jittered(backoff_for(state.attempts), rng);
            }
            ExecOutcome::Permanent => {
                let state = self.retry.entry(name).or_insert_with(RetryState::fresh);
                state.permanently_failed = true;
            }
        }
    }

    /// Clear permanent-failure/backoff state for `name` — called when a new
    /// version arrives for a previously permanently-failed service (spec
    /// §4.10: "not retried until a new version arrives").
    pub fn reset_for_new_version(&mut self, name: &ServiceName) {
        self.retry.remove(name);
    }
}

/// One [`ReconcileRequest`] submitted to a [`WorkerPool`], tagged with the
/// catalog version it was reconciling so a stale result can be told apart
/// from the latest one.
struct Job {
    name: ServiceName,
    version: u64,
    request: ReconcileRequest,
}

/// A completed [`Job`], drained by the tick loop once per tick.
pub struct JobResult {
    /// Catalog key the job was for.
    pub name: ServiceName,
    /// Version that was being reconciled.
    pub version: u64,
    /// What the executor reported.
    pub outcome: ExecOutcome,
}

/// Bounded pool of OS threads applying [`Executor::apply`] off the tick
/// thread (spec §5: executor calls SHOULD be issued to a bounded worker
/// pool so the tick is never blocked by a slow or hanging collaborator).
/// The executor is shared behind a mutex since `Executor::apply` takes
/// `&mut self`; a real collaborator is expected to do its own work
/// (spawning a subprocess, waiting on systemd) rather than hold the lock
/// for long.
pub struct WorkerPool<E> {
    jobs_tx: std::sync::mpsc::SyncSender<Job>,
    results_rx: std::sync::mpsc::Receiver<JobResult>,
    _workers: Vec<std::thread::JoinHandle<()>>,
    _executor: std::marker::PhantomData<E>,
}

impl<E: Executor + Send + 'static> WorkerPool<E> {
    /// Spawn `workers` threads (at least one) sharing `executor`, each
    /// pulling jobs from a channel bounded to `queue_depth` in-flight
    /// requests. `try_submit` beyond that bound fails instead of blocking.
    pub fn spawn(executor: E, workers: usize, queue_depth: usize) -> Self {
        use std::sync::mpsc::sync_channel;
        use std::sync::{Arc, Mutex};

        let executor = Arc::new(Mutex::new(executor));
        let (jobs_tx, jobs_rx) = sync_channel::<Job>(queue_depth.max(1));
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (results_tx, results_rx) = sync_channel::<JobResult>(queue_depth.max(1));

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            let executor = executor.clone();
            handles.push(std::thread::spawn(move || loop {
                let job = {
                    let rx = jobs_rx.lock().unwrap_or_else(|e| e.into_inner());
                    rx.recv()
                };
                let Ok(job) = job else { break };
                let outcome = executor.lock().unwrap_or_else(|e| e.into_inner()).apply(&job.request);
                if results_tx.send(JobResult { name: job.name, version: job.version, outcome }).is_err() {
                    break;
                }
            }));
        }

        Self { jobs_tx, results_rx, _workers: handles, _executor: std::marker::PhantomData }
    }

    /// Submit a job without blocking; returns `false` if the bounded queue
    /// is full, so the caller can leave the name dirty and retry next tick.
    pub fn try_submit(&self, name: ServiceName, version: u64, request: ReconcileRequest) -> bool {
        self.jobs_tx.try_send(Job { name, version, request }).is_ok()
    }

    /// Drain every job completed since the last call, without blocking.
    pub fn drain_results(&self) -> Vec<JobResult> {
        let mut out = Vec::new();
        while let Ok(r) = self.results_rx.try_recv() {
            out.push(r);
        }
        out
    }
}
