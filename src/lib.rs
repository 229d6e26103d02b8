// Copyright (c) 2026 Amunchain
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

//! Myco - a decentralized mesh orchestrator.
//!
//! This crate provides:
//! - Deterministic types, canonical encoding, and a hybrid logical clock
//! - A gossip transport over fixed-size sealed UDP frames (AES-256-GCM)
//! - CRDT catalog replication with last-writer-wins conflict resolution
//! - A write-ahead log for crash-safe catalog recovery
//! - A synchronous tick loop reconciling desired state against an [`core::reconcile::Executor`]
//! - An admin HTTP surface for deploys, peer management, and Prometheus scraping

/// Core protocol primitives (types, clock, wire format, gossip, state, security).
pub mod core;
/// Observability (Prometheus metrics).
pub mod monitoring;
/// Peer book and bounded peer bookkeeping.
pub mod networking;
/// Node assembly: bootstrap, the synchronous tick loop, transport, and config.
pub mod node;
/// Local admin HTTP surface (deploys, peer management, status, metrics).
pub mod admin;
