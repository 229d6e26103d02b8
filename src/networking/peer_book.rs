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

//! Local peer book: a bounded, unsigned table of known peers persisted as
//! TOML at `data_dir/peer_book.toml`, loaded at startup and rewritten
//! (atomically) whenever membership changes.
//!
//! This is not a trust boundary — admission control lives in the wire
//! handshake (`core::wire::channel`) and the per-node quarantine table
//! (`node::state::Quarantine`); the book is just a bounded address cache so
//! gossip has somewhere to start and survive a restart.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::bounded::BoundedString;
use crate::core::types::NodeId;

/// Compile-time cap on distinct known peers (spec.md §3).
pub const MAX_PEERS: usize = 256;

/// Peer book errors.
#[derive(Debug, Error)]
pub enum PeerBookError {
    /// File I/O failed.
    #[error("peer book io")]
    Io,
    /// TOML (de)serialization failed.
    #[error("peer book format")]
    Format,
    /// Peer book is at `MAX_PEERS` and the entry being inserted is new.
    #[error("peer book at capacity")]
    AtCapacity,
    /// `alias` or `address` exceeds its fixed-size buffer.
    #[error("peer book field too long")]
    FieldTooLong,
}

/// One entry in the local peer book, held in fixed-size buffers (spec.md
/// §4.4: no heap allocation after init) rather than heap-allocated `String`s.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerBookEntry {
    /// Human-readable alias (not authenticated).
    pub alias: BoundedString<64>,
    /// Last-known network address ("host:port").
    pub address: BoundedString<64>,
    /// Ed25519 public key, used as the gossip identity.
    pub pubkey: NodeId,
    /// Milliseconds since UNIX epoch of the last successfully authenticated
    /// frame from this peer. Zero if never contacted.
    #[serde(default)]
    pub last_seen_ms: u64,
}

impl PeerBookEntry {
    /// Build an entry from wire/config-facing plain strings, rejecting an
    /// `alias` or `address` over the 64-byte buffer and a malformed pubkey.
    pub fn new(alias: &str, address: &str, pubkey_hex: &str) -> Result<Self, PeerBookError> {
        let alias = BoundedString::new(alias).map_err(|_| PeerBookError::FieldTooLong)?;
        let address = BoundedString::new(address).map_err(|_| PeerBookError::FieldTooLong)?;
        let pubkey = node_id_from_hex(pubkey_hex).ok_or(PeerBookError::Format)?;
        Ok(Self { alias, address, pubkey, last_seen_ms: 0 })
    }

    fn node_id(&self) -> Option<NodeId> {
        Some(self.pubkey)
    }
}

fn node_id_from_hex(pubkey_hex: &str) -> Option<NodeId> {
    let bytes = hex::decode(pubkey_hex).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(NodeId::from_bytes(arr))
}

#[derive(Default, Serialize, Deserialize)]
struct PeerBookFile {
    #[serde(default)]
    peers: Vec<PeerBookEntry>,
}

/// Bounded, persisted table of known peers.
pub struct PeerBook {
    path: PathBuf,
    entries: BTreeMap<NodeId, PeerBookEntry>,
}

impl PeerBook {
    /// Load `data_dir/peer_book.toml`, or start empty if it does not exist.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self, PeerBookError> {
        let path = data_dir.as_ref().join("peer_book.toml");
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|_| PeerBookError::Io)?;
            let file: PeerBookFile = toml::from_str(&raw).map_err(|_| PeerBookError::Format)?;
            file.peers
                .into_iter()
                .filter_map(|e| e.node_id().map(|id| (id, e)))
                .collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Seed the book from `bootstrap` entries without exceeding `MAX_PEERS`,
    /// used on first startup when no peer book file exists yet.
    pub fn seed(&mut self, bootstrap: impl IntoIterator<Item = PeerBookEntry>) -> Result<(), PeerBookError> {
        for entry in bootstrap {
            self.upsert(entry)?;
        }
        Ok(())
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate all known peers.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerBookEntry)> {
        self.entries.iter()
    }

    /// Insert or update an entry, enforcing `MAX_PEERS` for genuinely new
    /// identities.
    pub fn upsert(&mut self, entry: PeerBookEntry) -> Result<(), PeerBookError> {
        let id = entry.node_id().ok_or(PeerBookError::Format)?;
        if !self.entries.contains_key(&id) && self.entries.len() >= MAX_PEERS {
            return Err(PeerBookError::AtCapacity);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Update `last_seen_ms` for a known peer; a no-op if the peer is not in
    /// the book.
    pub fn touch(&mut self, id: NodeId, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_seen_ms = now_ms;
        }
    }

    /// Remove every entry with a matching `alias` (admin `PeerRemove`).
    /// Returns true if at least one entry was removed.
    pub fn remove_by_alias(&mut self, alias: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.alias.as_str() != alias);
        self.entries.len() != before
    }

    /// Atomically rewrite the backing TOML file (write-to-temp, fsync,
    /// rename), mirroring the atomic key-write idiom used for identity
    /// material.
    pub fn persist(&self) -> Result<(), PeerBookError> {
        let file = PeerBookFile { peers: self.entries.values().cloned().collect() };
        let raw = toml::to_string_pretty(&file).map_err(|_| PeerBookError::Format)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|_| PeerBookError::Io)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut f = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .map_err(|_| PeerBookError::Io)?;
            f.write_all(raw.as_bytes()).map_err(|_| PeerBookError::Io)?;
            f.sync_all().map_err(|_| PeerBookError::Io)?;
        }
        fs::rename(&tmp, &self.path).map_err(|_| PeerBookError::Io)?;
        Ok(())
    }

    /// Entry for `id`, if known.
    pub fn lookup(&self, id: &NodeId) -> Option<&PeerBookEntry> {
        self.entries.get(id)
    }
}
