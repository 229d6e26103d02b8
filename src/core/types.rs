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

//! Deterministic core types and canonical encoding helpers.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::core::bounded::BoundedString;
use crate::core::clock::HlcTimestamp;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization")]
    Serialize,
    /// Deserialization failed.
    #[error("deserialization")]
    Deserialize,
    /// Decoded/input payload exceeded the caller's size cap.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic, fixed-width integers).
fn bincode_opts() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering
/// (use `BTreeMap`/`BTreeSet`, never `HashMap`/`HashSet`).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts().serialize(v).map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap, defending against memory/CPU bombs via large
/// container lengths embedded in the wire bytes.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// Encode directly into a caller-provided fixed buffer (no heap allocation),
/// for use on the hot frame-build path. Returns the number of bytes written.
pub fn encode_canonical_into<T: Serialize>(v: &T, out: &mut [u8]) -> Result<usize, CodecError> {
    let mut cursor = std::io::Cursor::new(&mut out[..]);
    bincode_opts()
        .serialize_into(&mut cursor, v)
        .map_err(|_| CodecError::Serialize)?;
    Ok(cursor.position() as usize)
}

/// 32-byte node identity: the node's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Construct from raw bytes.
    pub const fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    /// Borrow as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded representation, for logging and the admin surface.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}…)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Ed25519 signature bytes (always 64 on the wire, but kept `Vec` for the
/// rare legacy/compat path — mirrors the upstream `Signature` shape).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// Maximum byte length of a service name.
pub const SERVICE_NAME_CAP: usize = 64;
/// Maximum byte length of a flake URI / package descriptor.
pub const FLAKE_URI_CAP: usize = 192;
/// Maximum byte length of an executor token.
pub const EXEC_NAME_CAP: usize = 32;
/// Maximum byte length of a peer alias.
pub const PEER_ALIAS_CAP: usize = 64;
/// Maximum byte length of a peer network address.
pub const PEER_ADDR_CAP: usize = 64;

/// Service name: a bounded, unique catalog key.
pub type ServiceName = BoundedString<SERVICE_NAME_CAP>;
/// Artifact descriptor understood by the executor collaborator.
pub type FlakeUri = BoundedString<FLAKE_URI_CAP>;
/// Executor token naming the runnable unit.
pub type ExecName = BoundedString<EXEC_NAME_CAP>;
/// Peer alias.
pub type PeerAlias = BoundedString<PEER_ALIAS_CAP>;
/// Peer network address (e.g. "host:port").
pub type PeerAddress = BoundedString<PEER_ADDR_CAP>;

/// A single replicated service definition.
///
/// `sizeof(ServiceRecord)` after canonical encoding must fit comfortably
/// inside one frame's payload capacity; see `core::wire::frame::PAYLOAD_CAPACITY`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique catalog key.
    pub name: ServiceName,
    /// Writer-maintained monotonic version; ties broken by `hlc`.
    pub version: u64,
    /// HLC timestamp of the last accepted write.
    pub hlc: HlcTimestamp,
    /// Artifact descriptor (flake URI, package reference, ...).
    pub flake_uri: FlakeUri,
    /// Executor token.
    pub exec_name: ExecName,
    /// LWW delete marker. Retained until GC threshold (see `core::state::wal`).
    pub tombstone: bool,
}

impl ServiceRecord {
    /// Ordering key used by the LWW merge rule: `(version, hlc)`.
    pub fn order_key(&self) -> (u64, HlcTimestamp) {
        (self.version, self.hlc)
    }
}

/// Node configuration root, loaded from an optional TOML file named by
/// `MYCO_CONFIG` (env vars cover the rest; see `node::config`).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Bootstrap peers to dial at startup (`alias addr pubkey_hex` rows, same
    /// shape as the peer book file).
    #[serde(default)]
    pub bootstrap: Vec<BootstrapPeer>,
}

/// One statically-configured bootstrap peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// Human-readable alias.
    pub alias: String,
    /// Network address ("host:port").
    pub address: String,
    /// Ed25519 public key, hex-encoded.
    pub pubkey_hex: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_roundtrip() {
        let rec = ServiceRecord {
            name: ServiceName::new("redis").unwrap(),
            version: 3,
            hlc: HlcTimestamp::zero(NodeId::from_bytes([1; 32])),
            flake_uri: FlakeUri::new("github:nixos/nixpkgs#redis").unwrap(),
            exec_name: ExecName::new("redis-server").unwrap(),
            tombstone: false,
        };
        let bytes = encode_canonical(&rec).unwrap();
        let back: ServiceRecord = decode_canonical_limited(&bytes, 4096).unwrap();
        assert_eq!(rec, back);
    }

    #[test]
    fn decode_rejects_oversized_input() {
        let bytes = vec![0u8; 128];
        let err = decode_canonical_limited::<ServiceRecord>(&bytes, 16).unwrap_err();
        matches!(err, CodecError::TooLarge);
    }
}
