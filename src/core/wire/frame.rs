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

//! Fixed 1024-byte wire frame: header layout, message types, and
//! plaintext-region (de)serialization. Sealing/opening the payload under
//! AES-256-GCM lives in `core::wire::channel`; this module only knows about
//! byte layout.
//!
//! ```text
//! offset  field        len
//! 0       magic        4
//! 4       version      1
//! 5       msg_type     1
//! 6       flags        2
//! 8       sender_id    32
//! 40      epoch        4
//! 44      nonce        12
//! 56      seq          8
//! 64      payload_len  2
//! 66      payload      payload_len (ciphertext), rest zero-padded
//! 1008    tag          16
//! ```

use thiserror::Error;

use crate::core::types::NodeId;

/// Total on-wire frame size. `send()`/`recv()` at the socket layer must
/// reject any datagram not exactly this length.
pub const FRAME_LEN: usize = 1024;
/// Byte offset where the fixed header ends and the payload region begins.
pub const HEADER_LEN: usize = 66;
/// AEAD authentication tag length (AES-256-GCM).
pub const TAG_LEN: usize = 16;
/// Maximum plaintext payload a single frame can carry.
pub const PAYLOAD_CAPACITY: usize = FRAME_LEN - HEADER_LEN - TAG_LEN;

const _: () = assert!(PAYLOAD_CAPACITY == 942);

const MAGIC: [u8; 4] = *b"MYC0";
/// Current wire protocol revision.
pub const PROTOCOL_VERSION: u8 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_MSG_TYPE: usize = 5;
const OFF_FLAGS: usize = 6;
const OFF_SENDER: usize = 8;
const OFF_EPOCH: usize = 40;
const OFF_NONCE: usize = 44;
const OFF_SEQ: usize = 56;
const OFF_PAYLOAD_LEN: usize = 64;
const OFF_PAYLOAD: usize = HEADER_LEN;
const OFF_TAG: usize = FRAME_LEN - TAG_LEN;

/// Frame decode errors. Every variant is a drop-and-count outcome, never a
/// panic (see spec §7: protocol errors are silently dropped, not fatal).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram was not exactly [`FRAME_LEN`] bytes.
    #[error("frame is not {FRAME_LEN} bytes")]
    WrongSize,
    /// Magic bytes did not match.
    #[error("bad magic")]
    BadMagic,
    /// `version` byte names an unsupported protocol revision.
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    /// `msg_type` byte is not a recognized message type.
    #[error("unknown message type")]
    UnknownMsgType,
    /// `payload_len` exceeds [`PAYLOAD_CAPACITY`].
    #[error("payload_len overflow")]
    PayloadLenOverflow,
    /// Payload claimed to be compressed but failed to decompress.
    #[error("decompression failed")]
    DecompressionFailed,
}

/// Wire message types (spec §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Handshake initiation, signed to prove possession of `sender_id`'s key.
    Hello = 0,
    /// Handshake response.
    HelloAck = 1,
    /// Bounded `(name, version)` digest advertisement.
    GossipSummary = 2,
    /// Request for full records the sender is missing or behind on.
    PullRequest = 3,
    /// Full records answering a `PullRequest`.
    PullResponse = 4,
    /// Keepalive carrying no catalog data.
    Heartbeat = 5,
    /// A bounded set of peer book entries offered to a neighbor.
    PeerExchange = 6,
}

impl MsgType {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Hello,
            1 => Self::HelloAck,
            2 => Self::GossipSummary,
            3 => Self::PullRequest,
            4 => Self::PullResponse,
            5 => Self::Heartbeat,
            6 => Self::PeerExchange,
            _ => return None,
        })
    }
}

/// Bit flags carried in the frame header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// Bit 0: payload was zstd-compressed before sealing.
    pub compressed: bool,
    /// Bit 1: final frame in a multi-frame series (e.g. a paginated pull response).
    pub last_in_series: bool,
}

impl FrameFlags {
    fn to_u16(self) -> u16 {
        (self.compressed as u16) | ((self.last_in_series as u16) << 1)
    }

    fn from_u16(bits: u16) -> Self {
        Self { compressed: bits & 0b01 != 0, last_in_series: bits & 0b10 != 0 }
    }
}

/// Decoded frame header (everything except the payload bytes and tag).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message type.
    pub msg_type: MsgType,
    /// Header flags.
    pub flags: FrameFlags,
    /// Claimed sender identity; authenticated by the AEAD tag, not by itself.
    pub sender_id: NodeId,
    /// Key epoch in effect when this frame was sealed.
    pub epoch: u32,
    /// 12-byte AEAD nonce: `sender_id_prefix(4) || seq(8)`.
    pub nonce: [u8; 12],
    /// Per-(sender, receiver) monotone sequence number.
    pub seq: u64,
    /// Length, in bytes, of the meaningful (unpadded) payload.
    pub payload_len: u16,
}

/// Derive the 12-byte AEAD nonce from a sender and sequence number, per
/// spec §4.2: `[sender_id_prefix(4) || seq(8)]`.
pub fn derive_nonce(sender_id: &NodeId, seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&sender_id.as_bytes()[..4]);
    nonce[4..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// A full 1024-byte on-wire frame buffer, in whatever state (sealed or
/// being assembled) the caller is working with.
#[derive(Clone)]
pub struct RawFrame(pub [u8; FRAME_LEN]);

impl RawFrame {
    /// Zero-initialized frame buffer.
    pub fn zeroed() -> Self {
        Self([0u8; FRAME_LEN])
    }

    /// Write `header` into the buffer's fixed fields. Does not touch the
    /// payload or tag regions.
    pub fn set_header(&mut self, header: &FrameHeader) {
        let buf = &mut self.0;
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC);
        buf[OFF_VERSION] = PROTOCOL_VERSION;
        buf[OFF_MSG_TYPE] = header.msg_type as u8;
        buf[OFF_FLAGS..OFF_FLAGS + 2].copy_from_slice(&header.flags.to_u16().to_le_bytes());
        buf[OFF_SENDER..OFF_SENDER + 32].copy_from_slice(header.sender_id.as_bytes());
        buf[OFF_EPOCH..OFF_EPOCH + 4].copy_from_slice(&header.epoch.to_le_bytes());
        buf[OFF_NONCE..OFF_NONCE + 12].copy_from_slice(&header.nonce);
        buf[OFF_SEQ..OFF_SEQ + 8].copy_from_slice(&header.seq.to_le_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&header.payload_len.to_le_bytes());
    }

    /// Parse and validate the header fields. Does not verify the AEAD tag.
    pub fn header(&self) -> Result<FrameHeader, FrameError> {
        let buf = &self.0;
        if buf[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        if buf[OFF_VERSION] != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion);
        }
        let msg_type = MsgType::from_u8(buf[OFF_MSG_TYPE]).ok_or(FrameError::UnknownMsgType)?;
        let flags = FrameFlags::from_u16(u16::from_le_bytes(buf[OFF_FLAGS..OFF_FLAGS + 2].try_into().unwrap()));
        let mut sender = [0u8; 32];
        sender.copy_from_slice(&buf[OFF_SENDER..OFF_SENDER + 32]);
        let epoch = u32::from_le_bytes(buf[OFF_EPOCH..OFF_EPOCH + 4].try_into().unwrap());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&buf[OFF_NONCE..OFF_NONCE + 12]);
        let seq = u64::from_le_bytes(buf[OFF_SEQ..OFF_SEQ + 8].try_into().unwrap());
        let payload_len = u16::from_le_bytes(buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].try_into().unwrap());
        if payload_len as usize > PAYLOAD_CAPACITY {
            return Err(FrameError::PayloadLenOverflow);
        }

        Ok(FrameHeader {
            msg_type,
            flags,
            sender_id: NodeId::from_bytes(sender),
            epoch,
            nonce,
            seq,
            payload_len,
        })
    }

    /// Bytes used as AEAD associated data: the whole fixed header region.
    pub fn header_bytes(&self) -> &[u8; HEADER_LEN] {
        self.0[..HEADER_LEN].try_into().unwrap()
    }

    /// Mutable view of the payload region, sized to `payload_len` bytes
    /// starting at the payload offset.
    pub fn payload_region_mut(&mut self, payload_len: u16) -> &mut [u8] {
        &mut self.0[OFF_PAYLOAD..OFF_PAYLOAD + payload_len as usize]
    }

    /// Immutable view of the payload region.
    pub fn payload_region(&self, payload_len: u16) -> &[u8] {
        &self.0[OFF_PAYLOAD..OFF_PAYLOAD + payload_len as usize]
    }

    /// The 16-byte AEAD tag slot.
    pub fn tag(&self) -> &[u8; TAG_LEN] {
        self.0[OFF_TAG..].try_into().unwrap()
    }

    /// Mutable view of the tag slot.
    pub fn tag_mut(&mut self) -> &mut [u8] {
        &mut self.0[OFF_TAG..]
    }

    /// Validate and decode a raw 1024-byte datagram into a `RawFrame`.
    pub fn from_datagram(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::WrongSize);
        }
        let mut buf = [0u8; FRAME_LEN];
        buf.copy_from_slice(bytes);
        let frame = Self(buf);
        frame.header()?;
        Ok(frame)
    }

    /// Borrow the full fixed-size datagram for sending over a socket.
    pub fn as_datagram(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

/// zstd compression level used for optional payload compression. Low: the
/// payloads here are small catalog records, not bulk data, so the win is in
/// CPU, not ratio.
const ZSTD_LEVEL: i32 = 3;

/// Compress `payload` if doing so makes it smaller and the result still
/// fits in one frame. Returns the bytes to actually send and whether they
/// are compressed (to set `FrameFlags::compressed`).
pub fn maybe_compress(payload: &[u8]) -> (Vec<u8>, bool) {
    match zstd::stream::encode_all(payload, ZSTD_LEVEL) {
        Ok(compressed) if compressed.len() < payload.len() && compressed.len() <= PAYLOAD_CAPACITY => {
            (compressed, true)
        }
        _ => (payload.to_vec(), false),
    }
}

/// Inverse of [`maybe_compress`]: decompress `bytes` if `compressed` is set.
pub fn decompress_if_needed(bytes: &[u8], compressed: bool) -> Result<Vec<u8>, FrameError> {
    if !compressed {
        return Ok(bytes.to_vec());
    }
    zstd::stream::decode_all(bytes).map_err(|_| FrameError::DecompressionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            msg_type: MsgType::Heartbeat,
            flags: FrameFlags { compressed: false, last_in_series: true },
            sender_id: NodeId::from_bytes([7; 32]),
            epoch: 1,
            nonce: derive_nonce(&NodeId::from_bytes([7; 32]), 42),
            seq: 42,
            payload_len: 10,
        }
    }

    #[test]
    fn header_round_trips() {
        let mut frame = RawFrame::zeroed();
        let header = sample_header();
        frame.set_header(&header);
        let parsed = frame.header().unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn wrong_size_datagram_is_rejected() {
        let bytes = vec![0u8; 512];
        assert_eq!(RawFrame::from_datagram(&bytes).unwrap_err(), FrameError::WrongSize);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = RawFrame::zeroed();
        frame.set_header(&sample_header());
        frame.0[0] = 0xFF;
        assert_eq!(frame.header().unwrap_err(), FrameError::BadMagic);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut frame = RawFrame::zeroed();
        frame.set_header(&sample_header());
        frame.0[4] = PROTOCOL_VERSION + 1;
        assert_eq!(frame.header().unwrap_err(), FrameError::UnsupportedVersion);
    }

    #[test]
    fn payload_len_overflow_is_rejected() {
        let mut frame = RawFrame::zeroed();
        let mut header = sample_header();
        header.payload_len = (PAYLOAD_CAPACITY + 1) as u16;
        frame.set_header(&header);
        assert_eq!(frame.header().unwrap_err(), FrameError::PayloadLenOverflow);
    }

    #[test]
    fn payload_capacity_matches_frame_arithmetic() {
        assert_eq!(PAYLOAD_CAPACITY, FRAME_LEN - HEADER_LEN - TAG_LEN);
    }

    #[test]
    fn compressible_payload_round_trips_and_shrinks() {
        let payload = vec![b'a'; 500];
        let (compressed, did_compress) = maybe_compress(&payload);
        assert!(did_compress);
        assert!(compressed.len() < payload.len());
        let restored = decompress_if_needed(&compressed, true).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn incompressible_small_payload_is_left_uncompressed() {
        let payload = b"hi".to_vec();
        let (bytes, did_compress) = maybe_compress(&payload);
        assert!(!did_compress);
        assert_eq!(bytes, payload);
    }
}
