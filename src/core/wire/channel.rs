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

//! Secure channel: per-neighbor AES-256-GCM sealing/opening of frames, with
//! a 1024-entry sliding anti-replay window per source.
//!
//! Key derivation (spec §4.2): `k = H(sorted(pub_A, pub_B) || psk || epoch)`.
//! The associated data authenticated alongside each frame is the frame's
//! entire fixed header (including `payload_len`) — stricter than the literal
//! byte range in the wire table, which would leave `payload_len` outside the
//! authenticated region; see DESIGN.md.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{NodeId, Signature};
use crate::core::wire::frame::{
    decompress_if_needed, derive_nonce, maybe_compress, FrameError, FrameFlags, FrameHeader, MsgType, RawFrame,
    PAYLOAD_CAPACITY, TAG_LEN,
};

/// Body of a `Hello` frame (spec.md §4.3): proof the sender holds the
/// private key for the `sender_id` claimed in the frame header, a property
/// the AEAD channel key alone does not establish (it authenticates the
/// frame, not a binding between `sender_id` and a private key). Signs
/// `local || remote` so a Hello captured on one channel cannot be replayed
/// as a valid Hello to a different recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloBody {
    /// Signature over `sender.as_bytes() || recipient.as_bytes()`.
    pub signature: Signature,
}

impl HelloBody {
    /// The message a `Hello` signature covers.
    pub fn signed_message(sender: NodeId, recipient: NodeId) -> Vec<u8> {
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(sender.as_bytes());
        msg.extend_from_slice(recipient.as_bytes());
        msg
    }
}

/// Width of the sliding anti-replay window, in sequence numbers (spec §4.2).
const REPLAY_WINDOW_BITS: usize = 1024;
const REPLAY_WINDOW_WORDS: usize = REPLAY_WINDOW_BITS / 64;

/// Secure channel errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The frame header itself failed to parse/validate.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    /// Plaintext exceeds [`PAYLOAD_CAPACITY`].
    #[error("payload too large for one frame")]
    PayloadTooLarge,
    /// AEAD tag verification failed.
    #[error("mac verification failed")]
    TagInvalid,
    /// `seq` was already accepted, or falls below the window floor.
    #[error("replayed or stale sequence number")]
    Replay,
    /// Frame's `epoch` does not match this channel's current epoch.
    #[error("key epoch mismatch")]
    EpochMismatch,
    /// Key derivation/AEAD setup failed (should not happen for a 32-byte key).
    #[error("crypto setup")]
    Crypto,
}

/// Derive the shared AES-256-GCM key for a pair of nodes at a given epoch.
///
/// `sorted(pub_A, pub_B)` makes the derivation direction-independent so both
/// ends of a channel compute the same key.
pub fn derive_channel_key(a: &NodeId, b: &NodeId, psk: &[u8], epoch: u32) -> [u8; 32] {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() { (a, b) } else { (b, a) };
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(lo.as_bytes());
    ctx.update(hi.as_bytes());
    ctx.update(psk);
    ctx.update(&epoch.to_le_bytes());
    let out = ctx.finish();
    let mut key = [0u8; 32];
    key.copy_from_slice(out.as_ref());
    key
}

/// Sliding anti-replay window: bit `d` (0-indexed from `highest`) records
/// whether `seq = highest - d` has been accepted.
struct ReplayWindow {
    highest: Option<u64>,
    bits: [u64; REPLAY_WINDOW_WORDS],
}

impl ReplayWindow {
    fn new() -> Self {
        Self { highest: None, bits: [0u64; REPLAY_WINDOW_WORDS] }
    }

    /// Peek whether `seq` would be accepted, without mutating state.
    fn would_accept(&self, seq: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if seq > highest => true,
            Some(highest) => {
                let diff = highest - seq;
                if diff as usize >= REPLAY_WINDOW_BITS {
                    return false;
                }
                let word = (diff / 64) as usize;
                let bit = diff % 64;
                self.bits[word] & (1u64 << bit) == 0
            }
        }
    }

    /// Commit `seq` as accepted. Caller must have just confirmed
    /// `would_accept(seq)` returned `true` (typically right after a
    /// successful tag verification).
    fn accept(&mut self, seq: u64) {
        match self.highest {
            None => {
                self.highest = Some(seq);
                self.bits = [0u64; REPLAY_WINDOW_WORDS];
                self.bits[0] = 1;
            }
            Some(highest) if seq > highest => {
                let shift = seq - highest;
                shift_left(&mut self.bits, shift);
                self.bits[0] |= 1;
                self.highest = Some(seq);
            }
            Some(highest) => {
                let diff = highest - seq;
                let word = (diff / 64) as usize;
                let bit = diff % 64;
                self.bits[word] |= 1u64 << bit;
            }
        }
    }
}

fn shift_left(bits: &mut [u64; REPLAY_WINDOW_WORDS], shift: u64) {
    if shift as usize >= REPLAY_WINDOW_BITS {
        *bits = [0u64; REPLAY_WINDOW_WORDS];
        return;
    }
    let word_shift = (shift / 64) as usize;
    let bit_shift = (shift % 64) as u32;

    if word_shift > 0 {
        for i in (word_shift..REPLAY_WINDOW_WORDS).rev() {
            bits[i] = bits[i - word_shift];
        }
        for i in 0..word_shift {
            bits[i] = 0;
        }
    }
    if bit_shift > 0 {
        for i in (1..REPLAY_WINDOW_WORDS).rev() {
            bits[i] = (bits[i] << bit_shift) | (bits[i - 1] >> (64 - bit_shift));
        }
        bits[0] <<= bit_shift;
    }
}

/// A sealed channel to one neighbor: send-side sequence counter plus
/// receive-side replay window, both keyed to the current epoch.
pub struct SecureChannel {
    local: NodeId,
    remote: NodeId,
    epoch: u32,
    key: LessSafeKey,
    send_seq: u64,
    replay: ReplayWindow,
    mac_failures: u64,
    replay_drops: u64,
}

impl SecureChannel {
    /// Establish a channel keyed for `epoch` between `local` and `remote`.
    pub fn new(local: NodeId, remote: NodeId, psk: &[u8], epoch: u32) -> Result<Self, ChannelError> {
        let key = Self::build_key(&local, &remote, psk, epoch)?;
        Ok(Self {
            local,
            remote,
            epoch,
            key,
            send_seq: 0,
            replay: ReplayWindow::new(),
            mac_failures: 0,
            replay_drops: 0,
        })
    }

    fn build_key(local: &NodeId, remote: &NodeId, psk: &[u8], epoch: u32) -> Result<LessSafeKey, ChannelError> {
        let bytes = derive_channel_key(local, remote, psk, epoch);
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes).map_err(|_| ChannelError::Crypto)?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Re-key for a new epoch (spec §4.2 key rotation). The send sequence
    /// counter restarts at zero; the replay window resets, since sequence
    /// numbers are only meaningful within one epoch.
    pub fn rotate_epoch(&mut self, psk: &[u8], epoch: u32) -> Result<(), ChannelError> {
        self.key = Self::build_key(&self.local, &self.remote, psk, epoch)?;
        self.epoch = epoch;
        self.send_seq = 0;
        self.replay = ReplayWindow::new();
        Ok(())
    }

    /// This channel's remote peer.
    pub fn remote(&self) -> NodeId {
        self.remote
    }

    /// Count of frames dropped for AEAD tag failure since channel creation.
    pub fn mac_failures(&self) -> u64 {
        self.mac_failures
    }

    /// Count of frames dropped as replayed/stale since channel creation.
    pub fn replay_drops(&self) -> u64 {
        self.replay_drops
    }

    /// Seal `plaintext` as a new frame of `msg_type`, consuming the next
    /// send sequence number.
    pub fn seal(&mut self, msg_type: MsgType, flags: FrameFlags, plaintext: &[u8]) -> Result<RawFrame, ChannelError> {
        if plaintext.len() > PAYLOAD_CAPACITY {
            return Err(ChannelError::PayloadTooLarge);
        }
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);

        let header = FrameHeader {
            msg_type,
            flags,
            sender_id: self.local,
            epoch: self.epoch,
            nonce: derive_nonce(&self.local, seq),
            seq,
            payload_len: plaintext.len() as u16,
        };

        let mut frame = RawFrame::zeroed();
        frame.set_header(&header);

        let mut in_out = plaintext.to_vec();
        let nonce = Nonce::assume_unique_for_key(header.nonce);
        let aad = Aad::from(*frame.header_bytes());
        self.key
            .seal_in_place_append_tag(nonce, aad, &mut in_out)
            .map_err(|_| ChannelError::Crypto)?;

        debug_assert_eq!(in_out.len(), plaintext.len() + TAG_LEN);
        frame.payload_region_mut(header.payload_len).copy_from_slice(&in_out[..plaintext.len()]);
        frame.tag_mut().copy_from_slice(&in_out[plaintext.len()..]);

        Ok(frame)
    }

    /// Seal `plaintext`, zstd-compressing it first when that shrinks it and
    /// still fits one frame (spec §4.1: `flags.compressed`).
    pub fn seal_auto(&mut self, msg_type: MsgType, plaintext: &[u8]) -> Result<RawFrame, ChannelError> {
        let (bytes, compressed) = maybe_compress(plaintext);
        let flags = FrameFlags { compressed, last_in_series: true };
        self.seal(msg_type, flags, &bytes)
    }

    /// Verify and open a received frame. On success, advances the replay
    /// window; on tag failure, does not. Transparently decompresses the
    /// payload if `flags.compressed` is set.
    pub fn open(&mut self, frame: &RawFrame) -> Result<(FrameHeader, Vec<u8>), ChannelError> {
        let header = frame.header()?;

        if header.epoch != self.epoch {
            return Err(ChannelError::EpochMismatch);
        }
        if !self.replay.would_accept(header.seq) {
            self.replay_drops += 1;
            return Err(ChannelError::Replay);
        }

        let mut in_out = Vec::with_capacity(header.payload_len as usize + TAG_LEN);
        in_out.extend_from_slice(frame.payload_region(header.payload_len));
        in_out.extend_from_slice(frame.tag());

        let nonce = Nonce::assume_unique_for_key(header.nonce);
        let aad = Aad::from(*frame.header_bytes());
        let sealed_plaintext = match self.key.open_in_place(nonce, aad, &mut in_out) {
            Ok(p) => p.to_vec(),
            Err(_) => {
                self.mac_failures += 1;
                return Err(ChannelError::TagInvalid);
            }
        };

        self.replay.accept(header.seq);
        let plaintext = decompress_if_needed(&sealed_plaintext, header.flags.compressed)?;
        Ok((header, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> (NodeId, NodeId) {
        (NodeId::from_bytes([1; 32]), NodeId::from_bytes([2; 32]))
    }

    #[test]
    fn seal_then_open_round_trips() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"cluster-psk", 1).unwrap();

        let frame = sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap();
        let (header, plaintext) = receiver.open(&frame).unwrap();
        assert_eq!(plaintext, b"ping");
        assert_eq!(header.sender_id, a);
    }

    #[test]
    fn wrong_key_fails_tag_and_counts_mac_failure() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"different-psk", 1).unwrap();

        let frame = sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap();
        let err = receiver.open(&frame).unwrap_err();
        assert_eq!(err, ChannelError::TagInvalid);
        assert_eq!(receiver.mac_failures(), 1);
    }

    #[test]
    fn replayed_frame_is_dropped_and_window_not_advanced_on_tag_failure() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"cluster-psk", 1).unwrap();

        let frame = sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap();
        receiver.open(&frame).unwrap();
        let err = receiver.open(&frame).unwrap_err();
        assert_eq!(err, ChannelError::Replay);
        assert_eq!(receiver.replay_drops(), 1);
    }

    #[test]
    fn epoch_mismatch_is_rejected() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 2).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"cluster-psk", 1).unwrap();

        let frame = sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap();
        let err = receiver.open(&frame).unwrap_err();
        assert_eq!(err, ChannelError::EpochMismatch);
    }

    #[test]
    fn out_of_order_within_window_is_accepted_once() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"cluster-psk", 1).unwrap();

        let frames: Vec<_> = (0..5)
            .map(|_| sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap())
            .collect();

        for idx in [4, 2, 0, 3, 1] {
            receiver.open(&frames[idx]).unwrap();
        }
        for frame in &frames {
            assert_eq!(receiver.open(frame).unwrap_err(), ChannelError::Replay);
        }
    }

    #[test]
    fn seq_far_below_window_floor_is_rejected() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"cluster-psk", 1).unwrap();

        let stale = sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap();
        for _ in 0..REPLAY_WINDOW_BITS + 10 {
            let f = sender.seal(MsgType::Heartbeat, FrameFlags::default(), b"ping").unwrap();
            receiver.open(&f).unwrap();
        }
        let err = receiver.open(&stale).unwrap_err();
        assert_eq!(err, ChannelError::Replay);
    }

    #[test]
    fn seal_auto_compresses_and_open_transparently_restores() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let mut receiver = SecureChannel::new(b, a, b"cluster-psk", 1).unwrap();

        let payload = vec![b'x'; 500];
        let frame = sender.seal_auto(MsgType::PullResponse, &payload).unwrap();
        assert!(frame.header().unwrap().flags.compressed);

        let (_, plaintext) = receiver.open(&frame).unwrap();
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn payload_over_capacity_is_rejected_before_sealing() {
        let (a, b) = nodes();
        let mut sender = SecureChannel::new(a, b, b"cluster-psk", 1).unwrap();
        let big = vec![0u8; PAYLOAD_CAPACITY + 1];
        let err = sender.seal(MsgType::Heartbeat, FrameFlags::default(), &big).unwrap_err();
        assert_eq!(err, ChannelError::PayloadTooLarge);
    }
}
