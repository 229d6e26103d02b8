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

//! Datagram transport abstraction. Production uses a real, non-blocking
//! `UdpSocket`; the simulation harness substitutes an in-process transport
//! (direct frame delivery through channels) so multi-node tests run fast
//! and deterministically without touching the network (spec.md §0 ambient
//! test tooling / §4.9 "identical except for ... network transport"). The
//! simulation harness also supports partitions and a seeded uniform-random
//! packet-loss rate, for spec.md §8's loss-tolerance convergence scenario.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::core::wire::frame::{FrameError, RawFrame, FRAME_LEN};

/// One drain result from [`Transport::recv`].
pub enum RecvOutcome {
    /// A well-formed 1024-byte datagram, not yet validated beyond size.
    Frame(RawFrame, SocketAddr),
    /// A datagram arrived but was not exactly [`FRAME_LEN`] bytes; dropped
    /// and counted at the protocol layer (spec.md §6).
    WrongSize,
    /// No datagram was available before the timeout elapsed.
    Idle,
}

/// Minimal send/receive surface the tick loop needs. Implemented for a real
/// UDP socket in production and for an in-memory queue in tests.
pub trait Transport {
    /// Block for at most `timeout` waiting for one datagram.
    fn recv(&mut self, timeout: Duration) -> io::Result<RecvOutcome>;
    /// Send `frame` to `addr`.
    fn send(&mut self, frame: &RawFrame, addr: SocketAddr) -> io::Result<()>;
    /// The address this transport is bound to, for logging.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Real UDP transport: one non-blocking socket, fixed-size 1024-byte
/// datagrams per spec.md §6.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a UDP socket on `0.0.0.0:port`.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(false)?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn recv(&mut self, timeout: Duration) -> io::Result<RecvOutcome> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; FRAME_LEN];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n != FRAME_LEN {
                    return Ok(RecvOutcome::WrongSize);
                }
                match RawFrame::from_datagram(&buf) {
                    Ok(frame) => Ok(RecvOutcome::Frame(frame, from)),
                    Err(FrameError::WrongSize) => Ok(RecvOutcome::WrongSize),
                    // Header-level rejects (bad magic/version/len) still
                    // count as a protocol drop, not a transport error.
                    Err(_) => Ok(RecvOutcome::WrongSize),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(RecvOutcome::Idle)
            }
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, frame: &RawFrame, addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(frame.as_datagram(), addr)?;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// In-memory transport for the deterministic multi-node simulation harness:
/// frames are handed directly between nodes' mailboxes (keyed by
/// [`SocketAddr`]) with no real socket or scheduler involved, and an
/// optional partition set lets a test drop traffic between two addresses in
/// both directions until healed.
pub mod sim {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};
    use std::rc::Rc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    struct Mailbox {
        queues: BTreeMap<SocketAddr, VecDeque<(RawFrame, SocketAddr)>>,
        partitioned: BTreeSet<(SocketAddr, SocketAddr)>,
        drop_rate: f64,
        rng: StdRng,
    }

    impl Default for Mailbox {
        fn default() -> Self {
            Self {
                queues: BTreeMap::new(),
                partitioned: BTreeSet::new(),
                drop_rate: 0.0,
                rng: StdRng::seed_from_u64(0),
            }
        }
    }

    /// Shared network state for one simulation run. Cloning shares the
    /// underlying mailboxes (`Rc`, not `Arc`) — simulations are
    /// single-threaded by construction.
    #[derive(Clone, Default)]
    pub struct SimNetwork(Rc<RefCell<Mailbox>>);

    impl SimNetwork {
        /// A fresh network with no traffic, no partitions, and no loss.
        pub fn new() -> Self {
            Self::default()
        }

        /// Drop traffic between `a` and `b` in both directions until
        /// [`SimNetwork::heal`] is called for the same pair.
        pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
            let mut m = self.0.borrow_mut();
            m.partitioned.insert((a, b));
            m.partitioned.insert((b, a));
        }

        /// Reverse a prior [`SimNetwork::partition`] between `a` and `b`.
        pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
            let mut m = self.0.borrow_mut();
            m.partitioned.remove(&(a, b));
            m.partitioned.remove(&(b, a));
        }

        /// Independently drop a uniformly random `rate` (clamped to
        /// `0.0..=1.0`) fraction of every subsequently sent frame, on top of
        /// any partitioning — spec.md §8's packet-loss convergence scenario.
        /// `seed` makes the loss pattern reproducible across test runs.
        pub fn set_loss(&self, rate: f64, seed: u64) {
            let mut m = self.0.borrow_mut();
            m.drop_rate = rate.clamp(0.0, 1.0);
            m.rng = StdRng::seed_from_u64(seed);
        }
    }

    /// One node's endpoint into a [`SimNetwork`].
    pub struct SimTransport {
        addr: SocketAddr,
        net: SimNetwork,
    }

    impl SimTransport {
        /// Register `addr` on `net` and return a transport bound to it.
        pub fn new(addr: SocketAddr, net: SimNetwork) -> Self {
            net.0.borrow_mut().queues.entry(addr).or_default();
            Self { addr, net }
        }
    }

    impl Transport for SimTransport {
        fn recv(&mut self, _timeout: Duration) -> io::Result<RecvOutcome> {
            let mut m = self.net.0.borrow_mut();
            match m.queues.entry(self.addr).or_default().pop_front() {
                Some((frame, from)) => Ok(RecvOutcome::Frame(frame, from)),
                None => Ok(RecvOutcome::Idle),
            }
        }

        fn send(&mut self, frame: &RawFrame, addr: SocketAddr) -> io::Result<()> {
            let mut m = self.net.0.borrow_mut();
            if m.partitioned.contains(&(self.addr, addr)) {
                return Ok(());
            }
            if m.drop_rate > 0.0 && m.rng.gen::<f64>() < m.drop_rate {
                return Ok(());
            }
            let from = self.addr;
            m.queues.entry(addr).or_default().push_back((frame.clone(), from));
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NodeId;
    use crate::core::wire::frame::{derive_nonce, FrameFlags, FrameHeader, MsgType};

    fn sample_frame() -> RawFrame {
        let sender_id = NodeId::from_bytes([9; 32]);
        let header = FrameHeader {
            msg_type: MsgType::Heartbeat,
            flags: FrameFlags::default(),
            sender_id,
            epoch: 1,
            nonce: derive_nonce(&sender_id, 0),
            seq: 0,
            payload_len: 0,
        };
        let mut frame = RawFrame::zeroed();
        frame.set_header(&header);
        frame
    }

    #[test]
    fn two_sockets_exchange_a_frame() {
        let mut a = UdpTransport::bind(0).unwrap();
        let mut b = UdpTransport::bind(0).unwrap();
        let b_addr = b.local_addr().unwrap();

        let frame = sample_frame();
        a.send(&frame, b_addr).unwrap();

        match b.recv(Duration::from_secs(1)).unwrap() {
            RecvOutcome::Frame(_, _) => {}
            RecvOutcome::WrongSize => panic!("expected a well-formed frame, got a protocol-level drop"),
            RecvOutcome::Idle => panic!("expected a frame"),
        }
    }

    #[test]
    fn idle_timeout_returns_idle() {
        let mut a = UdpTransport::bind(0).unwrap();
        let outcome = a.recv(Duration::from_millis(20)).unwrap();
        assert!(matches!(outcome, RecvOutcome::Idle));
    }

    #[test]
    fn sim_transport_delivers_and_honors_partition() {
        use super::sim::{SimNetwork, SimTransport};

        let net = SimNetwork::new();
        let a_addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let mut a = SimTransport::new(a_addr, net.clone());
        let mut b = SimTransport::new(b_addr, net.clone());

        a.send(&sample_frame(), b_addr).unwrap();
        assert!(matches!(b.recv(Duration::ZERO).unwrap(), RecvOutcome::Frame(_, _)));

        net.partition(a_addr, b_addr);
        a.send(&sample_frame(), b_addr).unwrap();
        assert!(matches!(b.recv(Duration::ZERO).unwrap(), RecvOutcome::Idle));

        net.heal(a_addr, b_addr);
        a.send(&sample_frame(), b_addr).unwrap();
        assert!(matches!(b.recv(Duration::ZERO).unwrap(), RecvOutcome::Frame(_, _)));
    }

    #[test]
    fn sim_transport_with_full_loss_drops_everything() {
        use super::sim::{SimNetwork, SimTransport};

        let net = SimNetwork::new();
        net.set_loss(1.0, 7);
        let a_addr: SocketAddr = "10.0.2.1:1".parse().unwrap();
        let b_addr: SocketAddr = "10.0.2.2:1".parse().unwrap();
        let mut a = SimTransport::new(a_addr, net.clone());
        let mut b = SimTransport::new(b_addr, net);

        for _ in 0..20 {
            a.send(&sample_frame(), b_addr).unwrap();
        }
        assert!(matches!(b.recv(Duration::ZERO).unwrap(), RecvOutcome::Idle));
    }

    #[test]
    fn sim_transport_with_zero_loss_delivers_everything() {
        use super::sim::{SimNetwork, SimTransport};

        let net = SimNetwork::new();
        net.set_loss(0.0, 7);
        let a_addr: SocketAddr = "10.0.3.1:1".parse().unwrap();
        let b_addr: SocketAddr = "10.0.3.2:1".parse().unwrap();
        let mut a = SimTransport::new(a_addr, net.clone());
        let mut b = SimTransport::new(b_addr, net);

        for _ in 0..20 {
            a.send(&sample_frame(), b_addr).unwrap();
        }
        for _ in 0..20 {
            assert!(matches!(b.recv(Duration::ZERO).unwrap(), RecvOutcome::Frame(_, _)));
        }
    }
}
