//! Reflector protocol handlers (`spec.md` §4.3) and the link state
//! machine shared by all three protocols.

pub mod dcs;
pub mod dextra;
pub mod dplus;
pub mod pool;

pub use dcs::DcsHandler;
pub use dextra::DExtraHandler;
pub use dplus::DPlusHandler;
pub use pool::HandlerPool;

use std::net::SocketAddr;

use crate::callsign::Callsign;
use crate::clock::Timer;
use crate::config::ReflectorProtocol;
use crate::error::GatewayError;
use crate::frame::{AmbeFrame, Header};

/// What the last `read()` call classified the pending datagram as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    None,
    Header,
    Ambe,
    Poll,
    Connect,
    ConnectAck,
    Disconnect,
    /// A header datagram's CCITT-16 CRC did not match (`spec.md` §7's
    /// `CrcError` policy: drop the datagram, keep the link alive).
    CrcError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    Bi,
}

impl Direction {
    pub fn to_byte(self) -> u8 {
        match self {
            Direction::Out => b'U',
            Direction::In => b'L',
            Direction::Bi => b'A',
        }
    }

    pub fn from_byte(b: u8) -> Option<Direction> {
        match b {
            b'U' => Some(Direction::Out),
            b'L' => Some(Direction::In),
            b'A' => Some(Direction::Bi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAck {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Linking,
    WaitAck,
    Linked,
    Unlinking,
    Failed,
}

/// Connect-attempt back-off schedule: 1/2/4s, up to 3 retries.
const LINK_ATTEMPT_TIMEOUT_MS: u64 = 5_000;
const LINK_RETRY_BACKOFF_MS: [u64; 3] = [1_000, 2_000, 4_000];
const INACTIVITY_TIMEOUT_MS: u64 = 30_000;

/// Per-link state, shared by all three protocol handlers. Each
/// handler owns exactly one active link at a time (`spec.md` §4.3's
/// state diagram); the handler pool is what lets several modules be
/// linked concurrently via several handler instances.
#[derive(Debug, Clone, Copy)]
pub struct ReflectorLink {
    pub local_module: u8,
    pub remote_call: Callsign,
    pub remote_addr: SocketAddr,
    pub protocol: ReflectorProtocol,
    pub direction: Direction,
    pub state: LinkState,
    retries: u8,
    link_timer: Timer,
    inactivity_timer: Timer,
    keepalive_timer: Timer,
}

impl ReflectorLink {
    pub fn new(
        local_module: u8,
        remote_call: Callsign,
        remote_addr: SocketAddr,
        protocol: ReflectorProtocol,
        direction: Direction,
        keepalive_ms: u64,
    ) -> ReflectorLink {
        let mut link_timer = Timer::with_timeout_ms(LINK_ATTEMPT_TIMEOUT_MS);
        link_timer.start();
        let mut keepalive_timer = Timer::with_timeout_ms(keepalive_ms);
        keepalive_timer.start();
        ReflectorLink {
            local_module,
            remote_call,
            remote_addr,
            protocol,
            direction,
            state: LinkState::Linking,
            retries: 0,
            link_timer,
            inactivity_timer: Timer::with_timeout_ms(INACTIVITY_TIMEOUT_MS),
            keepalive_timer,
        }
    }

    /// Advances all timers. Returns `Some(())` via the boolean getters
    /// below for the caller to react to on each tick.
    pub fn clock(&mut self, ms: u64) {
        self.link_timer.clock(ms);
        self.inactivity_timer.clock(ms);
        self.keepalive_timer.clock(ms);

        if matches!(self.state, LinkState::Linking | LinkState::WaitAck) && self.link_timer.has_expired() {
            if (self.retries as usize) < LINK_RETRY_BACKOFF_MS.len() {
                self.link_timer
                    .set_timeout_ms(LINK_RETRY_BACKOFF_MS[self.retries as usize]);
                self.link_timer.start();
                self.retries += 1;
            } else {
                self.state = LinkState::Failed;
            }
        }

        if self.state == LinkState::Linked && self.inactivity_timer.has_expired() {
            self.state = LinkState::Unlinking;
        }
    }

    /// True when a keep-alive poll should be emitted; resets the timer.
    pub fn should_poll(&mut self) -> bool {
        if self.state == LinkState::Linked && self.keepalive_timer.has_expired() {
            self.keepalive_timer.start();
            return true;
        }
        false
    }

    /// Call on receipt of a CONNECT_ACK.
    pub fn on_ack(&mut self, ack: ConnectAck) {
        match ack {
            ConnectAck::Accepted => {
                self.state = LinkState::Linked;
                self.inactivity_timer.start();
            }
            ConnectAck::Rejected => self.state = LinkState::Failed,
        }
    }

    /// Call whenever a poll or data frame arrives from the peer.
    pub fn on_activity(&mut self) {
        if self.state == LinkState::Linked {
            self.inactivity_timer.start();
        }
    }

    pub fn begin_unlink(&mut self) {
        self.state = LinkState::Unlinking;
    }

    pub fn on_unlink_ack(&mut self) {
        self.state = LinkState::Failed; // closed; pool releases the handler
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Failed
    }
}

/// Shared contract for the three reflector wire protocols
/// (`spec.md` §4.3).
pub trait ReflectorHandler {
    /// Non-blocking receive; classifies the next pending datagram.
    fn read(&mut self) -> Result<Kind, GatewayError>;

    fn read_header(&mut self) -> Option<(u16, Header)>;
    fn read_data(&mut self) -> Option<(u16, AmbeFrame)>;
    fn read_poll(&mut self) -> Option<Callsign>;
    fn read_connect(&mut self) -> Option<(Callsign, Direction)>;
    fn read_ack(&mut self) -> Option<ConnectAck>;

    fn write_header(&mut self, stream_id: u16, header: &Header) -> Result<(), GatewayError>;
    fn write_data(&mut self, stream_id: u16, frame: &AmbeFrame) -> Result<(), GatewayError>;
    fn write_poll(&mut self, callsign: Callsign) -> Result<(), GatewayError>;
    fn write_connect(
        &mut self,
        from: Callsign,
        to: Callsign,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<(), GatewayError>;

    fn local_port(&self) -> u16;
    fn close(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 30001)
    }

    #[test]
    fn link_times_out_after_three_retries() {
        let mut link = ReflectorLink::new(
            b'B',
            Callsign::new("XRF001"),
            addr(),
            ReflectorProtocol::DExtra,
            Direction::Bi,
            1_000,
        );
        link.clock(5_000); // retry 1 at 1s backoff
        link.clock(1_000);
        link.clock(2_000); // retry 2
        link.clock(4_000); // retry 3
        assert_eq!(link.state, LinkState::Failed);
    }

    #[test]
    fn ack_accepted_moves_to_linked() {
        let mut link = ReflectorLink::new(
            b'B',
            Callsign::new("XRF001"),
            addr(),
            ReflectorProtocol::DExtra,
            Direction::Bi,
            1_000,
        );
        link.on_ack(ConnectAck::Accepted);
        assert_eq!(link.state, LinkState::Linked);
    }

    #[test]
    fn inactivity_triggers_unlink() {
        let mut link = ReflectorLink::new(
            b'B',
            Callsign::new("XRF001"),
            addr(),
            ReflectorProtocol::DExtra,
            Direction::Bi,
            1_000,
        );
        link.on_ack(ConnectAck::Accepted);
        link.clock(30_000);
        assert_eq!(link.state, LinkState::Unlinking);
    }

    #[test]
    fn activity_resets_inactivity_timer() {
        let mut link = ReflectorLink::new(
            b'B',
            Callsign::new("XRF001"),
            addr(),
            ReflectorProtocol::DExtra,
            Direction::Bi,
            1_000,
        );
        link.on_ack(ConnectAck::Accepted);
        link.clock(20_000);
        link.on_activity();
        link.clock(20_000);
        assert_eq!(link.state, LinkState::Linked);
    }

    #[test]
    fn keepalive_poll_fires_on_schedule() {
        let mut link = ReflectorLink::new(
            b'B',
            Callsign::new("XRF001"),
            addr(),
            ReflectorProtocol::DExtra,
            Direction::Bi,
            1_000,
        );
        link.on_ack(ConnectAck::Accepted);
        link.clock(1_000);
        assert!(link.should_poll());
        assert!(!link.should_poll());
    }
}
