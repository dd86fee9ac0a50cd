//! DCS wire protocol (also used on the radio side by XLX reflectors).
//!
//! Bit layout (`spec.md` §4.3): 17-byte connect, 22-byte poll carrying
//! a rotating 21-frame counter, 100-byte voice datagrams, and a
//! connect ACK whose second byte is `'A'` (accept) or `'N'` (reject).

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use super::{ConnectAck, Direction, Kind, ReflectorHandler};
use crate::callsign::{Callsign, CALLSIGN_LEN};
use crate::error::GatewayError;
use crate::frame::ambe::{SLOW_DATA_LEN, SYNC_PERIOD, VOICE_LEN};
use crate::frame::AmbeFrame;
use crate::frame::Header;
use crate::frame::header::HEADER_LEN;

const CONNECT_LEN: usize = 17;
const POLL_LEN: usize = 22;
const ACK_LEN: usize = 9;
const VOICE_DATAGRAM_LEN: usize = 100;
const HEADER_DATAGRAM_LEN: usize = 100;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

struct PendingHeader {
    stream_id: u16,
    header: Header,
}

struct PendingAmbe {
    stream_id: u16,
    frame: AmbeFrame,
}

pub struct DcsHandler {
    socket: UdpSocket,
    local_port: u16,
    peer: Option<SocketAddr>,
    pending_header: Option<PendingHeader>,
    pending_ambe: Option<PendingAmbe>,
    pending_poll: Option<Callsign>,
    pending_connect: Option<(Callsign, Direction)>,
    pending_ack: Option<ConnectAck>,
    awaiting_ack: bool,
    poll_counter: u8,
}

impl DcsHandler {
    pub fn open(bind_addr: &str, port: u16) -> Result<DcsHandler, GatewayError> {
        let socket = UdpSocket::bind((bind_addr, port))
            .map_err(|e| GatewayError::Fatal(format!("DCS bind :{port}: {e}")))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_port = socket.local_addr()?.port();
        Ok(DcsHandler {
            socket,
            local_port,
            peer: None,
            pending_header: None,
            pending_ambe: None,
            pending_poll: None,
            pending_connect: None,
            pending_ack: None,
            awaiting_ack: false,
            poll_counter: 0,
        })
    }

    fn classify(&mut self, buf: &[u8], from: SocketAddr) -> Kind {
        self.peer = Some(from);
        match buf.len() {
            ACK_LEN if self.awaiting_ack => {
                self.awaiting_ack = false;
                self.pending_ack = Some(if buf[8] == b'A' {
                    ConnectAck::Accepted
                } else {
                    ConnectAck::Rejected
                });
                Kind::ConnectAck
            }
            CONNECT_LEN => {
                let mut from_call = [0u8; CALLSIGN_LEN];
                from_call.copy_from_slice(&buf[0..8]);
                let dir = Direction::from_byte(buf[16]).unwrap_or(Direction::Bi);
                self.pending_connect = Some((Callsign::from_bytes(from_call), dir));
                Kind::Connect
            }
            POLL_LEN => {
                let mut from_call = [0u8; CALLSIGN_LEN];
                from_call.copy_from_slice(&buf[0..8]);
                self.pending_poll = Some(Callsign::from_bytes(from_call));
                Kind::Poll
            }
            VOICE_DATAGRAM_LEN => {
                let stream_id = BigEndian::read_u16(&buf[0..2]);
                let seq_raw = buf[2];
                let kind_byte = buf[3];
                if kind_byte == 0 {
                    return match Header::parse(&buf[4..4 + HEADER_LEN]) {
                        Ok(header) => {
                            self.pending_header = Some(PendingHeader { stream_id, header });
                            Kind::Header
                        }
                        Err(_) => Kind::CrcError,
                    };
                } else {
                    let mut voice = [0u8; VOICE_LEN];
                    voice.copy_from_slice(&buf[4..4 + VOICE_LEN]);
                    let mut slow = [0u8; SLOW_DATA_LEN];
                    slow.copy_from_slice(&buf[4 + VOICE_LEN..4 + VOICE_LEN + SLOW_DATA_LEN]);
                    let frame = AmbeFrame::new(stream_id, seq_raw & 0x7F, seq_raw & 0x80 != 0, voice, slow);
                    self.pending_ambe = Some(PendingAmbe { stream_id, frame });
                    Kind::Ambe
                }
            }
            _ => Kind::None,
        }
    }
}

impl ReflectorHandler for DcsHandler {
    fn read(&mut self) -> Result<Kind, GatewayError> {
        let mut buf = [0u8; HEADER_DATAGRAM_LEN];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => Ok(self.classify(&buf[..n], from)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Ok(Kind::None)
            }
            Err(e) => Err(GatewayError::from(e)),
        }
    }

    fn read_header(&mut self) -> Option<(u16, Header)> {
        self.pending_header.take().map(|p| (p.stream_id, p.header))
    }

    fn read_data(&mut self) -> Option<(u16, AmbeFrame)> {
        self.pending_ambe.take().map(|p| (p.stream_id, p.frame))
    }

    fn read_poll(&mut self) -> Option<Callsign> {
        self.pending_poll.take()
    }

    fn read_connect(&mut self) -> Option<(Callsign, Direction)> {
        self.pending_connect.take()
    }

    fn read_ack(&mut self) -> Option<ConnectAck> {
        self.pending_ack.take()
    }

    fn write_header(&mut self, stream_id: u16, header: &Header) -> Result<(), GatewayError> {
        let peer = self.peer.ok_or_else(|| GatewayError::Fatal("no peer".into()))?;
        let mut buf = [0u8; HEADER_DATAGRAM_LEN];
        BigEndian::write_u16(&mut buf[0..2], stream_id);
        buf[3] = 0;
        buf[4..4 + HEADER_LEN].copy_from_slice(&header.emit());
        self.socket.send_to(&buf, peer)?;
        Ok(())
    }

    fn write_data(&mut self, stream_id: u16, frame: &AmbeFrame) -> Result<(), GatewayError> {
        let peer = self.peer.ok_or_else(|| GatewayError::Fatal("no peer".into()))?;
        let mut buf = [0u8; VOICE_DATAGRAM_LEN];
        BigEndian::write_u16(&mut buf[0..2], stream_id);
        buf[2] = frame.seq() | if frame.is_end() { 0x80 } else { 0 };
        buf[3] = 1;
        buf[4..4 + VOICE_LEN].copy_from_slice(&frame.data);
        buf[4 + VOICE_LEN..4 + VOICE_LEN + SLOW_DATA_LEN].copy_from_slice(&frame.slow_data);
        self.socket.send_to(&buf, peer)?;
        Ok(())
    }

    fn write_poll(&mut self, callsign: Callsign) -> Result<(), GatewayError> {
        let peer = self.peer.ok_or_else(|| GatewayError::Fatal("no peer".into()))?;
        let mut buf = [0u8; POLL_LEN];
        buf[0..8].copy_from_slice(callsign.as_bytes());
        buf[8..16].copy_from_slice(callsign.as_bytes());
        self.poll_counter = (self.poll_counter + 1) % SYNC_PERIOD;
        BigEndian::write_u32(&mut buf[16..20], self.poll_counter as u32);
        self.socket.send_to(&buf, peer)?;
        Ok(())
    }

    fn write_connect(
        &mut self,
        from: Callsign,
        to: Callsign,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<(), GatewayError> {
        self.peer = Some(addr);
        self.awaiting_ack = true;
        let mut buf = [0u8; CONNECT_LEN];
        buf[0..8].copy_from_slice(from.as_bytes());
        buf[8..16].copy_from_slice(to.as_bytes());
        buf[16] = direction.to_byte();
        self.socket.send_to(&buf, addr)?;
        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn close(self: Box<Self>) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DcsHandler, DcsHandler) {
        (
            DcsHandler::open("127.0.0.1", 0).unwrap(),
            DcsHandler::open("127.0.0.1", 0).unwrap(),
        )
    }

    #[test]
    fn connect_ack_reject_round_trip() {
        let (mut a, mut b) = pair();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();
        a.write_connect(Callsign::new("G4KLX"), Callsign::new("DCS001"), b_addr, Direction::Bi)
            .unwrap();
        assert_eq!(b.read().unwrap(), Kind::Connect);

        let a_addr: SocketAddr = ([127, 0, 0, 1], a.local_port()).into();
        let mut nak = [0u8; ACK_LEN];
        nak[..8].copy_from_slice(Callsign::new("DCS001").as_bytes());
        nak[8] = b'N';
        b.socket.send_to(&nak, a_addr).unwrap();

        assert_eq!(a.read().unwrap(), Kind::ConnectAck);
        assert_eq!(a.pending_ack, Some(ConnectAck::Rejected));
    }

    #[test]
    fn poll_counter_rotates_modulo_21() {
        let mut h = DcsHandler::open("127.0.0.1", 0).unwrap();
        h.peer = Some(([127, 0, 0, 1], h.local_port()).into());
        for _ in 0..25 {
            h.write_poll(Callsign::new("DCS001")).unwrap();
        }
        assert_eq!(h.poll_counter, 25 % SYNC_PERIOD);
    }

    #[test]
    fn header_with_bad_crc_is_classified_as_crc_error() {
        let (mut a, mut b) = pair();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();
        a.peer = Some(b_addr);

        let header = Header {
            flags: [0x00, 0x00, 0x00],
            rpt2: Callsign::with_module("G4KLX", b'G'),
            rpt1: Callsign::with_module("G4KLX", b'B'),
            your_call: Callsign::new("CQCQCQ"),
            my_call1: Callsign::with_module("G4KLX", b'B'),
            my_call2: *b"RPTR",
        };
        a.write_header(42, &header).unwrap();

        let mut buf = [0u8; VOICE_DATAGRAM_LEN];
        let (n, _) = b.socket.recv_from(&mut buf).unwrap();
        buf[4 + HEADER_LEN - 1] ^= 0xFF;
        a.socket.send_to(&buf[..n], b_addr).unwrap();

        assert_eq!(b.read().unwrap(), Kind::CrcError);
    }
}
