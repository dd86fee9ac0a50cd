//! DExtra wire protocol.
//!
//! Bit layout (`spec.md` §4.3): 9-byte connect `<fromCall:8><dir:1>`;
//! 9-byte poll `<callsign:8>\0`; 56-byte voice datagram carrying a
//! 2-byte stream id, a 1-byte seq (MSB = end flag), a header-or-AMBE
//! block, and an 8-byte trailing `fromCall` reflectors use for slot
//! accounting.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use super::{ConnectAck, Direction, Kind, ReflectorHandler};
use crate::callsign::{Callsign, CALLSIGN_LEN};
use crate::error::GatewayError;
use crate::frame::ambe::{SLOW_DATA_LEN, VOICE_LEN};
use crate::frame::header::HEADER_LEN;
use crate::frame::{AmbeFrame, Header};

const CONNECT_LEN: usize = 9;
const POLL_LEN: usize = 9;
const VOICE_DATAGRAM_LEN: usize = 56;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

struct PendingHeader {
    stream_id: u16,
    header: Header,
}

struct PendingAmbe {
    stream_id: u16,
    frame: AmbeFrame,
}

pub struct DExtraHandler {
    socket: UdpSocket,
    local_port: u16,
    peer: Option<SocketAddr>,
    pending_header: Option<PendingHeader>,
    pending_ambe: Option<PendingAmbe>,
    pending_poll: Option<Callsign>,
    pending_connect: Option<(Callsign, Direction)>,
    pending_ack: Option<ConnectAck>,
    awaiting_ack: bool,
}

impl DExtraHandler {
    pub fn open(bind_addr: &str, port: u16) -> Result<DExtraHandler, GatewayError> {
        let socket = UdpSocket::bind((bind_addr, port))
            .map_err(|e| GatewayError::Fatal(format!("DExtra bind :{port}: {e}")))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_port = socket.local_addr()?.port();
        Ok(DExtraHandler {
            socket,
            local_port,
            peer: None,
            pending_header: None,
            pending_ambe: None,
            pending_poll: None,
            pending_connect: None,
            pending_ack: None,
            awaiting_ack: false,
        })
    }

    fn classify(&mut self, buf: &[u8], from: SocketAddr) -> Kind {
        self.peer = Some(from);
        match buf.len() {
            CONNECT_LEN => {
                let dir_byte = buf[8];
                if self.awaiting_ack && (dir_byte == b'A' || dir_byte == b'N') {
                    self.awaiting_ack = false;
                    self.pending_ack = Some(if dir_byte == b'A' {
                        ConnectAck::Accepted
                    } else {
                        ConnectAck::Rejected
                    });
                    return Kind::ConnectAck;
                }
                if dir_byte == 0 {
                    let mut call = [0u8; CALLSIGN_LEN];
                    call.copy_from_slice(&buf[0..8]);
                    self.pending_poll = Some(Callsign::from_bytes(call));
                    return Kind::Poll;
                }
                if let Some(dir) = Direction::from_byte(dir_byte) {
                    let mut call = [0u8; CALLSIGN_LEN];
                    call.copy_from_slice(&buf[0..8]);
                    self.pending_connect = Some((Callsign::from_bytes(call), dir));
                    return Kind::Connect;
                }
                Kind::None
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

impl ReflectorHandler for DExtraHandler {
    fn read(&mut self) -> Result<Kind, GatewayError> {
        let mut buf = [0u8; VOICE_DATAGRAM_LEN];
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
        let mut buf = [0u8; VOICE_DATAGRAM_LEN];
        BigEndian::write_u16(&mut buf[0..2], stream_id);
        buf[3] = 0;
        buf[4..4 + HEADER_LEN].copy_from_slice(&header.emit());
        buf[48..56].copy_from_slice(header.my_call1.as_bytes());
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
        buf[..8].copy_from_slice(callsign.as_bytes());
        self.socket.send_to(&buf, peer)?;
        Ok(())
    }

    fn write_connect(
        &mut self,
        from: Callsign,
        _to: Callsign,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<(), GatewayError> {
        self.peer = Some(addr);
        self.awaiting_ack = true;
        let mut buf = [0u8; CONNECT_LEN];
        buf[..8].copy_from_slice(from.as_bytes());
        buf[8] = direction.to_byte();
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
    use crate::frame::ambe::{SLOW_DATA_LEN, VOICE_LEN};

    fn pair() -> (DExtraHandler, DExtraHandler) {
        let a = DExtraHandler::open("127.0.0.1", 0).unwrap();
        let b = DExtraHandler::open("127.0.0.1", 0).unwrap();
        (a, b)
    }

    #[test]
    fn connect_then_ack_round_trip() {
        let (mut a, mut b) = pair();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();

        a.write_connect(Callsign::new("G4KLX"), Callsign::new("XRF001"), b_addr, Direction::Bi)
            .unwrap();
        assert_eq!(b.read().unwrap(), Kind::Connect);
        let (from, dir) = b.read_connect().unwrap();
        assert_eq!(from.trimmed(), "G4KLX");
        assert_eq!(dir, Direction::Bi);

        let a_addr: SocketAddr = ([127, 0, 0, 1], a.local_port()).into();
        b.peer = Some(a_addr);
        let mut ack = [0u8; CONNECT_LEN];
        ack[..8].copy_from_slice(Callsign::new("XRF001").as_bytes());
        ack[8] = b'A';
        b.socket.send_to(&ack, a_addr).unwrap();

        assert_eq!(a.read().unwrap(), Kind::ConnectAck);
    }

    #[test]
    fn voice_frame_round_trips() {
        let (mut a, mut b) = pair();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();
        a.peer = Some(b_addr);

        let frame = AmbeFrame::new(42, 5, false, [7u8; VOICE_LEN], [1, 2, 3]);
        a.write_data(42, &frame).unwrap();

        assert_eq!(b.read().unwrap(), Kind::Ambe);
        let (stream_id, recv_frame) = b.read_data().unwrap();
        assert_eq!(stream_id, 42);
        assert_eq!(recv_frame.data, frame.data);
        assert_eq!(recv_frame.slow_data, frame.slow_data);
        assert_eq!(recv_frame.seq(), 5);
        let _ = SLOW_DATA_LEN;
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

        // Corrupt the CRC byte the sender just wrote by reading it back,
        // flipping a bit, and resending the mangled datagram to `b`.
        let mut buf = [0u8; VOICE_DATAGRAM_LEN];
        let (n, _) = b.socket.recv_from(&mut buf).unwrap();
        buf[4 + HEADER_LEN - 1] ^= 0xFF;
        a.socket.send_to(&buf[..n], b_addr).unwrap();

        assert_eq!(b.read().unwrap(), Kind::CrcError);
        assert!(b.read_header().is_none());
    }
}
