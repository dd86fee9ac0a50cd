//! D-Plus wire protocol: a TCP-style handshake simulated over UDP.
//!
//! 4-byte connect and 4-byte poll frames; voice is wrapped in
//! DV-dongle frames with a 16-byte header whose magic is `0x58 0x01`
//! (`spec.md` §4.3).

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use super::{ConnectAck, Direction, Kind, ReflectorHandler};
use crate::callsign::Callsign;
use crate::error::GatewayError;
use crate::frame::ambe::{SLOW_DATA_LEN, VOICE_LEN};
use crate::frame::header::HEADER_LEN;
use crate::frame::{AmbeFrame, Header};

const CONNECT_LEN: usize = 4;
const POLL_LEN: usize = 4;
const DONGLE_HEADER_LEN: usize = 16;
const MAGIC: [u8; 2] = [0x58, 0x01];
const CONNECT_MAGIC: [u8; 3] = [0x05, 0x00, 0x18];
const READ_TIMEOUT: Duration = Duration::from_millis(100);

struct PendingHeader {
    stream_id: u16,
    header: Header,
}

struct PendingAmbe {
    stream_id: u16,
    frame: AmbeFrame,
}

pub struct DPlusHandler {
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

impl DPlusHandler {
    pub fn open(bind_addr: &str, port: u16) -> Result<DPlusHandler, GatewayError> {
        let socket = UdpSocket::bind((bind_addr, port))
            .map_err(|e| GatewayError::Fatal(format!("D-Plus bind :{port}: {e}")))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local_port = socket.local_addr()?.port();
        Ok(DPlusHandler {
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
                if self.awaiting_ack && buf[0..2] == CONNECT_MAGIC[0..2] {
                    self.awaiting_ack = false;
                    self.pending_ack = Some(if buf[3] == b'A' {
                        ConnectAck::Accepted
                    } else {
                        ConnectAck::Rejected
                    });
                    return Kind::ConnectAck;
                }
                if buf[0..3] == CONNECT_MAGIC {
                    let dir = Direction::from_byte(buf[3]).unwrap_or(Direction::Bi);
                    self.pending_connect = Some((Callsign::new(""), dir));
                    return Kind::Connect;
                }
                if buf == [0u8; POLL_LEN] {
                    self.pending_poll = Some(Callsign::new(""));
                    return Kind::Poll;
                }
                Kind::None
            }
            n if n == DONGLE_HEADER_LEN + VOICE_LEN + SLOW_DATA_LEN => {
                if buf[0..2] != MAGIC {
                    return Kind::None;
                }
                let stream_id = BigEndian::read_u16(&buf[2..4]);
                let seq_raw = buf[4];
                let body = &buf[DONGLE_HEADER_LEN..];
                let mut voice = [0u8; VOICE_LEN];
                voice.copy_from_slice(&body[..VOICE_LEN]);
                let mut slow = [0u8; SLOW_DATA_LEN];
                slow.copy_from_slice(&body[VOICE_LEN..VOICE_LEN + SLOW_DATA_LEN]);
                let frame = AmbeFrame::new(stream_id, seq_raw & 0x7F, seq_raw & 0x80 != 0, voice, slow);
                self.pending_ambe = Some(PendingAmbe { stream_id, frame });
                Kind::Ambe
            }
            n if n == DONGLE_HEADER_LEN + HEADER_LEN => {
                if buf[0..2] != MAGIC {
                    return Kind::None;
                }
                let stream_id = BigEndian::read_u16(&buf[2..4]);
                match Header::parse(&buf[DONGLE_HEADER_LEN..]) {
                    Ok(header) => {
                        self.pending_header = Some(PendingHeader { stream_id, header });
                        Kind::Header
                    }
                    Err(_) => Kind::CrcError,
                }
            }
            _ => Kind::None,
        }
    }
}

impl ReflectorHandler for DPlusHandler {
    fn read(&mut self) -> Result<Kind, GatewayError> {
        let mut buf = [0u8; DONGLE_HEADER_LEN + HEADER_LEN];
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
        let mut buf = [0u8; DONGLE_HEADER_LEN + HEADER_LEN];
        buf[0..2].copy_from_slice(&MAGIC);
        BigEndian::write_u16(&mut buf[2..4], stream_id);
        buf[DONGLE_HEADER_LEN..].copy_from_slice(&header.emit());
        self.socket.send_to(&buf, peer)?;
        Ok(())
    }

    fn write_data(&mut self, stream_id: u16, frame: &AmbeFrame) -> Result<(), GatewayError> {
        let peer = self.peer.ok_or_else(|| GatewayError::Fatal("no peer".into()))?;
        let mut buf = [0u8; DONGLE_HEADER_LEN + VOICE_LEN + SLOW_DATA_LEN];
        buf[0..2].copy_from_slice(&MAGIC);
        BigEndian::write_u16(&mut buf[2..4], stream_id);
        buf[4] = frame.seq() | if frame.is_end() { 0x80 } else { 0 };
        buf[DONGLE_HEADER_LEN..DONGLE_HEADER_LEN + VOICE_LEN].copy_from_slice(&frame.data);
        buf[DONGLE_HEADER_LEN + VOICE_LEN..].copy_from_slice(&frame.slow_data);
        self.socket.send_to(&buf, peer)?;
        Ok(())
    }

    fn write_poll(&mut self, _callsign: Callsign) -> Result<(), GatewayError> {
        let peer = self.peer.ok_or_else(|| GatewayError::Fatal("no peer".into()))?;
        self.socket.send_to(&[0u8; POLL_LEN], peer)?;
        Ok(())
    }

    fn write_connect(
        &mut self,
        _from: Callsign,
        _to: Callsign,
        addr: SocketAddr,
        direction: Direction,
    ) -> Result<(), GatewayError> {
        self.peer = Some(addr);
        self.awaiting_ack = true;
        let mut buf = [0u8; CONNECT_LEN];
        buf[0..3].copy_from_slice(&CONNECT_MAGIC);
        buf[3] = direction.to_byte();
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

    fn pair() -> (DPlusHandler, DPlusHandler) {
        (
            DPlusHandler::open("127.0.0.1", 0).unwrap(),
            DPlusHandler::open("127.0.0.1", 0).unwrap(),
        )
    }

    #[test]
    fn connect_is_classified() {
        let (mut a, mut b) = pair();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();
        a.write_connect(Callsign::new("G4KLX"), Callsign::new("REF001"), b_addr, Direction::Bi)
            .unwrap();
        assert_eq!(b.read().unwrap(), Kind::Connect);
    }

    #[test]
    fn dongle_voice_frame_round_trips() {
        let (mut a, mut b) = pair();
        let b_addr: SocketAddr = ([127, 0, 0, 1], b.local_port()).into();
        a.peer = Some(b_addr);

        let frame = AmbeFrame::new(9, 3, true, [5u8; VOICE_LEN], [9, 8, 7]);
        a.write_data(9, &frame).unwrap();

        assert_eq!(b.read().unwrap(), Kind::Ambe);
        let (stream_id, recv_frame) = b.read_data().unwrap();
        assert_eq!(stream_id, 9);
        assert_eq!(recv_frame.data, frame.data);
        assert!(recv_frame.is_end());
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
        let mut buf = [0u8; DONGLE_HEADER_LEN + HEADER_LEN];
        let (n, _) = b.socket.recv_from(&mut buf).unwrap();
        buf[DONGLE_HEADER_LEN + HEADER_LEN - 1] ^= 0xFF;
        a.socket.send_to(&buf[..n], b_addr).unwrap();

        assert_eq!(b.read().unwrap(), Kind::CrcError);
        assert!(b.read_header().is_none());
    }
}
