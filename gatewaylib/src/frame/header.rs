//! D-Star header: 41 bytes, CCITT-16 CRC over the first 39.
//!
//! Layout (JARL STD-T101, `spec.md` §3):
//! `flags(3) rpt2(8) rpt1(8) yourCall(8) myCall1(8) myCall2(4) crc(2)`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::callsign::Callsign;
use crate::crc::ccitt16;
use crate::error::CrcError;

pub const HEADER_LEN: usize = 41;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: [u8; 3],
    pub rpt2: Callsign,
    pub rpt1: Callsign,
    pub your_call: Callsign,
    pub my_call1: Callsign,
    pub my_call2: [u8; 4],
}

impl Header {
    /// Parses a 41-byte header, verifying the trailing CCITT-16 CRC.
    /// On mismatch the caller drops the whole stream (`spec.md` §4.1).
    pub fn parse(bytes: &[u8]) -> Result<Header, CrcError> {
        if bytes.len() != HEADER_LEN {
            return Err(CrcError);
        }

        let expected = ccitt16(&bytes[..39]);
        let mut cur = Cursor::new(&bytes[39..41]);
        let actual = cur.read_u16::<LittleEndian>().map_err(|_| CrcError)?;
        if expected != actual {
            return Err(CrcError);
        }

        let mut flags = [0u8; 3];
        flags.copy_from_slice(&bytes[0..3]);

        let mut rpt2 = [0u8; 8];
        rpt2.copy_from_slice(&bytes[3..11]);
        let mut rpt1 = [0u8; 8];
        rpt1.copy_from_slice(&bytes[11..19]);
        let mut your_call = [0u8; 8];
        your_call.copy_from_slice(&bytes[19..27]);
        let mut my_call1 = [0u8; 8];
        my_call1.copy_from_slice(&bytes[27..35]);
        let mut my_call2 = [0u8; 4];
        my_call2.copy_from_slice(&bytes[35..39]);

        Ok(Header {
            flags,
            rpt2: Callsign::from_bytes(rpt2),
            rpt1: Callsign::from_bytes(rpt1),
            your_call: Callsign::from_bytes(your_call),
            my_call1: Callsign::from_bytes(my_call1),
            my_call2,
        })
    }

    /// Serializes a header, (re)computing the CRC over the first 39 bytes.
    pub fn emit(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..3].copy_from_slice(&self.flags);
        out[3..11].copy_from_slice(self.rpt2.as_bytes());
        out[11..19].copy_from_slice(self.rpt1.as_bytes());
        out[19..27].copy_from_slice(self.your_call.as_bytes());
        out[27..35].copy_from_slice(self.my_call1.as_bytes());
        out[35..39].copy_from_slice(&self.my_call2);

        let crc = ccitt16(&out[..39]);
        let mut cur = Cursor::new(&mut out[39..41]);
        cur.write_u16::<LittleEndian>(crc).expect("fixed-size buffer");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            flags: [0x00, 0x00, 0x00],
            rpt2: Callsign::with_module("G4KLX", b'G'),
            rpt1: Callsign::with_module("G4KLX", b'B'),
            your_call: Callsign::new("CQCQCQ"),
            my_call1: Callsign::with_module("G4KLX", b'B'),
            my_call2: *b"RPTR",
        }
    }

    #[test]
    fn round_trips_through_emit_and_parse() {
        let h = sample_header();
        let bytes = h.emit();
        let parsed = Header::parse(&bytes).expect("valid crc");
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_bad_crc() {
        let h = sample_header();
        let mut bytes = h.emit();
        bytes[39] ^= 0xFF;
        assert_eq!(Header::parse(&bytes), Err(CrcError));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(Header::parse(&[0u8; 10]), Err(CrcError));
    }
}
