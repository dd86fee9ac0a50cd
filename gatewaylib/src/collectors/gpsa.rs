//! GPS-A (`$$CRC<hex4>,<payload>`) collector.
//!
//! A GPS-A frame is a line of the form `$$CRC<hex4>,<payload>\r\n`
//! where `<hex4>` is a CCITT-16 CRC over the payload *including* the
//! terminating `\r\n` but *excluding* the CRC field itself
//! (`spec.md` §4.2).

use super::{Collector, CollectorState, MAX_SENTENCE_LEN, SLOWDATA_TYPE_TEXT};
use crate::callsign::Callsign;
use crate::crc::ccitt16;

const PREFIX: &str = "$$CRC";
const OVERLAY: char = '\\';
const SYMBOL: char = 'K';

pub struct GpsACollector {
    my_call: Callsign,
    state: CollectorState,
    buffer: Vec<u8>,
    completed: Option<String>,
}

impl GpsACollector {
    pub fn new() -> GpsACollector {
        GpsACollector {
            my_call: Callsign::new(""),
            state: CollectorState::Idle,
            buffer: Vec::new(),
            completed: None,
        }
    }

    fn validate(&mut self) {
        self.state = CollectorState::Idle;
        let sentence = match std::str::from_utf8(&self.buffer) {
            Ok(s) => s,
            Err(_) => return,
        };

        if !sentence.starts_with(PREFIX) {
            return;
        }
        let rest = &sentence[PREFIX.len()..];
        if rest.len() < 5 || rest.as_bytes()[4] != b',' {
            return;
        }
        let Ok(expected) = u16::from_str_radix(&rest[..4], 16) else {
            return;
        };
        let payload = &rest[5..]; // includes trailing \r\n
        let computed = ccitt16(payload.as_bytes());
        if computed != expected {
            return;
        }

        let body = payload.trim_end_matches(['\r', '\n']);
        let formatted = if let Some(stripped) = body.strip_prefix('!') {
            format!("!{OVERLAY}{stripped}{SYMBOL}")
        } else {
            body.to_string()
        };

        self.completed = Some(format!("{}>APDPRS,DSTAR*:{}", self.my_call, formatted));
        self.state = CollectorState::Validated;
    }
}

impl Collector for GpsACollector {
    fn set_my_call(&mut self, call: Callsign) {
        self.my_call = call;
    }

    fn write_data(&mut self, byte: u8) -> bool {
        match self.state {
            CollectorState::Idle | CollectorState::Validated | CollectorState::Complete => {
                if byte == b'$' {
                    self.buffer.clear();
                    self.buffer.push(byte);
                    self.state = CollectorState::Accumulating;
                }
                false
            }
            CollectorState::Accumulating => {
                self.buffer.push(byte);
                if self.buffer.len() > MAX_SENTENCE_LEN {
                    self.reset();
                    return false;
                }
                if self.buffer.ends_with(b"\r\n") {
                    self.state = CollectorState::Complete;
                    self.validate();
                    return self.state == CollectorState::Validated;
                }
                false
            }
        }
    }

    fn sync(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.state = CollectorState::Idle;
        self.buffer.clear();
    }

    fn get_data(&mut self) -> Option<String> {
        self.completed.take()
    }

    fn data_type(&self) -> u8 {
        SLOWDATA_TYPE_TEXT
    }
}

impl Default for GpsACollector {
    fn default() -> Self {
        GpsACollector::new()
    }
}
