//! `$GPxxx` NMEA sentence collector.

use super::{Collector, CollectorState, MAX_SENTENCE_LEN, SLOWDATA_TYPE_TEXT};
use crate::callsign::Callsign;

pub struct NmeaCollector {
    prefix: &'static str,
    my_call: Callsign,
    state: CollectorState,
    buffer: Vec<u8>,
    completed: Option<String>,
}

impl NmeaCollector {
    pub fn new(prefix: &'static str) -> NmeaCollector {
        NmeaCollector {
            prefix,
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

        if !sentence.starts_with(self.prefix) {
            return;
        }
        let Some(star) = sentence.rfind('*') else { return };
        if sentence.len() < star + 5 {
            return;
        }
        let checksum_hex = &sentence[star + 1..star + 3];
        let Ok(expected) = u8::from_str_radix(checksum_hex, 16) else {
            return;
        };

        let payload = &sentence[1..star]; // between '$' and '*'
        let computed = payload.bytes().fold(0u8, |acc, b| acc ^ b);
        if computed != expected {
            return;
        }

        let body = sentence[..star + 3].to_string(); // sentence up to and including checksum, no CRLF
        let line = format!("{}>APDPRS,DSTAR*:{}", self.my_call, body);
        self.completed = Some(line);
        self.state = CollectorState::Validated;
    }
}

impl Collector for NmeaCollector {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(collector: &mut NmeaCollector, sentence: &[u8]) -> bool {
        let mut complete = false;
        for &b in sentence {
            complete = collector.write_data(b);
        }
        complete
    }

    #[test]
    fn accepts_matching_checksum() {
        let mut c = NmeaCollector::new("$GPRMC");
        c.set_my_call(Callsign::new("G4KLX"));
        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";
        assert!(feed(&mut c, sentence));
        let line = c.get_data().unwrap();
        assert_eq!(
            line,
            "G4KLX   >APDPRS,DSTAR*:$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A"
        );
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut c = NmeaCollector::new("$GPRMC");
        c.set_my_call(Callsign::new("G4KLX"));
        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*00\r\n";
        assert!(!feed(&mut c, sentence));
        assert!(c.get_data().is_none());
    }

    #[test]
    fn ignores_sentences_with_other_prefix() {
        let mut c = NmeaCollector::new("$GPRMC");
        c.set_my_call(Callsign::new("G4KLX"));
        let sentence = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
        assert!(!feed(&mut c, sentence));
    }

    #[test]
    fn sync_clears_partial_sentence() {
        let mut c = NmeaCollector::new("$GPRMC");
        c.write_data(b'$');
        c.write_data(b'G');
        c.sync();
        assert_eq!(c.state, CollectorState::Idle);
        assert!(c.buffer.is_empty());
    }
}
