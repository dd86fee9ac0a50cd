//! Sentence collectors (`spec.md` §4.2).
//!
//! Each collector consumes one byte at a time from the reassembled
//! slow-data text stream and emits exactly one complete,
//! checksum-validated APRS-IS line when ready. `AprsCollector` is the
//! fan-out aggregator grounded on `original_source/APRSCollector.cpp`:
//! a single byte is broadcast to every sentence-prefix collector, and
//! `write_data` reports true if *any* of them completed.

mod gpsa;
mod nmea;

pub use gpsa::GpsACollector;
pub use nmea::NmeaCollector;

use crate::callsign::Callsign;

/// The slow-data block type carrying APRS/GPS text, as opposed to
/// DTMF or other side-channel uses (`spec.md` §3). Every sentence
/// collector only wants blocks tagged with this type.
pub const SLOWDATA_TYPE_TEXT: u8 = 0x01;

/// Maximum NMEA/GPS-A sentence length before a collector gives up and
/// resets, mirroring the original `APRS_DATA_LENGTH` bound.
pub const MAX_SENTENCE_LEN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectorState {
    Idle,
    Accumulating,
    Complete,
    Validated,
}

pub trait Collector {
    fn set_my_call(&mut self, call: Callsign);
    /// Feeds one descrambled slow-data byte. Returns true once a
    /// complete, checksum-validated sentence is ready via `get_data`.
    fn write_data(&mut self, byte: u8) -> bool;
    /// Called on stream sync frames; resets assembly state.
    fn sync(&mut self);
    fn reset(&mut self);
    /// Takes the formatted APRS-IS line, if one is ready.
    fn get_data(&mut self) -> Option<String>;
    /// The slow-data block type this collector wants fed.
    fn data_type(&self) -> u8;
}

/// Fans descrambled slow-data bytes out to every sentence-prefix
/// collector at once (`original_source/APRSCollector.cpp`).
pub struct AprsCollector {
    collectors: Vec<Box<dyn Collector + Send>>,
}

impl AprsCollector {
    pub fn new() -> AprsCollector {
        let collectors: Vec<Box<dyn Collector + Send>> = vec![
            Box::new(GpsACollector::new()),
            Box::new(NmeaCollector::new("$GPRMC")),
            Box::new(NmeaCollector::new("$GPGGA")),
            Box::new(NmeaCollector::new("$GPGLL")),
            Box::new(NmeaCollector::new("$GPVTG")),
            Box::new(NmeaCollector::new("$GPGSA")),
            Box::new(NmeaCollector::new("$GPGSV")),
        ];
        AprsCollector { collectors }
    }

    pub fn set_my_call(&mut self, call: Callsign) {
        for c in self.collectors.iter_mut() {
            c.set_my_call(call);
        }
    }

    /// Feeds one byte belonging to the given slow-data block type.
    /// Returns true if any sub-collector completed a sentence.
    pub fn write_data(&mut self, data_type: u8, byte: u8) -> bool {
        let mut any_complete = false;
        for c in self.collectors.iter_mut() {
            if c.data_type() == data_type && c.write_data(byte) {
                any_complete = true;
            }
        }
        any_complete
    }

    pub fn sync(&mut self) {
        for c in self.collectors.iter_mut() {
            c.sync();
        }
    }

    pub fn reset(&mut self) {
        for c in self.collectors.iter_mut() {
            c.reset();
        }
    }

    /// Returns the first ready line among collectors matching
    /// `data_type`, if any.
    pub fn get_data(&mut self, data_type: u8) -> Option<String> {
        for c in self.collectors.iter_mut() {
            if c.data_type() == data_type {
                if let Some(line) = c.get_data() {
                    return Some(line);
                }
            }
        }
        None
    }
}

impl Default for AprsCollector {
    fn default() -> Self {
        AprsCollector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmea_passthrough_scenario() {
        let mut aggregate = AprsCollector::new();
        aggregate.set_my_call(Callsign::new("G4KLX"));

        let sentence = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";
        let mut completed_line = None;
        for &b in sentence {
            if aggregate.write_data(SLOWDATA_TYPE_TEXT, b) {
                completed_line = aggregate.get_data(SLOWDATA_TYPE_TEXT);
            }
        }

        let line = completed_line.expect("sentence should validate");
        assert!(line.starts_with("G4KLX   >APDPRS,DSTAR*:$GPRMC,123519,A,"));
        assert!(line.ends_with("*6A"));
    }
}
