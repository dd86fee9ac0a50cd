//! D-Star frame transport: header parsing/emission, AMBE framing, and
//! the slow-data demultiplexer (`spec.md` §4.1).

pub mod ambe;
pub mod header;
pub mod slowdata;

pub use ambe::AmbeFrame;
pub use header::Header;
pub use slowdata::{collect_slow_data, descramble_slow_data, scramble_slow_data, SlowDataDemux};
