//! Crate-wide error type.
//!
//! Mirrors `spec.md` §7's error table. Component-local errors
//! (`CrcError`, `Malformed`) stay small dedicated types close to the
//! parsing code and convert into `GatewayError` only at the boundary
//! where a policy decision (drop stream, reset collector, schedule
//! reconnect, ...) is made.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum GatewayError {
    /// Header or GPS-A CRC mismatch. Policy: drop the entire stream.
    Crc,
    /// Length field out of range or bad NMEA framing. Policy: reset
    /// the specific collector.
    Malformed(&'static str),
    /// UDP/TCP send/recv failure. Policy: close the connection and
    /// schedule a reconnect.
    SocketIo(io::Error),
    /// Reflector link handshake exceeded 5s x 3 retries.
    LinkTimeout,
    /// APRS outbound queue was full when a write was attempted.
    Backpressure,
    /// Mandatory config field missing or out of range.
    ConfigInvalid(String),
    /// DNS lookup failure; retried on the next poll.
    ResolveFailed(String),
    /// Bind failure on a local UDP port; the process must exit(2).
    Fatal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Crc => write!(f, "CRC mismatch"),
            GatewayError::Malformed(msg) => write!(f, "malformed: {msg}"),
            GatewayError::SocketIo(e) => write!(f, "socket I/O: {e}"),
            GatewayError::LinkTimeout => write!(f, "link handshake timed out"),
            GatewayError::Backpressure => write!(f, "outbound queue full"),
            GatewayError::ConfigInvalid(msg) => write!(f, "invalid config: {msg}"),
            GatewayError::ResolveFailed(host) => write!(f, "DNS resolution failed for {host}"),
            GatewayError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        GatewayError::SocketIo(e)
    }
}

/// Process exit codes per `spec.md` §6.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const STARTUP: i32 = 2;
    pub const CRASH: i32 = 3;
}

/// Frame-codec-local CRC failure; the caller drops the whole stream.
#[derive(Debug, PartialEq, Eq)]
pub struct CrcError;

impl fmt::Display for CrcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CRC mismatch")
    }
}

impl std::error::Error for CrcError {}

impl From<CrcError> for GatewayError {
    fn from(_: CrcError) -> Self {
        GatewayError::Crc
    }
}

/// Frame-codec-local malformed-input failure.
#[derive(Debug, PartialEq, Eq)]
pub struct Malformed(pub &'static str);

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed: {}", self.0)
    }
}

impl std::error::Error for Malformed {}

impl From<Malformed> for GatewayError {
    fn from(m: Malformed) -> Self {
        GatewayError::Malformed(m.0)
    }
}
