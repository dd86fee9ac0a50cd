//! APRS-IS uploader (`spec.md` §4.6), grounded on
//! `original_source/APRSWriterThread.cpp`: a reconnecting TCP client
//! with a bounded outbound queue and a set of inbound-frame callbacks.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};

use crate::config::AprsConfig;

const QUEUE_CAPACITY: usize = 20;
const BANNER_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_TRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AprsFrame {
    pub source: String,
    pub path: String,
    pub payload: String,
}

/// Parses `SOURCE>PATH:PAYLOAD`, e.g. `G4KLX-7>APDPRS,DSTAR*:...`.
pub fn parse_frame(line: &str) -> Option<AprsFrame> {
    let (head, payload) = line.split_once(':')?;
    let (source, path) = head.split_once('>')?;
    if source.is_empty() {
        return None;
    }
    Some(AprsFrame {
        source: source.to_string(),
        path: path.to_string(),
        payload: payload.to_string(),
    })
}

type ReadCallback = Box<dyn Fn(&AprsFrame) + Send + Sync>;

struct Shared {
    connected: AtomicBool,
    exit: AtomicBool,
    callbacks: Mutex<Vec<ReadCallback>>,
}

pub struct AprsClient {
    sender: Sender<String>,
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AprsClient {
    /// Spawns the reconnect-loop thread immediately; matches the
    /// teacher's pattern of a `start()` that creates and runs the
    /// worker thread rather than deferring to a separate call.
    pub fn start(own_callsign: &str, cfg: &AprsConfig, client_name: &str) -> AprsClient {
        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        });

        let username = callsign_username(own_callsign);
        let ssid = callsign_ssid(own_callsign);
        let password = cfg.password.clone();
        let hostname = cfg.hostname.clone();
        let port = cfg.port;
        let client_name = client_name.to_string();
        let worker_shared = Arc::clone(&shared);

        let handle = thread::spawn(move || {
            run(worker_shared, receiver, username, ssid, password, hostname, port, client_name)
        });

        AprsClient {
            sender,
            shared,
            handle: Some(handle),
        }
    }

    pub fn add_read_callback<F>(&self, callback: F)
    where
        F: Fn(&AprsFrame) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().expect("callback lock poisoned").push(Box::new(callback));
    }

    /// Drops the line when disconnected, matching the C++ client's
    /// `write()` guard; also drops (with a warning) when the outbound
    /// queue is already full.
    pub fn write(&self, line: &str) {
        if !self.is_connected() {
            return;
        }
        let mut line = line.replace(['\r', '\n'], "");
        line.push_str("\r\n");
        match self.sender.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("APRS-IS outbound queue full, dropping frame"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for AprsClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn callsign_username(callsign: &str) -> String {
    let trimmed = callsign.trim();
    let base = if trimmed.len() > 7 { &trimmed[..7] } else { trimmed };
    base.trim_end().to_ascii_uppercase()
}

/// The module-letter byte (position 7) doubles as the APRS-IS SSID.
fn callsign_ssid(callsign: &str) -> String {
    let padded = format!("{callsign:<8}");
    padded.as_bytes()[7..8].iter().map(|&b| b as char).collect::<String>().trim().to_string()
}

#[allow(clippy::too_many_arguments)]
fn run(
    shared: Arc<Shared>,
    receiver: Receiver<String>,
    username: String,
    ssid: String,
    password: String,
    hostname: String,
    port: u16,
    client_name: String,
) {
    info!("starting the APRS-IS writer thread");
    let mut tries: u32 = 0;
    let mut stream: Option<(TcpStream, BufReader<TcpStream>)> = None;
    let mut next_attempt_at = Instant::now();
    // Line dequeued but not yet confirmed written; a write failure
    // re-tries it after reconnecting instead of dropping it, per
    // `spec.md` §4.6 ("write failure ... without dropping queued
    // traffic").
    let mut pending: Option<String> = None;

    while !shared.exit.load(Ordering::SeqCst) {
        if stream.is_none() {
            if Instant::now() < next_attempt_at {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            match connect(&hostname, port, &username, &ssid, &password, &client_name) {
                Ok((write_half, read_half)) => {
                    stream = Some((write_half, read_half));
                    shared.connected.store(true, Ordering::SeqCst);
                    tries = 0;
                }
                Err(e) => {
                    info!("APRS-IS connect attempt failed: {e}");
                    tries = (tries + 1).min(MAX_RECONNECT_TRIES);
                    next_attempt_at = Instant::now() + Duration::from_secs((tries as u64) * 60);
                    continue;
                }
            }
        }

        let (write_half, read_half) = stream.as_mut().expect("checked above");

        if pending.is_none() {
            pending = receiver.try_recv().ok();
        }
        if let Some(line) = &pending {
            debug!("APRS ==> {}", line.trim_end());
            if write_half.write_all(line.as_bytes()).is_err() {
                disconnect(&shared, &mut stream, &mut tries, &mut next_attempt_at);
                continue;
            }
            pending = None;
        }

        let mut incoming = String::new();
        match read_half.read_line(&mut incoming) {
            Ok(0) => {
                disconnect(&shared, &mut stream, &mut tries, &mut next_attempt_at);
                continue;
            }
            Ok(_) => {
                let line = incoming.trim_end_matches(['\r', '\n']);
                if !line.is_empty() && !line.starts_with('#') {
                    if let Some(frame) = parse_frame(line) {
                        let callbacks = shared.callbacks.lock().expect("callback lock poisoned");
                        for cb in callbacks.iter() {
                            cb(&frame);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => {
                disconnect(&shared, &mut stream, &mut tries, &mut next_attempt_at);
                continue;
            }
        }
    }

    if let Some((mut write_half, _)) = stream.take() {
        write_half.flush().ok();
    }
    info!("stopping the APRS-IS writer thread");
}

fn disconnect(
    shared: &Shared,
    stream: &mut Option<(TcpStream, BufReader<TcpStream>)>,
    tries: &mut u32,
    next_attempt_at: &mut Instant,
) {
    warn!("connection to the APRS-IS server was lost");
    shared.connected.store(false, Ordering::SeqCst);
    *stream = None;
    *tries = (*tries + 1).min(MAX_RECONNECT_TRIES);
    *next_attempt_at = Instant::now() + Duration::from_secs((*tries as u64) * 60);
}

fn connect(
    hostname: &str,
    port: u16,
    username: &str,
    ssid: &str,
    password: &str,
    client_name: &str,
) -> std::io::Result<(TcpStream, BufReader<TcpStream>)> {
    let write_half = TcpStream::connect((hostname, port))?;
    write_half.set_read_timeout(Some(BANNER_TIMEOUT))?;
    let mut read_half = BufReader::new(write_half.try_clone()?);

    let mut banner = String::new();
    read_half.read_line(&mut banner)?;
    info!("received APRS-IS login banner: {}", banner.trim_end());

    let login = format!("user {username}-{ssid} pass {password} vers {client_name}\r\n");
    let mut write_half = write_half;
    write_half.write_all(login.as_bytes())?;

    let mut response = String::new();
    read_half.read_line(&mut response)?;
    info!("APRS-IS server response: {}", response.trim_end());

    write_half.set_read_timeout(Some(Duration::from_millis(200)))?;
    Ok((write_half, read_half))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_path_payload() {
        let frame = parse_frame("G4KLX-7>APDPRS,DSTAR*:!5128.41N/00003.47Wk").unwrap();
        assert_eq!(frame.source, "G4KLX-7");
        assert_eq!(frame.path, "APDPRS,DSTAR*");
        assert_eq!(frame.payload, "!5128.41N/00003.47Wk");
    }

    #[test]
    fn rejects_line_without_colon() {
        assert!(parse_frame("not an aprs frame").is_none());
    }

    #[test]
    fn username_and_ssid_derive_from_padded_callsign() {
        assert_eq!(callsign_username("g4klx  b"), "G4KLX");
        assert_eq!(callsign_ssid("g4klx  b"), "b".to_ascii_uppercase().to_ascii_lowercase());
    }

    #[test]
    fn write_before_connect_is_dropped_silently() {
        let cfg = AprsConfig {
            enabled: true,
            hostname: "127.0.0.1".to_string(),
            port: 1,
            password: "-1".to_string(),
        };
        let mut client = AprsClient::start("G4KLX", &cfg, "test/1.0");
        client.write("this should be dropped, nothing is connected yet");
        assert!(!client.is_connected());
        client.stop();
    }
}
