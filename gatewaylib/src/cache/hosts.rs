//! Host-file loading and refresh (`spec.md` §4.5), grounded on
//! `original_source/Common/HostsFilesManager.h` and its
//! `Tests/HostsFilesManager/UpdateHosts.cpp` fixtures: per-protocol
//! host files are loaded from an "internet" directory (unlocked
//! entries, replaced wholesale on every refresh) and then overlaid by
//! a "custom" directory (locked entries an operator maintains by
//! hand, which always win).

use std::fs;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::callsign::Callsign;
use crate::cache::{GatewayCache, GatewayRecord};
use crate::clock::Timer;
use crate::config::{Config, ReflectorProtocol};
use crate::error::GatewayError;

const REFRESH_INTERVAL_MS: u64 = 3_600_000;
const DEFAULT_PORTS: [(ReflectorProtocol, u16); 3] = [
    (ReflectorProtocol::DExtra, 30_001),
    (ReflectorProtocol::Dcs, 30_051),
    (ReflectorProtocol::DPlus, 20_001),
];

fn default_port(protocol: ReflectorProtocol) -> u16 {
    DEFAULT_PORTS
        .iter()
        .find(|(p, _)| *p == protocol)
        .map(|(_, port)| *port)
        .unwrap_or(30_001)
}

#[derive(Clone)]
struct FamilyEntry {
    protocol: ReflectorProtocol,
    enabled: bool,
    url: String,
    filename: &'static str,
}

type Downloader = dyn Fn(&str, &Path, Duration) -> Result<(), GatewayError> + Send + Sync;

pub struct HostsFilesManager {
    internet_dir: PathBuf,
    custom_dir: PathBuf,
    cache: Arc<GatewayCache>,
    families: Vec<FamilyEntry>,
    download_timeout: Duration,
    downloader: Arc<Downloader>,
    refreshing: Arc<AtomicBool>,
    refresh_timer: Timer,
}

impl HostsFilesManager {
    pub fn new(internet_dir: impl Into<PathBuf>, custom_dir: impl Into<PathBuf>, cache: Arc<GatewayCache>, cfg: &Config) -> HostsFilesManager {
        let families = vec![
            FamilyEntry {
                protocol: ReflectorProtocol::DExtra,
                enabled: cfg.dextra.enabled,
                url: cfg.dextra.hostfile_url.clone(),
                filename: "DExtra_hosts.txt",
            },
            FamilyEntry {
                protocol: ReflectorProtocol::Dcs,
                enabled: cfg.dcs.enabled,
                url: cfg.dcs.hostfile_url.clone(),
                filename: "DCS_hosts.txt",
            },
            FamilyEntry {
                protocol: ReflectorProtocol::DPlus,
                enabled: cfg.dplus.enabled,
                url: cfg.dplus.hostfile_url.clone(),
                filename: "DPlus_hosts.txt",
            },
            // XLX reflectors speak the DCS wire protocol but are listed
            // in their own hosts file.
            FamilyEntry {
                protocol: ReflectorProtocol::Dcs,
                enabled: cfg.xlx.enabled,
                url: cfg.xlx.hostfile_url.clone(),
                filename: "XLXHosts.txt",
            },
        ];
        let mut refresh_timer = Timer::with_timeout_ms(REFRESH_INTERVAL_MS);
        refresh_timer.start();
        HostsFilesManager {
            internet_dir: internet_dir.into(),
            custom_dir: custom_dir.into(),
            cache,
            families,
            download_timeout: Duration::from_secs(10),
            downloader: Arc::new(http_get_to_file),
            refreshing: Arc::new(AtomicBool::new(false)),
            refresh_timer,
        }
    }

    pub fn set_download_timeout(&mut self, timeout: Duration) {
        self.download_timeout = timeout;
    }

    /// Ticks the refresh timer; when it expires, starts an async
    /// refresh (a no-op if one is already in flight) and restarts.
    pub fn clock(&mut self, ms: u64) {
        self.refresh_timer.clock(ms);
        if self.refresh_timer.has_expired() {
            self.refresh_timer.start();
            self.update_hosts_async();
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Downloads every enabled family's host file into the internet
    /// directory, then loads both directories into the cache.
    pub fn update_hosts(&self) -> Result<(), GatewayError> {
        self.update_hosts_from_internet()?;
        self.update_hosts_from_local()
    }

    pub fn update_hosts_from_internet(&self) -> Result<(), GatewayError> {
        fs::create_dir_all(&self.internet_dir).map_err(GatewayError::from)?;
        for family in self.families.iter().filter(|f| f.enabled && !f.url.is_empty()) {
            let dest = self.internet_dir.join(family.filename);
            if let Err(e) = (self.downloader)(&family.url, &dest, self.download_timeout) {
                warn!("failed to download {}: {}", family.url, e);
            }
        }
        Ok(())
    }

    /// Loads both directories into the cache: internet entries first
    /// (unlocked), then custom entries overlaid on top (locked).
    pub fn update_hosts_from_local(&self) -> Result<(), GatewayError> {
        self.cache.clear_unlocked();
        for family in self.families.iter().filter(|f| f.enabled) {
            let internet_path = self.internet_dir.join(family.filename);
            load_into_cache(&internet_path, family.protocol, false, &self.cache);
            let custom_path = self.custom_dir.join(family.filename);
            load_into_cache(&custom_path, family.protocol, true, &self.cache);
        }
        Ok(())
    }

    /// Single-flight: if a refresh is already running this call is a
    /// no-op rather than queuing a second one.
    pub fn update_hosts_async(&self) {
        if self.refreshing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            debug!("hosts refresh already in progress, skipping");
            return;
        }
        let internet_dir = self.internet_dir.clone();
        let custom_dir = self.custom_dir.clone();
        let cache = Arc::clone(&self.cache);
        let families = self.families.clone();
        let downloader = Arc::clone(&self.downloader);
        let timeout = self.download_timeout;
        let refreshing = Arc::clone(&self.refreshing);
        thread::spawn(move || {
            fs::create_dir_all(&internet_dir).ok();
            for family in families.iter().filter(|f| f.enabled && !f.url.is_empty()) {
                let dest = internet_dir.join(family.filename);
                if let Err(e) = downloader(&family.url, &dest, timeout) {
                    warn!("failed to download {}: {}", family.url, e);
                }
            }
            cache.clear_unlocked();
            for family in families.iter().filter(|f| f.enabled) {
                load_into_cache(&internet_dir.join(family.filename), family.protocol, false, &cache);
                load_into_cache(&custom_dir.join(family.filename), family.protocol, true, &cache);
            }
            refreshing.store(false, Ordering::SeqCst);
        });
    }
}

fn load_into_cache(path: &Path, protocol: ReflectorProtocol, locked: bool, cache: &GatewayCache) {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return,
    };
    for line in text.lines() {
        if let Some((callsign, addr)) = parse_host_line(line, protocol) {
            cache.insert(callsign, GatewayRecord { protocol, address: addr, locked });
        }
    }
}

/// Parses one `CALLSIGN ADDRESS[ PORT][ # comment]` line. Blank lines
/// and lines starting with `#` are skipped.
fn parse_host_line(line: &str, protocol: ReflectorProtocol) -> Option<(Callsign, SocketAddr)> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return None;
    }
    let mut tokens = line.split_whitespace();
    let call_token = tokens.next()?;
    let addr_token = tokens.next()?;
    let ip: IpAddr = addr_token.parse().ok()?;
    let port = match tokens.next() {
        Some(p) => p.parse().ok()?,
        None => default_port(protocol),
    };
    let module = if call_token.len() >= 8 {
        call_token.as_bytes()[7]
    } else {
        b'G'
    };
    let callsign = Callsign::with_module(call_token.trim_end(), module);
    Some((callsign, SocketAddr::new(ip, port)))
}

/// Minimal blocking HTTP/1.0 GET, matching the teacher/pack's
/// preference for plain `std::net` over a pulled-in HTTP client crate.
fn http_get_to_file(url: &str, dest: &Path, timeout: Duration) -> Result<(), GatewayError> {
    let (host, port, path) = split_http_url(url)?;
    let mut stream = TcpStream::connect((host.as_str(), port)).map_err(GatewayError::from)?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();
    let request = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).map_err(GatewayError::from)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).map_err(GatewayError::from)?;
    let body_start = find_header_end(&response).unwrap_or(0);
    fs::write(dest, &response[body_start..]).map_err(GatewayError::from)?;
    Ok(())
}

fn find_header_end(response: &[u8]) -> Option<usize> {
    response.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn split_http_url(url: &str) -> Result<(String, u16, String), GatewayError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| GatewayError::ConfigInvalid(format!("unsupported host file URL: {url}")))?;
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let path = format!("/{path}");
    let (host, port) = authority
        .split_once(':')
        .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(80)))
        .unwrap_or((authority.to_string(), 80));
    Ok((host, port, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReflectorFamilyConfig;

    #[test]
    fn parses_plain_host_line() {
        let (call, addr) = parse_host_line("XRF123   1.1.1.1", ReflectorProtocol::DExtra).unwrap();
        assert_eq!(call.trimmed(), "XRF123 G");
        assert_eq!(addr.ip().to_string(), "1.1.1.1");
        assert_eq!(addr.port(), default_port(ReflectorProtocol::DExtra));
    }

    #[test]
    fn parses_host_line_with_port_and_comment() {
        let (_, addr) = parse_host_line("DCS001 2.2.2.2 30099 # test reflector", ReflectorProtocol::Dcs).unwrap();
        assert_eq!(addr.port(), 30099);
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_host_line("", ReflectorProtocol::Dcs).is_none());
        assert!(parse_host_line("# a comment", ReflectorProtocol::Dcs).is_none());
    }

    #[test]
    fn split_http_url_splits_host_port_path() {
        let (host, port, path) = split_http_url("http://www.pistar.uk/downloads/DExtra_hosts.txt").unwrap();
        assert_eq!(host, "www.pistar.uk");
        assert_eq!(port, 80);
        assert_eq!(path, "/downloads/DExtra_hosts.txt");
    }

    #[test]
    fn local_files_overlay_custom_over_internet() {
        let dir = std::env::temp_dir().join(format!("gatewaylib-hosts-test-{}", std::process::id()));
        let internet_dir = dir.join("internet");
        let custom_dir = dir.join("custom");
        fs::create_dir_all(&internet_dir).unwrap();
        fs::create_dir_all(&custom_dir).unwrap();
        fs::write(internet_dir.join("DExtra_hosts.txt"), "XRF123 1.1.1.1\n").unwrap();
        fs::write(custom_dir.join("DExtra_hosts.txt"), "XRF123 9.9.9.9\n").unwrap();

        let cache = Arc::new(GatewayCache::new());
        load_into_cache(&internet_dir.join("DExtra_hosts.txt"), ReflectorProtocol::DExtra, false, &cache);
        load_into_cache(&custom_dir.join("DExtra_hosts.txt"), ReflectorProtocol::DExtra, true, &cache);

        let call = Callsign::with_module("XRF123", b'G');
        let record = cache.find(&call).unwrap();
        assert_eq!(record.address.ip().to_string(), "9.9.9.9");
        assert!(record.locked);

        fs::remove_dir_all(&dir).ok();
    }

    fn test_config() -> Config {
        Config {
            gateway: crate::config::GatewayConfig {
                callsign: "G4KLX".to_string(),
                address: "127.0.0.1".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                gateway_type: crate::config::GatewayType::Repeater,
                language: "en_US".to_string(),
            },
            repeaters: Vec::new(),
            ircddb: Vec::new(),
            aprs: crate::config::AprsConfig::default(),
            dextra: ReflectorFamilyConfig { protocol: ReflectorProtocol::DExtra, enabled: true, hostfile_url: String::new(), max_dongles: 3 },
            dcs: ReflectorFamilyConfig { protocol: ReflectorProtocol::Dcs, enabled: false, hostfile_url: String::new(), max_dongles: 3 },
            dplus: ReflectorFamilyConfig { protocol: ReflectorProtocol::DPlus, enabled: false, hostfile_url: String::new(), max_dongles: 3 },
            xlx: ReflectorFamilyConfig { protocol: ReflectorProtocol::Dcs, enabled: false, hostfile_url: String::new(), max_dongles: 3 },
        }
    }

    /// `spec.md` §8 scenario 6, exercised through the public API (not
    /// `load_into_cache` directly) so a filename mismatch with §4.5
    /// would actually be caught.
    #[test]
    fn update_hosts_uses_the_exact_spec_filenames() {
        let dir = std::env::temp_dir().join(format!("gatewaylib-hosts-scenario6-{}", std::process::id()));
        let internet_dir = dir.join("internet");
        let custom_dir = dir.join("custom");
        fs::create_dir_all(&internet_dir).unwrap();
        fs::create_dir_all(&custom_dir).unwrap();
        fs::write(internet_dir.join("DExtra_hosts.txt"), "XRF123 1.1.1.1\n").unwrap();
        fs::write(custom_dir.join("DExtra_hosts.txt"), "XRF123 2.2.2.2\n").unwrap();

        let cache = Arc::new(GatewayCache::new());
        let manager = HostsFilesManager::new(&internet_dir, &custom_dir, Arc::clone(&cache), &test_config());
        manager.update_hosts_from_local().unwrap();

        let call = Callsign::with_module("XRF123", b'G');
        let record = cache.find(&call).unwrap();
        assert_eq!(record.address.ip().to_string(), "2.2.2.2");
        assert_eq!(record.protocol, ReflectorProtocol::DExtra);
        assert!(record.locked);

        fs::remove_dir_all(&dir).ok();
    }
}
