//! Routing orchestrator (`spec.md` §2, §5): wires the frame codec,
//! sentence collectors, reflector handler pools, gateway cache, APRS-IS
//! client and ircDDB client into the single routing loop that moves
//! voice and slow-data between a repeater and its linked reflector.
//!
//! The repeater-facing socket reuses the DExtra wire envelope (`spec.md`
//! §4.3 is the only bit-exact UDP layout the specification gives for
//! carrying a `Header`/`AmbeFrame` pair) rather than inventing a fourth,
//! unspecified wire format for the HB/Icom repeater side.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;

use crate::aprs::AprsClient;
use crate::cache::{GatewayCache, GatewayRecord, HostsFilesManager};
use crate::callsign::Callsign;
use crate::clock::Timer;
use crate::collectors::{AprsCollector, SLOWDATA_TYPE_TEXT};
use crate::config::{Config, ReflectorProtocol, RepeaterConfig};
use crate::error::GatewayError;
use crate::frame::slowdata::SlowDataDemux;
use crate::ircddb::IrcDdbClient;
use crate::reflector::{DExtraHandler, DPlusHandler, DcsHandler, Direction, HandlerPool, Kind, ReflectorHandler, ReflectorLink};
use crate::stats::{Stat, Stats};

const TICK_MS: u64 = 10;
const LOOKUP_RETRY_MS: u64 = 60_000;
const KEEPALIVE_MS: u64 = 1_000;

struct ActiveLink {
    protocol: ReflectorProtocol,
    port: u16,
    link: ReflectorLink,
}

/// Per-repeater routing state: its own local-facing socket, slow-data
/// assembler, APRS sentence collectors, and the reflector link it is
/// currently routed through (if any).
struct ModuleRoute {
    config: RepeaterConfig,
    local: DExtraHandler,
    demux: SlowDataDemux,
    collector: AprsCollector,
    active: Option<ActiveLink>,
    lookup_timer: Timer,
}

/// Owns every long-lived subsystem and runs the main routing loop
/// described in `spec.md` §5: a periodic tick drives the clock bus, and
/// each iteration polls every socket with a short, non-blocking timeout.
pub struct Gateway {
    own_callsign: Callsign,
    cache: Arc<GatewayCache>,
    hosts: HostsFilesManager,
    aprs: Option<AprsClient>,
    ircddb: Option<Arc<IrcDdbClient>>,
    pools: Vec<(ReflectorProtocol, HandlerPool)>,
    modules: Vec<ModuleRoute>,
    stats: Stats,
    exit: Arc<AtomicBool>,
}

impl Gateway {
    pub fn new(config: &Config, internet_hosts_dir: PathBuf, custom_hosts_dir: PathBuf) -> Result<Gateway, GatewayError> {
        let own_callsign = Callsign::with_module(&config.gateway.callsign, b'G');
        let cache = Arc::new(GatewayCache::new());
        let hosts = HostsFilesManager::new(internet_hosts_dir, custom_hosts_dir, Arc::clone(&cache), config);

        let aprs = if config.aprs.enabled {
            let client = AprsClient::start(&config.gateway.callsign, &config.aprs, "gatewaylib/1.0");
            Some(client)
        } else {
            None
        };

        let ircddb = config.ircddb.first().map(|cfg| {
            let client = Arc::new(IrcDdbClient::new("#dstar", &cfg.username));
            client.start(&config.gateway.callsign, cfg);
            client
        });

        let mut pools = Vec::new();
        for (protocol, enabled, base_port, opener) in [
            (
                ReflectorProtocol::DExtra,
                config.dextra.enabled,
                40_000u16,
                open_dextra as OpenerFn,
            ),
            (ReflectorProtocol::Dcs, config.dcs.enabled, 40_100u16, open_dcs as OpenerFn),
            (ReflectorProtocol::DPlus, config.dplus.enabled, 40_200u16, open_dplus as OpenerFn),
        ] {
            if enabled {
                pools.push((protocol, HandlerPool::new(config.gateway.address.clone(), base_port, opener)));
            }
        }

        let mut modules = Vec::new();
        for repeater in &config.repeaters {
            let local = DExtraHandler::open(&repeater.address, repeater.port)?;
            modules.push(ModuleRoute {
                config: repeater.clone(),
                local,
                demux: SlowDataDemux::new(),
                collector: {
                    let mut c = AprsCollector::new();
                    c.set_my_call(Callsign::with_module(&repeater.callsign, repeater.band));
                    c
                },
                active: None,
                lookup_timer: Timer::with_timeout_ms(LOOKUP_RETRY_MS),
            });
        }

        Ok(Gateway {
            own_callsign,
            cache,
            hosts,
            aprs,
            ircddb,
            pools,
            modules,
            stats: Stats::new(),
            exit: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    pub fn own_callsign(&self) -> Callsign {
        self.own_callsign
    }

    pub fn stop(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    /// Runs the main routing loop until `stop()` is called. Blocking
    /// socket reads are bounded by each handler's own short timeout, so
    /// this loop always returns to the clock tick within ~100ms.
    pub fn run(&mut self) {
        info!("starting the gateway routing loop");
        self.hosts.update_hosts().ok();

        while !self.exit.load(Ordering::SeqCst) {
            self.poll_repeaters();
            self.poll_reflectors();
            self.clock(TICK_MS);
            thread::sleep(Duration::from_millis(TICK_MS));
        }
        info!("stopping the gateway routing loop");
    }

    fn clock(&mut self, ms: u64) {
        self.hosts.clock(ms);
        if let Some(ircddb) = &self.ircddb {
            ircddb.clock(ms);
            self.drain_ircddb_replies();
        }
        for module in self.modules.iter_mut() {
            module.lookup_timer.clock(ms);
            if let Some(active) = module.active.as_mut() {
                active.link.clock(ms);
                if active.link.is_closed() {
                    let module_letter = active.link.local_module;
                    for (protocol, pool) in self.pools.iter_mut() {
                        if *protocol == active.protocol {
                            pool.release(active.port);
                        }
                    }
                    self.stats.record(Stat::LinkFailed(module_letter));
                    module.active = None;
                }
            }
        }
    }

    fn drain_ircddb_replies(&mut self) {
        let Some(ircddb) = &self.ircddb else { return };
        while let Some(reply) = ircddb.get_reply_message() {
            if let crate::ircddb::Reply::Gateway(gw) = reply {
                if let Ok(addr) = format!("{}:30001", gw.address).parse::<SocketAddr>() {
                    self.cache.insert(
                        Callsign::with_module(&gw.call, b'G'),
                        GatewayRecord {
                            protocol: ReflectorProtocol::DExtra,
                            address: addr,
                            locked: false,
                        },
                    );
                }
            }
        }
    }

    /// Reads each repeater's local socket, forwarding voice frames to
    /// the active reflector link (if any) and feeding slow-data into the
    /// module's sentence collectors for an eventual APRS upload.
    fn poll_repeaters(&mut self) {
        for module in self.modules.iter_mut() {
            match module.local.read() {
                Ok(Kind::Header) => {
                    if let Some((stream_id, header)) = module.local.read_header() {
                        self.stats.record(Stat::HeaderReceived);
                        module.demux.sync();
                        module.collector.sync();
                        if let Some(active) = module.active.as_mut() {
                            active.link.on_activity();
                        }
                        forward_header(&mut self.pools, module, stream_id, &header);
                    }
                }
                Ok(Kind::Ambe) => {
                    if let Some((stream_id, frame)) = module.local.read_data() {
                        self.stats.record(Stat::AmbeFrameReceived);
                        if let Some(active) = module.active.as_mut() {
                            active.link.on_activity();
                        }
                        route_slow_data(module, &frame, &mut self.aprs, &mut self.stats);
                        forward_ambe(&mut self.pools, module, stream_id, &frame);
                    }
                }
                Ok(Kind::CrcError) => self.stats.record(Stat::CrcFailure),
                Ok(_) | Err(_) => {}
            }

            maybe_link_reflector(module, &self.cache, &self.ircddb, &mut self.pools, &mut self.stats);
        }
    }

    /// Reads every reflector handler pool, forwarding whatever each
    /// currently-linked module's active link produced back to the
    /// repeater, and sending keep-alive polls on schedule.
    fn poll_reflectors(&mut self) {
        for (protocol, pool) in self.pools.iter_mut() {
            if let Ok(Some((port, kind))) = pool.read() {
                dispatch_reflector_event(&mut self.modules, *protocol, pool, port, kind, &mut self.stats);
            }
        }

        for module in self.modules.iter_mut() {
            if let Some(active) = module.active.as_mut() {
                if active.link.should_poll() {
                    for (protocol, pool) in self.pools.iter_mut() {
                        if *protocol == active.protocol {
                            if let Some(handler) = pool.get_mut(active.port) {
                                let _ = handler.write_poll(active.link.remote_call);
                            }
                        }
                    }
                }
            }
        }
    }
}

type OpenerFn = fn(&str, u16) -> Result<Box<dyn ReflectorHandler + Send>, GatewayError>;

fn open_dextra(addr: &str, port: u16) -> Result<Box<dyn ReflectorHandler + Send>, GatewayError> {
    DExtraHandler::open(addr, port).map(|h| Box::new(h) as Box<dyn ReflectorHandler + Send>)
}

fn open_dcs(addr: &str, port: u16) -> Result<Box<dyn ReflectorHandler + Send>, GatewayError> {
    DcsHandler::open(addr, port).map(|h| Box::new(h) as Box<dyn ReflectorHandler + Send>)
}

fn open_dplus(addr: &str, port: u16) -> Result<Box<dyn ReflectorHandler + Send>, GatewayError> {
    DPlusHandler::open(addr, port).map(|h| Box::new(h) as Box<dyn ReflectorHandler + Send>)
}

fn forward_header(pools: &mut [(ReflectorProtocol, HandlerPool)], module: &ModuleRoute, stream_id: u16, header: &crate::frame::Header) {
    let Some(active) = module.active.as_ref() else { return };
    for (protocol, pool) in pools.iter_mut() {
        if *protocol == active.protocol {
            if let Some(handler) = pool.get_mut(active.port) {
                let _ = handler.write_header(stream_id, header);
            }
        }
    }
}

fn forward_ambe(pools: &mut [(ReflectorProtocol, HandlerPool)], module: &ModuleRoute, stream_id: u16, frame: &crate::frame::AmbeFrame) {
    let Some(active) = module.active.as_ref() else { return };
    for (protocol, pool) in pools.iter_mut() {
        if *protocol == active.protocol {
            if let Some(handler) = pool.get_mut(active.port) {
                let _ = handler.write_data(stream_id, frame);
            }
        }
    }
}

/// Descrambles a voice frame's slow-data tail into the module's
/// collectors and forwards any completed sentence to APRS-IS.
fn route_slow_data(module: &mut ModuleRoute, frame: &crate::frame::AmbeFrame, aprs: &mut Option<AprsClient>, stats: &mut Stats) {
    if frame.is_sync() {
        module.demux.sync();
    }
    match module.demux.push(frame.slow_data) {
        Ok(Some((data_type, payload))) => {
            if data_type == SLOWDATA_TYPE_TEXT {
                for byte in payload {
                    if module.collector.write_data(SLOWDATA_TYPE_TEXT, byte) {
                        if let Some(line) = module.collector.get_data(SLOWDATA_TYPE_TEXT) {
                            match aprs {
                                Some(client) if client.is_connected() => {
                                    client.write(&line);
                                    stats.record(Stat::AprsLineQueued);
                                }
                                _ => stats.record(Stat::AprsLineDropped),
                            }
                        }
                    }
                }
            }
        }
        Ok(None) => {}
        Err(_) => stats.record(Stat::SlowDataMalformed),
    }
}

/// Establishes a reflector link for `module` if it is configured with a
/// target reflector, not already linked, and the cooldown timer allows
/// another lookup attempt.
fn maybe_link_reflector(
    module: &mut ModuleRoute,
    cache: &GatewayCache,
    ircddb: &Option<Arc<IrcDdbClient>>,
    pools: &mut [(ReflectorProtocol, HandlerPool)],
    stats: &mut Stats,
) {
    if module.active.is_some() {
        return;
    }
    let Some(reflector) = module.config.reflector.as_ref() else { return };
    if !module.lookup_timer.is_running() {
        module.lookup_timer.start();
    } else if !module.lookup_timer.has_expired() {
        return;
    }
    module.lookup_timer.start();

    let target = Callsign::with_module(reflector, b'G');
    let record = match cache.find(&target) {
        Some(record) => record,
        None => {
            if let Some(client) = ircddb {
                client.find_gateway(reflector);
            }
            return;
        }
    };

    for (protocol, pool) in pools.iter_mut() {
        if *protocol == record.protocol {
            if let Ok(port) = pool.acquire() {
                if let Some(handler) = pool.get_mut(port) {
                    if handler
                        .write_connect(
                            Callsign::with_module(&module.config.callsign, module.config.band),
                            target,
                            record.address,
                            Direction::Bi,
                        )
                        .is_ok()
                    {
                        let mut link = ReflectorLink::new(module.config.band, target, record.address, record.protocol, Direction::Bi, KEEPALIVE_MS);
                        link.state = crate::reflector::LinkState::WaitAck;
                        module.active = Some(ActiveLink { protocol: record.protocol, port, link });
                        stats.record(Stat::LinkEstablished(module.config.band));
                    }
                }
            }
            return;
        }
    }
}

fn find_module_by_port(modules: &mut [ModuleRoute], protocol: ReflectorProtocol, port: u16) -> Option<&mut ModuleRoute> {
    modules.iter_mut().find(|m| matches!(&m.active, Some(a) if a.protocol == protocol && a.port == port))
}

fn dispatch_reflector_event(modules: &mut [ModuleRoute], protocol: ReflectorProtocol, pool: &mut HandlerPool, port: u16, kind: Kind, stats: &mut Stats) {
    let Some(module) = find_module_by_port(modules, protocol, port) else { return };
    let Some(handler) = pool.get_mut(port) else { return };
    match kind {
        Kind::ConnectAck => {
            if let (Some(ack), Some(active)) = (handler.read_ack(), module.active.as_mut()) {
                active.link.on_ack(ack);
            }
        }
        Kind::Header => {
            if let (Some((stream_id, header)), Some(active)) = (handler.read_header(), module.active.as_mut()) {
                active.link.on_activity();
                let _ = module.local.write_header(stream_id, &header);
            }
        }
        Kind::Ambe => {
            if let (Some((stream_id, frame)), Some(active)) = (handler.read_data(), module.active.as_mut()) {
                active.link.on_activity();
                let _ = module.local.write_data(stream_id, &frame);
            }
        }
        Kind::Disconnect => {
            stats.record(Stat::LinkFailed(module.config.band));
            module.active = None;
        }
        Kind::CrcError => {
            stats.record(Stat::CrcFailure);
        }
        Kind::None | Kind::Poll | Kind::Connect => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AprsConfig, GatewayConfig, GatewayType, ReflectorFamilyConfig, ReflectorReconnect, RepeaterProtocol};

    fn test_config() -> Config {
        Config {
            gateway: GatewayConfig {
                callsign: "G4KLX".to_string(),
                address: "127.0.0.1".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                gateway_type: GatewayType::Repeater,
                language: "en".to_string(),
            },
            repeaters: vec![RepeaterConfig {
                callsign: "G4KLX".to_string(),
                band: b'B',
                address: "127.0.0.1".to_string(),
                port: 0,
                protocol: RepeaterProtocol::Icom,
                reflector: None,
                reflector_at_startup: false,
                reflector_reconnect: ReflectorReconnect::Never,
                frequency_mhz: 439.0,
                offset_mhz: -7.6,
                range_km: 32.0,
                latitude: 0.0,
                longitude: 0.0,
                agl_meters: 10.0,
                gps: None,
            }],
            ircddb: vec![],
            aprs: AprsConfig { enabled: false, ..AprsConfig::default() },
            dextra: ReflectorFamilyConfig {
                protocol: ReflectorProtocol::DExtra,
                enabled: true,
                hostfile_url: String::new(),
                max_dongles: 3,
            },
            dcs: ReflectorFamilyConfig {
                protocol: ReflectorProtocol::Dcs,
                enabled: false,
                hostfile_url: String::new(),
                max_dongles: 3,
            },
            dplus: ReflectorFamilyConfig {
                protocol: ReflectorProtocol::DPlus,
                enabled: false,
                hostfile_url: String::new(),
                max_dongles: 3,
            },
            xlx: ReflectorFamilyConfig {
                protocol: ReflectorProtocol::Dcs,
                enabled: false,
                hostfile_url: String::new(),
                max_dongles: 3,
            },
        }
    }

    #[test]
    fn builds_one_module_route_per_repeater() {
        let dir = std::env::temp_dir().join(format!("gatewaylib-gateway-test-{}", std::process::id()));
        let gateway = Gateway::new(&test_config(), dir.join("internet"), dir.join("custom")).unwrap();
        assert_eq!(gateway.modules.len(), 1);
        assert_eq!(gateway.pools.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stop_sets_the_exit_flag() {
        let dir = std::env::temp_dir().join(format!("gatewaylib-gateway-test2-{}", std::process::id()));
        let gateway = Gateway::new(&test_config(), dir.join("internet"), dir.join("custom")).unwrap();
        let flag = gateway.exit_flag();
        assert!(!flag.load(Ordering::SeqCst));
        gateway.stop();
        assert!(flag.load(Ordering::SeqCst));
        std::fs::remove_dir_all(&dir).ok();
    }
}
