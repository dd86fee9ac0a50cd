//! Thin entry point: argument parsing, config-file loading, logger
//! initialization, and exit-code mapping (`spec.md` §6). No protocol
//! logic lives here — everything below this file is an external
//! collaborator around `gatewaylib::gateway::Gateway`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gatewaylib::config::{
    AprsConfig, Config, GatewayConfig, GatewayType, GpsSource, IrcDdbConfig, ReflectorFamilyConfig,
    ReflectorProtocol, ReflectorReconnect, RepeaterConfig, RepeaterProtocol,
};
use gatewaylib::error::{exit_code, GatewayError};
use gatewaylib::gateway::Gateway;
use gatewaylib::logging::GatewayLogger;

fn set_panic_hook() {
    let old_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log::error!("panic: {info}");
        old_hook(info);
    }));
}

fn main() -> ExitCode {
    set_panic_hook();

    let args: Vec<String> = std::env::args().collect();
    let Some(config_path) = args.get(1) else {
        eprintln!("usage: {} <config-file> [--hosts-dir <dir>] [--log <file>]", args[0]);
        return ExitCode::from(exit_code::CONFIG as u8);
    };

    let mut log_file: Option<PathBuf> = None;
    let mut hosts_dir = PathBuf::from("/var/lib/dstar-gatewayd");
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--log" => {
                i += 1;
                log_file = args.get(i).map(PathBuf::from);
            }
            "--hosts-dir" => {
                i += 1;
                if let Some(dir) = args.get(i) {
                    hosts_dir = PathBuf::from(dir);
                }
            }
            _ => {}
        }
        i += 1;
    }

    match log_file {
        Some(path) => {
            if GatewayLogger::init_file(&path, log::LevelFilter::Info).is_err() {
                GatewayLogger::init_stderr(log::LevelFilter::Info);
            }
        }
        None => GatewayLogger::init_stderr(log::LevelFilter::Info),
    }

    let config = match load_config(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(exit_code::CONFIG as u8);
        }
    };

    if let Err(e) = config.validate() {
        log::error!("{e}");
        return ExitCode::from(exit_code::CONFIG as u8);
    }

    let mut gateway = match Gateway::new(&config, hosts_dir.join("internet"), hosts_dir.join("custom")) {
        Ok(gateway) => gateway,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(exit_code::STARTUP as u8);
        }
    };

    // No signal-handling crate in the teacher's dependency stack (and
    // none elsewhere in the retrieval pack), so there is no SIGINT/SIGTERM
    // hook here: `gateway.stop()` is reachable through `exit_flag()` for an
    // embedder, but a bare `dstar-gatewayd` process relies on the
    // default terminate-on-signal behavior. See DESIGN.md.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| gateway.run()));

    match result {
        Ok(()) => ExitCode::from(exit_code::CLEAN as u8),
        Err(_) => ExitCode::from(exit_code::CRASH as u8),
    }
}

/// Minimal line-oriented `key = value` reader (`spec.md` §1 keeps file
/// parsing out of the core; no serde/toml in the teacher's stack).
/// Blank lines and lines starting with `#` are ignored. Repeated
/// sections use a numeric index, e.g. `repeater.0.callsign`,
/// `repeater.1.callsign`, `ircddb.0.hostname`.
fn load_config(path: &Path) -> Result<Config, GatewayError> {
    let text = fs::read_to_string(path)
        .map_err(|e| GatewayError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;

    let mut values: HashMap<String, String> = HashMap::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(GatewayError::ConfigInvalid(format!(
                "{}:{}: expected `key = value`",
                path.display(),
                lineno + 1
            )));
        };
        values.insert(key.trim().to_string(), value.trim().to_string());
    }

    build_config(&values)
}

fn get<'a>(values: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    values.get(key).map(|s| s.as_str())
}

fn get_str(values: &HashMap<String, String>, key: &str, default: &str) -> String {
    get(values, key).unwrap_or(default).to_string()
}

fn get_bool(values: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match get(values, key) {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

fn get_num<T: std::str::FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> T {
    get(values, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn build_config(values: &HashMap<String, String>) -> Result<Config, GatewayError> {
    let gateway = GatewayConfig {
        callsign: get_str(values, "gateway.callsign", ""),
        address: get_str(values, "gateway.address", "0.0.0.0"),
        latitude: get_num(values, "gateway.latitude", 0.0),
        longitude: get_num(values, "gateway.longitude", 0.0),
        gateway_type: match get(values, "gateway.type") {
            Some("hotspot") => GatewayType::Hotspot,
            _ => GatewayType::Repeater,
        },
        language: get_str(values, "gateway.language", "en_US"),
    };

    let mut repeaters = Vec::new();
    let mut i = 0;
    while values.contains_key(&format!("repeater.{i}.callsign")) {
        let prefix = format!("repeater.{i}");
        let band = get_str(values, &format!("{prefix}.band"), "A")
            .bytes()
            .next()
            .unwrap_or(b'A')
            .to_ascii_uppercase();
        let reflector_reconnect = match get(values, &format!("{prefix}.reflectorReconnect")).unwrap_or("never") {
            "fixed" => ReflectorReconnect::Fixed,
            minutes if minutes.parse::<u32>().is_ok() => ReflectorReconnect::Minutes(minutes.parse().unwrap()),
            _ => ReflectorReconnect::Never,
        };
        let gps = if get_bool(values, &format!("{prefix}.gpsd.enabled"), false) {
            Some(GpsSource::Gpsd {
                address: get_str(values, &format!("{prefix}.gpsd.address"), "127.0.0.1"),
                port: get_num(values, &format!("{prefix}.gpsd.port"), 2947u16),
            })
        } else {
            None
        };
        repeaters.push(RepeaterConfig {
            callsign: get_str(values, &format!("{prefix}.callsign"), ""),
            band,
            address: get_str(values, &format!("{prefix}.address"), "127.0.0.1"),
            port: get_num(values, &format!("{prefix}.port"), 20011u16),
            protocol: match get(values, &format!("{prefix}.type")).unwrap_or("icom") {
                "hb" => RepeaterProtocol::Hb,
                _ => RepeaterProtocol::Icom,
            },
            reflector: get(values, &format!("{prefix}.reflector")).map(|s| s.to_string()),
            reflector_at_startup: get_bool(values, &format!("{prefix}.reflectorAtStartup"), false),
            reflector_reconnect,
            frequency_mhz: get_num(values, &format!("{prefix}.frequency"), 439.0),
            offset_mhz: get_num(values, &format!("{prefix}.offset"), -7.6),
            range_km: get_num(values, &format!("{prefix}.range"), 32.0),
            latitude: get_num(values, &format!("{prefix}.latitude"), gateway.latitude),
            longitude: get_num(values, &format!("{prefix}.longitude"), gateway.longitude),
            agl_meters: get_num(values, &format!("{prefix}.agl"), 10.0),
            gps,
        });
        i += 1;
    }

    let mut ircddb = Vec::new();
    let mut j = 0;
    while values.contains_key(&format!("ircddb.{j}.hostname")) {
        let prefix = format!("ircddb.{j}");
        ircddb.push(IrcDdbConfig {
            hostname: get_str(values, &format!("{prefix}.hostname"), &IrcDdbConfig::default().hostname),
            username: get_str(values, &format!("{prefix}.username"), ""),
            password: get_str(values, &format!("{prefix}.password"), ""),
        });
        j += 1;
    }
    if ircddb.is_empty() {
        ircddb.push(IrcDdbConfig::default());
    }

    let aprs = AprsConfig {
        enabled: get_bool(values, "aprs.enabled", false),
        hostname: get_str(values, "aprs.hostname", &AprsConfig::default().hostname),
        port: get_num(values, "aprs.port", AprsConfig::default().port),
        password: get_str(values, "aprs.password", ""),
    };

    let family = |name: &str, protocol: ReflectorProtocol| ReflectorFamilyConfig {
        protocol,
        enabled: get_bool(values, &format!("{name}.enabled"), false),
        hostfile_url: get_str(values, &format!("{name}.hostfileUrl"), ""),
        max_dongles: get_num(values, &format!("{name}.maxDongles"), 3u8),
    };

    Ok(Config {
        gateway,
        repeaters,
        ircddb,
        aprs,
        dextra: family("dextra", ReflectorProtocol::DExtra),
        dcs: family("dcs", ReflectorProtocol::Dcs),
        dplus: family("dplus", ReflectorProtocol::DPlus),
        xlx: family("xlx", ReflectorProtocol::Dcs),
    })
}
