//! Configuration surface (`spec.md` §6).
//!
//! These structs are "consumed from an external loader" — `spec.md`
//! §1 places the file-format parsing itself outside the core. This
//! module only defines the typed shape and `Config::validate()`, the
//! boundary where a missing/out-of-range mandatory field becomes
//! `GatewayError::ConfigInvalid` (`spec.md` §7) and the process refuses
//! to start (exit code 1).

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayType {
    Repeater,
    Hotspot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterProtocol {
    Hb,
    Icom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorReconnect {
    Never,
    Fixed,
    Minutes(u32),
}

/// `spec.md` §9: the `#ifdef USE_GPSD` branch becomes a runtime
/// variant instead of a compile-time one. `Gpsd`'s daemon-communication
/// implementation is optional and only constructed when this variant
/// is selected at config time.
#[derive(Debug, Clone)]
pub enum GpsSource {
    Fixed {
        latitude: f64,
        longitude: f64,
        agl_meters: f64,
    },
    Gpsd {
        address: String,
        port: u16,
    },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub callsign: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub gateway_type: GatewayType,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct RepeaterConfig {
    pub callsign: String,
    pub band: u8,
    pub address: String,
    pub port: u16,
    pub protocol: RepeaterProtocol,
    pub reflector: Option<String>,
    pub reflector_at_startup: bool,
    pub reflector_reconnect: ReflectorReconnect,
    pub frequency_mhz: f64,
    pub offset_mhz: f64,
    pub range_km: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub agl_meters: f64,
    pub gps: Option<GpsSource>,
}

#[derive(Debug, Clone)]
pub struct IrcDdbConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl Default for IrcDdbConfig {
    fn default() -> Self {
        IrcDdbConfig {
            hostname: "ircv4.openquad.net".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AprsConfig {
    pub enabled: bool,
    pub hostname: String,
    pub port: u16,
    pub password: String,
}

impl Default for AprsConfig {
    fn default() -> Self {
        AprsConfig {
            enabled: false,
            hostname: "rotate.aprs2.net".to_string(),
            port: 14580,
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorProtocol {
    DExtra,
    Dcs,
    DPlus,
}

#[derive(Debug, Clone)]
pub struct ReflectorFamilyConfig {
    pub protocol: ReflectorProtocol,
    pub enabled: bool,
    pub hostfile_url: String,
    pub max_dongles: u8,
}

impl ReflectorFamilyConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.enabled && (self.max_dongles == 0 || self.max_dongles > 5) {
            return Err(GatewayError::ConfigInvalid(format!(
                "{:?} maxDongles must be 1..5, got {}",
                self.protocol, self.max_dongles
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub repeaters: Vec<RepeaterConfig>,
    pub ircddb: Vec<IrcDdbConfig>,
    pub aprs: AprsConfig,
    pub dextra: ReflectorFamilyConfig,
    pub dcs: ReflectorFamilyConfig,
    pub dplus: ReflectorFamilyConfig,
    pub xlx: ReflectorFamilyConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.gateway.callsign.trim().is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "gateway.callsign is required".to_string(),
            ));
        }
        if self.repeaters.is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "at least one repeater must be configured".to_string(),
            ));
        }
        for repeater in &self.repeaters {
            if !repeater.band.is_ascii_uppercase() {
                return Err(GatewayError::ConfigInvalid(format!(
                    "repeater {} has an invalid band letter",
                    repeater.callsign
                )));
            }
        }
        if self.ircddb.iter().any(|c| c.hostname.trim().is_empty()) {
            return Err(GatewayError::ConfigInvalid(
                "ircddb hostname must not be empty".to_string(),
            ));
        }
        for family in [&self.dextra, &self.dcs, &self.dplus, &self.xlx] {
            family.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            gateway: GatewayConfig {
                callsign: "G4KLX".to_string(),
                address: "0.0.0.0".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                gateway_type: GatewayType::Repeater,
                language: "en".to_string(),
            },
            repeaters: vec![RepeaterConfig {
                callsign: "G4KLX".to_string(),
                band: b'B',
                address: "127.0.0.1".to_string(),
                port: 20010,
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
            ircddb: vec![IrcDdbConfig::default()],
            aprs: AprsConfig::default(),
            dextra: ReflectorFamilyConfig {
                protocol: ReflectorProtocol::DExtra,
                enabled: true,
                hostfile_url: "http://www.pistar.uk/downloads/DExtra_Hosts.txt".to_string(),
                max_dongles: 3,
            },
            dcs: ReflectorFamilyConfig {
                protocol: ReflectorProtocol::Dcs,
                enabled: true,
                hostfile_url: "http://www.pistar.uk/downloads/DCS_Hosts.txt".to_string(),
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
    fn minimal_config_is_valid() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn empty_callsign_rejected() {
        let mut cfg = minimal_config();
        cfg.gateway.callsign = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_dongles_out_of_range_rejected() {
        let mut cfg = minimal_config();
        cfg.dextra.max_dongles = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn no_repeaters_rejected() {
        let mut cfg = minimal_config();
        cfg.repeaters.clear();
        assert!(cfg.validate().is_err());
    }
}
