//! ircDDB directory client (`spec.md` §4.7), grounded on
//! `original_source/IRCDDBApp.cpp`: an IRC client that elects a server
//! peer, absorbs its `UPDATE` stream into user/repeater tables, and
//! answers asynchronous `FIND` queries through a reply queue.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::NaiveDateTime;
use log::{debug, info, warn};

use crate::callsign::Callsign;
use crate::clock::Timer;
use crate::config::IrcDdbConfig;

const IRC_PORT: u16 = 6667;
const CHOOSE_SERVER_TIMEOUT_MS: u64 = 200_000;
const SENDLIST_TIMEOUT_MS: u64 = 900_000;
const QTH_QRG_COALESCE_MS: u64 = 5_000;
const WATCHDOG_COALESCE_MS: u64 = 60_000;

/// `spec.md` §4.7's 0..10 connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    WaitNetwork = 0,
    ConnectDb = 1,
    ChooseServer = 2,
    NextTable = 3,
    SendList = 4,
    AwaitSendlist = 5,
    InitComplete = 6,
    Standby = 7,
    Disconnect = 10,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::WaitNetwork,
            1 => State::ConnectDb,
            2 => State::ChooseServer,
            3 => State::NextTable,
            4 => State::SendList,
            5 => State::AwaitSendlist,
            6 => State::InitComplete,
            7 => State::Standby,
            _ => State::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct UserRecord {
    host: String,
    op: bool,
    usn: u32,
}

#[derive(Debug, Clone)]
struct RepeaterRecord {
    zone_call: String,
    last_changed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserReply {
    pub call: String,
    pub repeater: String,
    pub gateway: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterReply {
    pub area_call: String,
    pub zone_call: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReply {
    pub call: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    User(UserReply),
    Repeater(RepeaterReply),
    Gateway(GatewayReply),
}

/// All state touched by both the public handle and the background
/// network thread; kept behind an `Arc` so both sides share one
/// instance instead of the instance methods needing a `self` that
/// outlives the thread.
struct Shared {
    state: AtomicU8,
    own_nick: Mutex<String>,
    best_server: String,
    current_server: Mutex<Option<String>>,
    update_channel: String,
    users: Mutex<HashMap<String, UserRecord>>,
    repeaters: Mutex<HashMap<String, RepeaterRecord>>,
    max_time: Mutex<i64>,
    init_ready: Mutex<bool>,
    reply_queue: Mutex<VecDeque<Reply>>,
    send_queue: Mutex<VecDeque<String>>,
    qth: Mutex<HashMap<String, String>>,
    url: Mutex<HashMap<String, String>>,
    qrg: Mutex<HashMap<String, String>>,
    watchdog: Mutex<HashMap<String, String>>,
    exit: std::sync::atomic::AtomicBool,
}

/// D-Star epoch used as the initial high-water mark (February 2000,
/// matching the reference client's `950000000`).
const INITIAL_MAX_TIME: i64 = 950_000_000;

pub struct IrcDdbClient {
    shared: Arc<Shared>,
    choose_server_timer: Mutex<Timer>,
    sendlist_timer: Mutex<Timer>,
    qth_qrg_timer: Mutex<Timer>,
    watchdog_timer: Mutex<Timer>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IrcDdbClient {
    pub fn new(update_channel: &str, best_server: &str) -> IrcDdbClient {
        IrcDdbClient {
            shared: Arc::new(Shared {
                state: AtomicU8::new(State::WaitNetwork as u8),
                own_nick: Mutex::new(String::new()),
                best_server: best_server.to_string(),
                current_server: Mutex::new(None),
                update_channel: update_channel.to_string(),
                users: Mutex::new(HashMap::new()),
                repeaters: Mutex::new(HashMap::new()),
                max_time: Mutex::new(INITIAL_MAX_TIME),
                init_ready: Mutex::new(false),
                reply_queue: Mutex::new(VecDeque::new()),
                send_queue: Mutex::new(VecDeque::new()),
                qth: Mutex::new(HashMap::new()),
                url: Mutex::new(HashMap::new()),
                qrg: Mutex::new(HashMap::new()),
                watchdog: Mutex::new(HashMap::new()),
                exit: std::sync::atomic::AtomicBool::new(false),
            }),
            choose_server_timer: Mutex::new(Timer::with_timeout_ms(CHOOSE_SERVER_TIMEOUT_MS)),
            sendlist_timer: Mutex::new(Timer::with_timeout_ms(SENDLIST_TIMEOUT_MS)),
            qth_qrg_timer: Mutex::new(Timer::with_timeout_ms(QTH_QRG_COALESCE_MS)),
            watchdog_timer: Mutex::new(Timer::with_timeout_ms(WATCHDOG_COALESCE_MS)),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    /// Connects in a background thread and drives the state machine's
    /// network side; the caller still has to call `clock(ms)` for the
    /// timer-driven half (server re-election cooldown, SENDLIST
    /// timeout, staged-metadata coalescing).
    pub fn start(&self, own_callsign: &str, cfg: &IrcDdbConfig) {
        let nick = derive_nick(own_callsign);
        *self.shared.own_nick.lock().expect("nick lock poisoned") = nick.clone();
        self.set_state(State::ConnectDb);

        let shared = Arc::clone(&self.shared);
        let hostname = cfg.hostname.clone();
        let password = cfg.password.clone();
        let handle = thread::spawn(move || run(shared, hostname, nick, password));
        *self.handle.lock().expect("handle lock poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().expect("handle lock poisoned").take() {
            handle.join().ok();
        }
        self.set_state(State::Disconnect);
    }

    /// Advances the timer-driven half of the state machine: server
    /// re-election cooldown, SENDLIST timeout, and QTH/QRG/watchdog
    /// coalescing windows.
    pub fn clock(&self, ms: u64) {
        let mut choose_timer = self.choose_server_timer.lock().expect("timer lock poisoned");
        choose_timer.clock(ms);
        if self.state() == State::ChooseServer {
            if elect_server(&self.shared) {
                self.set_state(State::NextTable);
            } else if choose_timer.has_expired() {
                warn!("no op user with 's-' prefix found, giving up this connection cycle");
                self.set_state(State::Disconnect);
            }
        }
        drop(choose_timer);

        let mut sendlist_timer = self.sendlist_timer.lock().expect("timer lock poisoned");
        sendlist_timer.clock(ms);
        if self.state() == State::AwaitSendlist && sendlist_timer.has_expired() {
            warn!("SENDLIST timed out");
            self.set_state(State::Disconnect);
        }
        drop(sendlist_timer);

        let mut qth_timer = self.qth_qrg_timer.lock().expect("timer lock poisoned");
        qth_timer.clock(ms);
        if qth_timer.has_expired() {
            qth_timer.start();
            flush_qth_qrg(&self.shared);
        }
        drop(qth_timer);

        let mut wd_timer = self.watchdog_timer.lock().expect("timer lock poisoned");
        wd_timer.clock(ms);
        if wd_timer.has_expired() {
            wd_timer.start();
            flush_watchdog(&self.shared);
        }
    }

    pub fn get_connection_state(&self) -> u8 {
        self.shared.state.load(Ordering::SeqCst)
    }

    pub fn get_reply_message(&self) -> Option<Reply> {
        self.shared.reply_queue.lock().expect("reply queue poisoned").pop_front()
    }

    /// Stages a QTH (latitude/longitude/description) update; flushed
    /// at most once per 5 s coalescing window.
    pub fn rptr_qth(&self, callsign: &str, latitude: f64, longitude: f64, desc1: &str, desc2: &str, info_url: &str) {
        let cs = callsign.replace(' ', "_");
        let value = format!("{cs} {latitude:+09.5} {longitude:+010.5} {desc1} {desc2}");
        self.shared.qth.lock().expect("qth lock poisoned").insert(cs.clone(), value);
        if !info_url.is_empty() {
            self.shared.url.lock().expect("url lock poisoned").insert(cs, format!("{callsign} {info_url}"));
        }
    }

    pub fn rptr_qrg(&self, callsign: &str, frequency_mhz: f64, offset_mhz: f64, range_km: f64, agl_meters: f64) {
        let cs = callsign.replace(' ', "_");
        let value = format!("{cs} {frequency_mhz:.5} {offset_mhz:+.5} {range_km:.2} {agl_meters:.2}");
        self.shared.qrg.lock().expect("qrg lock poisoned").insert(cs, value);
    }

    /// Stages a watchdog heartbeat; flushed at most once per 60 s.
    pub fn kick_watchdog(&self, callsign: &str, text: &str) {
        let cs = callsign.replace(' ', "_");
        self.shared
            .watchdog
            .lock()
            .expect("watchdog lock poisoned")
            .insert(cs.clone(), format!("{cs} {text}"));
    }

    pub fn send_heard(&self, my: &str, my_ext: &str, your: &str, rpt1: &str, rpt2: &str, flags: [u8; 3]) {
        let server = self.shared.current_server.lock().expect("server lock poisoned").clone();
        let Some(server) = server else { return };
        let line = format!(
            "PRIVMSG {server} :IRCDDB UPDATE: {} {} {} {} {} {:02X}{:02X}{:02X}",
            my.replace(' ', "_"),
            my_ext.replace(' ', "_"),
            your.replace(' ', "_"),
            rpt1.replace(' ', "_"),
            rpt2.replace(' ', "_"),
            flags[0],
            flags[1],
            flags[2]
        );
        self.shared.send_queue.lock().expect("send queue poisoned").push_back(line);
    }

    /// Resolves a reflector/gateway via DNS bypass when the prefix
    /// matches one of the known reflector families, otherwise queries
    /// the ircDDB database.
    pub fn find_gateway(&self, gw_call: &str) {
        if let Some(host) = reflector_dns_name(gw_call) {
            self.shared.reply_queue.lock().expect("reply queue poisoned").push_back(Reply::Gateway(GatewayReply {
                call: gw_call.to_string(),
                address: host,
            }));
            return;
        }
        self.issue_find(gw_call, "IDRT_GATEWAY");
    }

    pub fn find_user(&self, usr_call: &str) {
        self.issue_find(usr_call, "IDRT_USER");
    }

    /// A pure local lookup against the repeater table absorbed from
    /// `UPDATE` traffic, not a query issued to the elected server:
    /// the original client (`IRCDDBApp.cpp`'s `findRepeater`) answers
    /// this from its in-memory `m_rptrMap` synchronously.
    pub fn find_repeater(&self, rptr_call: &str) {
        let key = rptr_call.split_whitespace().collect::<Vec<_>>().join("_");
        let area_call = key.replace('_', " ");
        let record = self.shared.repeaters.lock().expect("repeater map poisoned").get(&key).cloned();
        let reply = match record {
            Some(r) => RepeaterReply {
                area_call,
                zone_call: format_padded_call(&r.zone_call),
                address: ip_address_for(&self.shared, &r.zone_call),
            },
            None => RepeaterReply {
                area_call,
                zone_call: String::new(),
                address: String::new(),
            },
        };
        self.shared.reply_queue.lock().expect("reply queue poisoned").push_back(Reply::Repeater(reply));
    }

    /// Issues an async `FIND` query for `find_user`/`find_gateway`.
    /// `find_repeater` bypasses this entirely (see above): it never
    /// needs the server round-trip because the repeater table is
    /// already fully absorbed locally.
    fn issue_find(&self, call: &str, kind: &str) {
        let server = self.shared.current_server.lock().expect("server lock poisoned").clone();
        let ready = self.shared.state.load(Ordering::SeqCst) >= State::InitComplete as u8;
        if let (Some(server), true) = (server, ready) {
            let query = call.replace(' ', "_");
            self.shared.send_queue.lock().expect("send queue poisoned").push_back(format!("PRIVMSG {server} :FIND {query}"));
        } else {
            // Not connected: matches the reference client's immediate
            // empty-result reply rather than blocking the caller.
            let reply = match kind {
                "IDRT_USER" => Reply::User(UserReply {
                    call: call.to_string(),
                    repeater: String::new(),
                    gateway: String::new(),
                    address: String::new(),
                }),
                _ => Reply::Gateway(GatewayReply {
                    call: call.to_string(),
                    address: String::new(),
                }),
            };
            self.shared.reply_queue.lock().expect("reply queue poisoned").push_back(reply);
        }
    }
}

fn flush_qth_qrg(shared: &Shared) {
    let server = shared.current_server.lock().expect("server lock poisoned").clone();
    let Some(server) = server else { return };
    let mut send_queue = shared.send_queue.lock().expect("send queue poisoned");
    for (_, value) in shared.qth.lock().expect("qth lock poisoned").drain() {
        send_queue.push_back(format!("PRIVMSG {server} :IRCDDB RPTRQTH: {value}"));
    }
    for (_, value) in shared.url.lock().expect("url lock poisoned").drain() {
        send_queue.push_back(format!("PRIVMSG {server} :IRCDDB RPTRURL: {value}"));
    }
    for (_, value) in shared.qrg.lock().expect("qrg lock poisoned").drain() {
        send_queue.push_back(format!("PRIVMSG {server} :IRCDDB RPTRQRG: {value}"));
    }
}

fn flush_watchdog(shared: &Shared) {
    let server = shared.current_server.lock().expect("server lock poisoned").clone();
    let Some(server) = server else { return };
    let mut send_queue = shared.send_queue.lock().expect("send queue poisoned");
    for (_, value) in shared.watchdog.lock().expect("watchdog lock poisoned").drain() {
        send_queue.push_back(format!("PRIVMSG {server} :IRCDDB RPTRSW: {value}"));
    }
}

/// Server election (`spec.md` §4.7's "Server selection"): prefer an
/// exact `bestServer` match, then its 7-character prefix, then any
/// op'd `s-` user.
fn elect_server(shared: &Shared) -> bool {
    let users = shared.users.lock().expect("user map poisoned");
    let own_nick = shared.own_nick.lock().expect("nick lock poisoned").clone();
    let best = &shared.best_server;

    let pick = users
        .iter()
        .find(|(nick, u)| nick.starts_with("s-") && u.op && **nick != own_nick && *nick == best)
        .or_else(|| {
            if best.len() == 8 {
                users.iter().find(|(nick, u)| **nick == best[..7] && u.op && **nick != own_nick)
            } else {
                None
            }
        })
        .or_else(|| users.iter().find(|(nick, u)| nick.starts_with("s-") && u.op && **nick != own_nick));

    match pick {
        Some((nick, _)) => {
            *shared.current_server.lock().expect("server lock poisoned") = Some(nick.clone());
            true
        }
        None => false,
    }
}

fn user_join(shared: &Shared, nick: &str, host: &str) {
    let lnick = nick.to_ascii_lowercase();
    let mut users = shared.users.lock().expect("user map poisoned");
    let usn = calculate_usn(&users, &lnick);
    users.insert(lnick.clone(), UserRecord { host: host.to_string(), op: false, usn });
    drop(users);

    if *shared.init_ready.lock().expect("init ready poisoned") {
        if let Some(hyphen) = nick.find('-') {
            if (4..=6).contains(&hyphen) {
                let gateway_call = Callsign::with_module(&nick[..hyphen], b'G');
                shared.reply_queue.lock().expect("reply queue poisoned").push_back(Reply::Gateway(GatewayReply {
                    call: gateway_call.trimmed(),
                    address: host.to_string(),
                }));
            }
        }
    }
}

fn user_leave(shared: &Shared, nick: &str) {
    let lnick = nick.to_ascii_lowercase();
    let mut users = shared.users.lock().expect("user map poisoned");
    users.remove(&lnick);
    let own_nick = shared.own_nick.lock().expect("nick lock poisoned").clone();
    let am_op = users.get(&own_nick).map(|u| u.op).unwrap_or(false);
    let current = shared.current_server.lock().expect("server lock poisoned").clone();
    drop(users);

    if !am_op && current.as_deref() == Some(lnick.as_str()) {
        *shared.current_server.lock().expect("server lock poisoned") = None;
        shared.state.store(State::ChooseServer as u8, Ordering::SeqCst);
    }
}

fn user_chan_op(shared: &Shared, nick: &str, op: bool) {
    let lnick = nick.to_ascii_lowercase();
    if let Some(u) = shared.users.lock().expect("user map poisoned").get_mut(&lnick) {
        u.op = op;
    }
}

fn ip_address_for(shared: &Shared, zone_call: &str) -> String {
    let gw = zone_call.replace('_', " ").to_ascii_lowercase();
    let gw = gw.trim();
    let users = shared.users.lock().expect("user map poisoned");
    let mut best: Option<&UserRecord> = None;
    for j in 1..=4 {
        let key = format!("{gw}-{j}");
        if let Some(user) = users.get(&key) {
            if best.map(|u| user.usn >= u.usn).unwrap_or(true) {
                best = Some(user);
            }
        }
    }
    best.map(|u| u.host.clone()).unwrap_or_default()
}

/// Absorbs one `UPDATE <date> <time> <key> <value>` message from the
/// elected server. `spec.md` §4.7's "Update language" carries no
/// numeric table id on the wire: `<areaCall> <zoneCall>` (value ends in
/// the gateway module `G`) populates the repeater table, anything else
/// is a `<userCall> <repeaterCall>` update to the user→repeater
/// mapping. A leading literal `UPDATE` keyword is stripped when present
/// (the channel-broadcast form this client actually receives).
fn do_update(shared: &Shared, msg: &str) {
    let mut tokens: VecDeque<&str> = msg.split_whitespace().collect();
    let Some(mut tok) = tokens.pop_front() else { return };
    if tok == "UPDATE" {
        let Some(next) = tokens.pop_front() else { return };
        tok = next;
    }

    if !is_date(tok) {
        return;
    }
    let date = tok;
    let Some(time) = tokens.pop_front() else { return };
    if !is_time(time) {
        return;
    }
    let Some(dt) = parse_utc(date, time) else { return };

    let Some(key) = tokens.pop_front() else { return };
    if !is_db_key(key) {
        return;
    }
    let Some(value) = tokens.pop_front() else { return };
    if !is_db_key(value) {
        return;
    }

    {
        let mut max_time = shared.max_time.lock().expect("max time poisoned");
        if dt > *max_time {
            *max_time = dt;
        }
    }

    let init_ready = *shared.init_ready.lock().expect("init ready poisoned");
    let is_repeater_update = value.as_bytes().last() == Some(&b'G');

    if is_repeater_update {
        shared.repeaters.lock().expect("repeater map poisoned").insert(
            key.to_string(),
            RepeaterRecord {
                zone_call: value.to_string(),
                last_changed: dt,
            },
        );
        if init_ready {
            let area_call = key.replace('_', " ");
            let zone_call = format_padded_call(value);
            let address = ip_address_for(shared, value);
            shared.reply_queue.lock().expect("reply queue poisoned").push_back(Reply::Repeater(RepeaterReply {
                area_call,
                zone_call,
                address,
            }));
        }
    } else if init_ready {
        let user_call = key.replace('_', " ");
        let area_call = value.replace('_', " ");
        let (zone_call, address) = match shared.repeaters.lock().expect("repeater map poisoned").get(value) {
            Some(r) => (format_padded_call(&r.zone_call), ip_address_for(shared, &r.zone_call)),
            None => (String::new(), String::new()),
        };
        shared.reply_queue.lock().expect("reply queue poisoned").push_back(Reply::User(UserReply {
            call: user_call,
            repeater: area_call,
            gateway: zone_call,
            address,
        }));
    }
}

/// Expands a wire-form `base_M` call (base callsign, underscore,
/// single module letter) into the display form: the base padded to
/// 7 characters with spaces, followed by the module, the way
/// `Callsign::with_module` pads every other callsign in this crate.
fn format_padded_call(raw: &str) -> String {
    if raw.len() >= 2 {
        let module = raw.as_bytes()[raw.len() - 1];
        let base = &raw[..raw.len() - 2];
        Callsign::with_module(base, module).trimmed()
    } else {
        raw.replace('_', " ")
    }
}

fn calculate_usn(users: &HashMap<String, UserRecord>, nick: &str) -> u32 {
    let base = nick.rsplit_once('-').map(|(b, _)| b).unwrap_or(nick);
    let mut max_usn = 0;
    for i in 1..=4 {
        if let Some(u) = users.get(&format!("{base}-{i}")) {
            max_usn = max_usn.max(u.usn);
        }
    }
    max_usn + 1
}

fn derive_nick(own_callsign: &str) -> String {
    own_callsign.trim().to_ascii_lowercase().replace(' ', "")
}

fn is_date(s: &str) -> bool {
    s.len() == 10 && s.as_bytes()[4] == b'-' && s.as_bytes()[7] == b'-' && s.starts_with("20")
}

fn is_time(s: &str) -> bool {
    s.len() == 8 && s.as_bytes()[2] == b':' && s.as_bytes()[5] == b':'
}

fn is_db_key(s: &str) -> bool {
    !s.is_empty() && s.len() <= 8 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_utc(date: &str, time: &str) -> Option<i64> {
    let dt = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").ok()?;
    Some(dt.and_utc().timestamp())
}

/// `spec.md` §4.7's gateway lookup bypass for reflector prefixes.
fn reflector_dns_name(call: &str) -> Option<String> {
    let prefix = call.trim();
    for known in ["XRF", "REF", "DCS", "XLX"] {
        if prefix.starts_with(known) && prefix.len() >= 6 {
            let host = format!("{}.reflector.ircddb.net", &prefix[..6]);
            return Some(host);
        }
    }
    None
}

fn run(shared: Arc<Shared>, hostname: String, nick: String, _password: String) {
    info!("starting the ircDDB client thread");
    let stream = match TcpStream::connect((hostname.as_str(), IRC_PORT)) {
        Ok(s) => s,
        Err(e) => {
            warn!("ircDDB connect to {hostname} failed: {e}");
            return;
        }
    };
    stream.set_read_timeout(Some(Duration::from_millis(500))).ok();
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);

    let _ = writer.write_all(format!("NICK {nick}\r\n").as_bytes());
    let _ = writer.write_all(format!("USER {nick} 0 * :D-Star gateway\r\n").as_bytes());
    let _ = writer.write_all(format!("JOIN {}\r\n", shared.update_channel).as_bytes());

    while !shared.exit.load(Ordering::SeqCst) {
        {
            let mut queue = shared.send_queue.lock().expect("send queue poisoned");
            while let Some(line) = queue.pop_front() {
                debug!("ircDDB ==> {line}");
                if writer.write_all(format!("{line}\r\n").as_bytes()).is_err() {
                    warn!("ircDDB connection write failed");
                }
            }
        }

        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => dispatch_line(&shared, line.trim_end_matches(['\r', '\n'])),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
    }
    info!("stopping the ircDDB client thread");
}

fn dispatch_line(shared: &Shared, line: &str) {
    let (prefix, rest) = if let Some(body) = line.strip_prefix(':') {
        body.split_once(' ').unwrap_or((body, ""))
    } else {
        ("", line)
    };
    let mut parts = rest.splitn(2, ' ');
    let Some(command) = parts.next() else { return };
    let params = parts.next().unwrap_or("");
    let nick = prefix.split('!').next().unwrap_or(prefix);

    match command {
        "001" => {
            shared.state.store(State::ChooseServer as u8, Ordering::SeqCst);
        }
        "JOIN" => {
            let host = prefix.split('@').nth(1).unwrap_or("").to_string();
            user_join(shared, nick, &host);
        }
        "PART" | "QUIT" => {
            user_leave(shared, nick);
        }
        "MODE" => {
            let mut tokens = params.split_whitespace();
            let _channel = tokens.next();
            if let (Some(modeflag), Some(target)) = (tokens.next(), tokens.next()) {
                if modeflag == "+o" || modeflag == "-o" {
                    user_chan_op(shared, target, modeflag == "+o");
                }
            }
        }
        "PRIVMSG" => {
            if let Some((_target, message)) = params.split_once(" :") {
                if nick.starts_with("s-") {
                    do_update(shared, message);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elects_best_server_match_first() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        {
            let mut users = client.shared.users.lock().unwrap();
            users.insert("s-eu3db".to_string(), UserRecord { host: "1.1.1.1".to_string(), op: true, usn: 1 });
            users.insert("s-us1db".to_string(), UserRecord { host: "2.2.2.2".to_string(), op: true, usn: 1 });
        }
        assert!(elect_server(&client.shared));
        assert_eq!(client.shared.current_server.lock().unwrap().as_deref(), Some("s-eu3db"));
    }

    #[test]
    fn falls_back_to_any_op_s_dash_user() {
        let client = IrcDdbClient::new("#dstar", "s-missing");
        {
            let mut users = client.shared.users.lock().unwrap();
            users.insert("s-us1db".to_string(), UserRecord { host: "2.2.2.2".to_string(), op: true, usn: 1 });
        }
        assert!(elect_server(&client.shared));
    }

    #[test]
    fn no_op_users_fails_election() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        assert!(!elect_server(&client.shared));
    }

    #[test]
    fn update_area_to_zone_populates_repeater_and_replies_when_ready() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        *client.shared.init_ready.lock().unwrap() = true;
        do_update(&client.shared, "UPDATE 2021-01-02 03:04:05 G4KLX_B G4KLX_G");
        let reply = client.get_reply_message().unwrap();
        match reply {
            Reply::Repeater(r) => {
                assert_eq!(r.area_call, "G4KLX B");
                assert_eq!(r.zone_call, "G4KLX  G");
            }
            _ => panic!("expected a repeater reply"),
        }
        assert_eq!(
            client.shared.repeaters.lock().unwrap().get("G4KLX_B").map(|r| r.zone_call.as_str()),
            Some("G4KLX_G")
        );
    }

    #[test]
    fn update_without_the_update_keyword_is_also_accepted() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        do_update(&client.shared, "2021-01-02 03:04:05 G4KLX_B G4KLX_G");
        assert!(client.shared.repeaters.lock().unwrap().contains_key("G4KLX_B"));
    }

    #[test]
    fn max_time_high_water_mark_only_increases() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        do_update(&client.shared, "UPDATE 2021-01-02 03:04:05 G4KLX_B G4KLX_G");
        let after_first = *client.shared.max_time.lock().unwrap();
        assert!(after_first > INITIAL_MAX_TIME);
        do_update(&client.shared, "UPDATE 2000-01-01 00:00:00 M1ABC_B M1ABC_G");
        assert_eq!(*client.shared.max_time.lock().unwrap(), after_first);
    }

    #[test]
    fn find_repeater_answers_synchronously_from_the_absorbed_table() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        do_update(&client.shared, "UPDATE 2023-06-01 12:00:00 G4KLX_B G4KLX_G");
        client.find_repeater("G4KLX  B");
        let reply = client.get_reply_message().unwrap();
        match reply {
            Reply::Repeater(r) => {
                assert_eq!(r.zone_call, "G4KLX  G");
            }
            _ => panic!("expected a repeater reply"),
        }
    }

    #[test]
    fn find_repeater_replies_empty_when_never_absorbed() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        client.find_repeater("M1ABC  B");
        let reply = client.get_reply_message().unwrap();
        match reply {
            Reply::Repeater(r) => assert!(r.zone_call.is_empty()),
            _ => panic!("expected a repeater reply"),
        }
    }

    #[test]
    fn find_gateway_bypasses_irc_for_reflector_prefix() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        client.find_gateway("XRF001 G");
        let reply = client.get_reply_message().unwrap();
        match reply {
            Reply::Gateway(g) => assert_eq!(g.address, "XRF001.reflector.ircddb.net"),
            _ => panic!("expected a gateway reply"),
        }
    }

    #[test]
    fn find_user_without_connection_replies_immediately_empty() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        client.find_user("G4KLX");
        let reply = client.get_reply_message().unwrap();
        match reply {
            Reply::User(u) => {
                assert_eq!(u.call, "G4KLX");
                assert!(u.address.is_empty());
            }
            _ => panic!("expected a user reply"),
        }
    }

    #[test]
    fn channel_update_broadcast_populates_repeater_table_and_find_repeater_resolves_it() {
        let client = IrcDdbClient::new("#dstar", "s-eu3db");
        dispatch_line(&client.shared, ":s-x!~u@h PRIVMSG #dstar :UPDATE 2023-06-01 12:00:00 G4KLX_B G4KLX_G");
        assert!(client.shared.repeaters.lock().unwrap().contains_key("G4KLX_B"));
        assert!(*client.shared.max_time.lock().unwrap() >= 1_685_620_800);

        client.find_repeater("G4KLX  B");
        let reply = client.get_reply_message().unwrap();
        match reply {
            Reply::Repeater(r) => assert_eq!(r.zone_call, "G4KLX  G"),
            _ => panic!("expected a repeater reply"),
        }
    }
}
