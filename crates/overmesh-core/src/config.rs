//! YAML configuration.
//!
//! [`Settings`] mirrors the config file; [`Config`] wraps a loaded
//! settings snapshot, hands out immutable `Arc`s to readers, and fans a
//! reload out to registered callbacks. Subsystems that support live
//! reload (firewall rules, relay flag, punchy, logging) subscribe here.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::Deserialize;
use tracing::{info, warn};

use overmesh_net::OverlayIp;

use crate::error::{CoreError, CoreResult};
use crate::firewall::{Conntrack, Firewall, FirewallTimeouts, Rule, RuleProto};
use crate::session::CipherKind;

fn default_true() -> bool {
    true
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_batch() -> usize {
    64
}

fn default_routines() -> usize {
    1
}

fn default_mtu() -> u16 {
    1300
}

fn default_lighthouse_interval() -> u64 {
    10
}

fn default_alive_interval() -> u64 {
    5
}

fn default_pending_deletion_interval() -> u64 {
    10
}

fn default_retries() -> u32 {
    10
}

fn default_trigger_buffer() -> usize {
    64
}

fn default_cipher() -> String {
    "aes".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub pki: PkiSettings,
    #[serde(default)]
    pub lighthouse: LighthouseSettings,
    #[serde(default)]
    pub static_host_map: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub listen: ListenSettings,
    #[serde(default)]
    pub punchy: PunchySettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub tun: TunSettings,
    #[serde(default)]
    pub firewall: FirewallSettings,
    #[serde(default)]
    pub preferred_ranges: Vec<String>,
    #[serde(default = "default_cipher")]
    pub cipher: String,
    #[serde(default)]
    pub timers: TimerSettings,
    #[serde(default)]
    pub handshakes: HandshakeSettings,
    #[serde(default)]
    pub stats: StatsSettings,
    #[serde(default)]
    pub local_allow_list: HashMap<String, bool>,
    #[serde(default)]
    pub remote_allow_list: HashMap<String, bool>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pki: PkiSettings::default(),
            lighthouse: LighthouseSettings::default(),
            static_host_map: HashMap::new(),
            listen: ListenSettings::default(),
            punchy: PunchySettings::default(),
            relay: RelaySettings::default(),
            tun: TunSettings::default(),
            firewall: FirewallSettings::default(),
            preferred_ranges: Vec::new(),
            cipher: default_cipher(),
            timers: TimerSettings::default(),
            handshakes: HandshakeSettings::default(),
            stats: StatsSettings::default(),
            local_allow_list: HashMap::new(),
            remote_allow_list: HashMap::new(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PkiSettings {
    /// PEM CA bundle, inline or a file path
    #[serde(default)]
    pub ca: String,
    /// PEM node certificate, inline or a file path
    #[serde(default)]
    pub cert: String,
    /// PEM node private key, inline or a file path
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LighthouseSettings {
    #[serde(default)]
    pub am_lighthouse: bool,
    /// Overlay addresses of the lighthouses this node reports to
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Publish cadence in seconds
    #[serde(default = "default_lighthouse_interval")]
    pub interval: u64,
    #[serde(default)]
    pub serve_dns: bool,
    #[serde(default)]
    pub dns: DnsSettings,
}

impl Default for LighthouseSettings {
    fn default() -> Self {
        Self {
            am_lighthouse: false,
            hosts: Vec::new(),
            interval: default_lighthouse_interval(),
            serve_dns: false,
            dns: DnsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DnsSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenSettings {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_routines")]
    pub routines: usize,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: 0,
            batch: default_batch(),
            routines: default_routines(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PunchySettings {
    #[serde(default = "default_true")]
    pub punch: bool,
    #[serde(default)]
    pub respond: bool,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub respond_delay: Option<String>,
}

impl Default for PunchySettings {
    fn default() -> Self {
        Self {
            punch: true,
            respond: false,
            delay: None,
            respond_delay: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub am_relay: bool,
    #[serde(default = "default_true")]
    pub use_relays: bool,
    /// Overlay addresses of relays that can carry traffic to us
    #[serde(default)]
    pub relays: Vec<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            am_relay: false,
            use_relays: true,
            relays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunSettings {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub dev: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub routes: Vec<RouteSetting>,
    #[serde(default)]
    pub unsafe_routes: Vec<RouteSetting>,
    #[serde(default = "default_true")]
    pub drop_local_broadcast: bool,
    #[serde(default = "default_true")]
    pub drop_multicast: bool,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            dev: String::new(),
            mtu: default_mtu(),
            routes: Vec::new(),
            unsafe_routes: Vec::new(),
            drop_local_broadcast: true,
            drop_multicast: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSetting {
    pub route: String,
    #[serde(default)]
    pub via: String,
    #[serde(default)]
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FirewallSettings {
    #[serde(default)]
    pub conntrack: ConntrackSettings,
    #[serde(default)]
    pub inbound: Vec<RuleSetting>,
    #[serde(default)]
    pub outbound: Vec<RuleSetting>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConntrackSettings {
    #[serde(default)]
    pub tcp_timeout: Option<String>,
    #[serde(default)]
    pub udp_timeout: Option<String>,
    #[serde(default)]
    pub default_timeout: Option<String>,
    #[serde(default)]
    pub routine_cache_timeout: Option<String>,
}

/// A rule port: a number, or the string `any`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSetting {
    Num(u16),
    Name(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleSetting {
    #[serde(default)]
    pub port: Option<PortSetting>,
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub ca_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerSettings {
    #[serde(default = "default_alive_interval")]
    pub connection_alive_interval: u64,
    #[serde(default = "default_pending_deletion_interval")]
    pub pending_deletion_interval: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            connection_alive_interval: default_alive_interval(),
            pending_deletion_interval: default_pending_deletion_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeSettings {
    #[serde(default)]
    pub try_interval: Option<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_trigger_buffer")]
    pub trigger_buffer: usize,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            try_interval: None,
            retries: default_retries(),
            trigger_buffer: default_trigger_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StatsSettings {
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub disconnect_invalid: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            disconnect_invalid: false,
        }
    }
}

/// Parse durations written as `250ms`, `5s`, `2m`, or `1h`
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = value
        .parse()
        .map_err(|_| CoreError::ConfigInvalid(format!("invalid duration: {}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(CoreError::ConfigInvalid(format!("invalid duration: {}", s))),
    }
}

fn parse_duration_or(opt: &Option<String>, fallback: Duration) -> CoreResult<Duration> {
    match opt {
        Some(s) => parse_duration(s),
        None => Ok(fallback),
    }
}

impl Settings {
    pub fn from_yaml(input: &str) -> CoreResult<Self> {
        serde_yaml::from_str(input).map_err(|e| CoreError::ConfigInvalid(e.to_string()))
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigInvalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        let s = Self::from_yaml(&contents)?;
        s.validate()?;
        Ok(s)
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> CoreResult<()> {
        CipherKind::from_name(&self.cipher)?;

        if self.listen.routines == 0 {
            return Err(CoreError::ConfigInvalid(
                "listen.routines must be at least 1".to_string(),
            ));
        }
        if !self.tun.disabled && (self.tun.mtu < 576 || self.tun.mtu > 9000) {
            return Err(CoreError::ConfigInvalid(format!(
                "tun.mtu {} out of range",
                self.tun.mtu
            )));
        }

        // Every lighthouse we query must be statically reachable
        if !self.lighthouse.am_lighthouse {
            for host in &self.lighthouse.hosts {
                if !self.static_host_map.contains_key(host) {
                    return Err(CoreError::ConfigInvalid(format!(
                        "lighthouse {} does not have a static_host_map entry",
                        host
                    )));
                }
            }
        } else if !self.lighthouse.hosts.is_empty() {
            warn!("lighthouse.am_lighthouse is set, lighthouse.hosts is ignored");
        }

        self.preferred_ranges_parsed()?;
        self.static_hosts_parsed()?;
        self.lighthouse_ips()?;
        self.relay_ips()?;
        self.timers_parsed()?;
        self.handshake_try_interval()?;
        Ok(())
    }

    pub fn cipher_kind(&self) -> CoreResult<CipherKind> {
        CipherKind::from_name(&self.cipher)
    }

    pub fn preferred_ranges_parsed(&self) -> CoreResult<Vec<Ipv4Net>> {
        self.preferred_ranges
            .iter()
            .map(|s| {
                s.parse::<Ipv4Net>()
                    .map_err(|_| CoreError::ConfigInvalid(format!("invalid preferred range: {}", s)))
            })
            .collect()
    }

    pub fn static_hosts_parsed(&self) -> CoreResult<HashMap<OverlayIp, Vec<SocketAddr>>> {
        let mut out = HashMap::new();
        for (ip, addrs) in &self.static_host_map {
            let vpn_ip: OverlayIp = ip
                .parse::<std::net::Ipv4Addr>()
                .map(OverlayIp::from)
                .map_err(|_| {
                    CoreError::ConfigInvalid(format!("invalid static_host_map key: {}", ip))
                })?;
            let mut parsed = Vec::with_capacity(addrs.len());
            for a in addrs {
                parsed.push(a.parse::<SocketAddr>().map_err(|_| {
                    CoreError::ConfigInvalid(format!("invalid static_host_map address: {}", a))
                })?);
            }
            out.insert(vpn_ip, parsed);
        }
        Ok(out)
    }

    pub fn lighthouse_ips(&self) -> CoreResult<Vec<OverlayIp>> {
        self.lighthouse
            .hosts
            .iter()
            .map(|s| {
                s.parse::<std::net::Ipv4Addr>()
                    .map(OverlayIp::from)
                    .map_err(|_| CoreError::ConfigInvalid(format!("invalid lighthouse host: {}", s)))
            })
            .collect()
    }

    pub fn relay_ips(&self) -> CoreResult<Vec<OverlayIp>> {
        self.relay
            .relays
            .iter()
            .map(|s| {
                s.parse::<std::net::Ipv4Addr>()
                    .map(OverlayIp::from)
                    .map_err(|_| CoreError::ConfigInvalid(format!("invalid relay: {}", s)))
            })
            .collect()
    }

    /// (alive check interval, pending deletion interval)
    pub fn timers_parsed(&self) -> CoreResult<(Duration, Duration)> {
        Ok((
            Duration::from_secs(self.timers.connection_alive_interval.max(1)),
            Duration::from_secs(self.timers.pending_deletion_interval.max(1)),
        ))
    }

    pub fn handshake_try_interval(&self) -> CoreResult<Duration> {
        parse_duration_or(&self.handshakes.try_interval, Duration::from_secs(1))
    }

    pub fn lighthouse_interval(&self) -> Duration {
        Duration::from_secs(self.lighthouse.interval.max(1))
    }

    pub fn stats_interval(&self) -> CoreResult<Option<Duration>> {
        match &self.stats.interval {
            Some(s) => Ok(Some(parse_duration(s)?)),
            None => Ok(None),
        }
    }

    pub fn punchy_delays(&self) -> CoreResult<(Duration, Duration)> {
        Ok((
            parse_duration_or(&self.punchy.delay, Duration::from_secs(1))?,
            parse_duration_or(&self.punchy.respond_delay, Duration::from_secs(5))?,
        ))
    }

    pub fn conntrack_timeouts(&self) -> CoreResult<FirewallTimeouts> {
        let defaults = FirewallTimeouts::default();
        Ok(FirewallTimeouts {
            tcp: parse_duration_or(&self.firewall.conntrack.tcp_timeout, defaults.tcp)?,
            udp: parse_duration_or(&self.firewall.conntrack.udp_timeout, defaults.udp)?,
            default: parse_duration_or(&self.firewall.conntrack.default_timeout, defaults.default)?,
        })
    }

    pub fn routine_cache_timeout(&self) -> CoreResult<Duration> {
        parse_duration_or(
            &self.firewall.conntrack.routine_cache_timeout,
            Duration::from_secs(60),
        )
    }

    /// Build the firewall from the rule lists, reusing `conntrack` so a
    /// reload does not forget established flows.
    pub fn build_firewall(&self, conntrack: Option<Arc<Conntrack>>) -> CoreResult<Firewall> {
        let timeouts = self.conntrack_timeouts()?;
        let mut fw = match conntrack {
            Some(ct) => Firewall::with_conntrack(timeouts, ct),
            None => Firewall::new(timeouts),
        };
        for (incoming, rules) in [(true, &self.firewall.inbound), (false, &self.firewall.outbound)]
        {
            for r in rules {
                let proto = RuleProto::from_name(r.proto.as_deref().unwrap_or("any"))?;
                let port = match &r.port {
                    None => None,
                    Some(PortSetting::Num(n)) => Some(*n),
                    Some(PortSetting::Name(s)) if s == "any" => None,
                    Some(PortSetting::Name(s)) => Some(s.parse::<u16>().map_err(|_| {
                        CoreError::ConfigInvalid(format!("invalid firewall port: {}", s))
                    })?),
                };
                let mut groups = r.groups.clone();
                if let Some(g) = &r.group {
                    if g != "any" {
                        groups.push(g.clone());
                    }
                }
                let cidr = match &r.cidr {
                    Some(c) => Some(c.parse::<Ipv4Net>().map_err(|_| {
                        CoreError::ConfigInvalid(format!("invalid firewall cidr: {}", c))
                    })?),
                    None => None,
                };
                fw.add_rule(
                    incoming,
                    proto,
                    port,
                    Rule {
                        groups,
                        host: r.host.clone().filter(|h| h != "any"),
                        cidr,
                        ca_name: r.ca_name.clone(),
                    },
                );
            }
        }
        Ok(fw)
    }

    fn allow_list(map: &HashMap<String, bool>) -> CoreResult<AllowList> {
        let mut rules = Vec::with_capacity(map.len());
        for (cidr, allow) in map {
            let net = cidr.parse::<Ipv4Net>().map_err(|_| {
                CoreError::ConfigInvalid(format!("invalid allow list cidr: {}", cidr))
            })?;
            rules.push((net, *allow));
        }
        Ok(AllowList::new(rules))
    }

    pub fn remote_allow_list_parsed(&self) -> CoreResult<AllowList> {
        Self::allow_list(&self.remote_allow_list)
    }

    pub fn local_allow_list_parsed(&self) -> CoreResult<AllowList> {
        Self::allow_list(&self.local_allow_list)
    }

    /// Read a PEM field that may be inline or a path on disk
    pub fn read_pem_field(field: &str) -> CoreResult<String> {
        if field.contains("-----BEGIN") {
            return Ok(field.to_string());
        }
        std::fs::read_to_string(field)
            .map_err(|e| CoreError::ConfigInvalid(format!("failed to read {}: {}", field, e)))
    }
}

/// CIDR allow/deny list; the most specific matching rule wins. With no
/// rules everything is allowed; once any allow rule exists, unmatched
/// addresses are denied.
#[derive(Clone, Default)]
pub struct AllowList {
    rules: Vec<(Ipv4Net, bool)>,
}

impl AllowList {
    pub fn new(mut rules: Vec<(Ipv4Net, bool)>) -> Self {
        // longest prefix first
        rules.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Self { rules }
    }

    pub fn allows(&self, ip: std::net::Ipv4Addr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        for (net, allow) in &self.rules {
            if net.contains(&ip) {
                return *allow;
            }
        }
        !self.rules.iter().any(|(_, allow)| *allow)
    }

    pub fn allows_sockaddr(&self, addr: &SocketAddrV4) -> bool {
        self.allows(*addr.ip())
    }
}

type ReloadCallback = Box<dyn Fn(&Settings) + Send + Sync>;

/// A live configuration handle
pub struct Config {
    path: Option<PathBuf>,
    settings: RwLock<Arc<Settings>>,
    callbacks: Mutex<Vec<ReloadCallback>>,
}

impl Config {
    pub fn new(settings: Settings, path: Option<PathBuf>) -> Self {
        Self {
            path,
            settings: RwLock::new(Arc::new(settings)),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.read().unwrap().clone()
    }

    pub fn register_reload_callback<F>(&self, f: F)
    where
        F: Fn(&Settings) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(f));
    }

    /// Re-read the file and fan the new snapshot out to subscribers
    pub fn reload(&self) -> CoreResult<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| CoreError::ConfigInvalid("no config path to reload".to_string()))?;
        let fresh = Settings::load(path)?;
        *self.settings.write().unwrap() = Arc::new(fresh.clone());
        info!("configuration reloaded");
        for cb in self.callbacks.lock().unwrap().iter() {
            cb(&fresh);
        }
        Ok(())
    }

    /// Apply an already-parsed snapshot (test hook and SIGHUP-free reload)
    pub fn replace(&self, fresh: Settings) {
        *self.settings.write().unwrap() = Arc::new(fresh.clone());
        for cb in self.callbacks.lock().unwrap().iter() {
            cb(&fresh);
        }
    }
}
