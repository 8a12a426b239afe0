//! Reachability probing: several independent strategies combined by a quorum.
use async_trait::async_trait;
use futures::future::join_all;
use rand::random;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::utils::collect_local_addresses;

/// Used when no probe targets are configured.
pub const DEFAULT_PROBE_TARGETS: &[&str] = &["www.baidu.com", "114.114.114.114", "8.8.8.8"];

const DEFAULT_TCP_PORT: u16 = 443;

/// Answers "is the network usable right now?". Never fails: every error
/// along the way is an unreachable result.
#[async_trait]
pub trait ConnectivityProber: Send + Sync {
    async fn probe(&self, targets: &[String], timeout: Duration) -> bool;
}

/// One way of checking a single target.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check_target(&self, target: &str, timeout: Duration) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Tcp,
    Http,
    Icmp,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" | "socket" => Ok(StrategyKind::Tcp),
            "http" | "https" | "curl" => Ok(StrategyKind::Http),
            "icmp" | "ping" => Ok(StrategyKind::Icmp),
            other => Err(format!("unknown probe strategy '{other}'")),
        }
    }
}

/// How per-strategy results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    /// Reachable if any strategy succeeds.
    Any,
    /// Reachable only if every strategy succeeds.
    All,
}

impl Quorum {
    pub fn combine(&self, results: &[bool]) -> bool {
        if results.is_empty() {
            return false;
        }
        match self {
            Quorum::Any => results.iter().any(|ok| *ok),
            Quorum::All => results.iter().all(|ok| *ok),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub targets: Vec<String>,
    pub timeout: Duration,
    pub strategies: Vec<StrategyKind>,
    pub quorum: Quorum,
}

/// Resolves a target to `host:port` for a TCP connect, accepting bare hosts,
/// IP addresses, `host:port` and URLs.
fn tcp_address(target: &str, default_port: u16) -> String {
    if target.contains("://") {
        if let Ok(url) = reqwest::Url::parse(target) {
            if let Some(host) = url.host_str() {
                let port = url.port_or_known_default().unwrap_or(default_port);
                return format!("{host}:{port}");
            }
        }
    }
    if target.parse::<SocketAddr>().is_ok() {
        return target.to_string();
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    match target.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => target.to_string(),
        _ => format!("{target}:{default_port}"),
    }
}

fn http_url(target: &str) -> String {
    if target.contains("://") {
        target.to_string()
    } else {
        format!("https://{target}")
    }
}

fn host_of(target: &str) -> String {
    if target.contains("://") {
        if let Some(host) = reqwest::Url::parse(target).ok().and_then(|u| u.host_str().map(str::to_string)) {
            return host;
        }
    }
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    match target.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.contains(':') => host.to_string(),
        _ => target.to_string(),
    }
}

/// Transport-level check: a TCP handshake with the target.
pub struct TcpConnectStrategy {
    default_port: u16,
}

impl Default for TcpConnectStrategy {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_TCP_PORT,
        }
    }
}

#[async_trait]
impl ProbeStrategy for TcpConnectStrategy {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn check_target(&self, target: &str, timeout: Duration) -> Result<(), String> {
        let address = tcp_address(target, self.default_port);
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(format!("Error: {e}")),
            Err(_) => Err("Error: Connection timed out".to_string()),
        }
    }
}

/// Application-level check: an HTTP GET that must answer 2xx.
pub struct HttpGetStrategy {
    client: reqwest::Client,
}

impl HttpGetStrategy {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGetStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeStrategy for HttpGetStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn check_target(&self, target: &str, timeout: Duration) -> Result<(), String> {
        let url = http_url(target);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("HTTP {}", response.status())),
            Err(e) if e.is_timeout() => Err("Error: Request timed out".to_string()),
            Err(e) => Err(format!("Error: {e}")),
        }
    }
}

/// ICMP echo. Needs raw-socket privileges on most systems, so it is opt-in.
pub struct IcmpPingStrategy {
    client: surge_ping::Client,
}

impl IcmpPingStrategy {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            client: surge_ping::Client::new(&surge_ping::Config::default())?,
        })
    }
}

#[async_trait]
impl ProbeStrategy for IcmpPingStrategy {
    fn name(&self) -> &'static str {
        "icmp"
    }

    async fn check_target(&self, target: &str, timeout: Duration) -> Result<(), String> {
        let host = host_of(target);
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => tokio::net::lookup_host(format!("{host}:0"))
                .await
                .map_err(|e| format!("Failed to resolve target host: {e}"))?
                .map(|addr| addr.ip())
                .find(IpAddr::is_ipv4)
                .ok_or_else(|| "DNS resolution returned no IPv4 addresses".to_string())?,
        };

        let mut pinger = self
            .client
            .pinger(ip, surge_ping::PingIdentifier(random()))
            .await;
        pinger.timeout(timeout);
        pinger
            .ping(surge_ping::PingSequence(0), &[])
            .await
            .map(|_| ())
            .map_err(|e| format!("Error: {e}"))
    }
}

/// The default prober: runs every strategy concurrently against the target
/// list and combines the per-strategy verdicts with a [`Quorum`].
pub struct StrategyProber {
    strategies: Vec<Box<dyn ProbeStrategy>>,
    quorum: Quorum,
}

impl StrategyProber {
    pub fn new(strategies: Vec<Box<dyn ProbeStrategy>>, quorum: Quorum) -> Self {
        Self { strategies, quorum }
    }

    pub fn from_settings(settings: &ProbeSettings) -> Self {
        Self::from_kinds(&settings.strategies, settings.quorum, IcmpPingStrategy::new)
    }

    /// Builds the configured strategies. A strategy that cannot be set up is
    /// skipped; if none is left, TCP and HTTP are used instead.
    fn from_kinds<F>(kinds: &[StrategyKind], quorum: Quorum, icmp: F) -> Self
    where
        F: Fn() -> std::io::Result<IcmpPingStrategy>,
    {
        let mut strategies: Vec<Box<dyn ProbeStrategy>> = Vec::new();
        for kind in kinds {
            match kind {
                StrategyKind::Tcp => strategies.push(Box::new(TcpConnectStrategy::default())),
                StrategyKind::Http => strategies.push(Box::new(HttpGetStrategy::new())),
                StrategyKind::Icmp => match icmp() {
                    Ok(strategy) => strategies.push(Box::new(strategy)),
                    Err(e) => {
                        warn!(error = %e, "ICMP probing unavailable (raw socket denied); skipping strategy.")
                    }
                },
            }
        }
        if strategies.is_empty() {
            warn!("No probe strategy could be set up; falling back to tcp and http.");
            strategies.push(Box::new(TcpConnectStrategy::default()));
            strategies.push(Box::new(HttpGetStrategy::new()));
        }
        Self::new(strategies, quorum)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    async fn run_strategy(strategy: &dyn ProbeStrategy, targets: &[String], timeout: Duration) -> bool {
        for target in targets {
            let started = Instant::now();
            match strategy.check_target(target, timeout).await {
                Ok(()) => {
                    debug!(
                        strategy = strategy.name(),
                        target = %target,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Probe target responded."
                    );
                    return true;
                }
                Err(details) => {
                    debug!(strategy = strategy.name(), target = %target, %details, "Probe target failed.");
                }
            }
        }
        false
    }
}

#[async_trait]
impl ConnectivityProber for StrategyProber {
    async fn probe(&self, targets: &[String], timeout: Duration) -> bool {
        let defaults: Vec<String>;
        let targets = if targets.is_empty() {
            defaults = DEFAULT_PROBE_TARGETS.iter().map(|t| t.to_string()).collect();
            &defaults[..]
        } else {
            targets
        };

        let results = join_all(
            self.strategies
                .iter()
                .map(|s| Self::run_strategy(s.as_ref(), targets, timeout)),
        )
        .await;

        for (strategy, ok) in self.strategies.iter().zip(&results) {
            info!(strategy = strategy.name(), reachable = *ok, "Probe strategy finished.");
        }
        self.quorum.combine(&results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// No non-loopback address: not attached to any network.
    NoLocalNetwork,
    Online,
    /// Attached, but the Internet is not reachable; the portal wants a login.
    PortalRequired,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NetworkStatus::NoLocalNetwork => "not connected to a local network (no usable IP address)",
            NetworkStatus::Online => "connected and the Internet is reachable",
            NetworkStatus::PortalRequired => "connected, but the Internet is unreachable; portal login required",
        };
        f.write_str(text)
    }
}

pub async fn assess_network_status(
    prober: &dyn ConnectivityProber,
    targets: &[String],
    timeout: Duration,
) -> NetworkStatus {
    let local = collect_local_addresses();
    debug!(addresses = ?local, "Local addresses collected.");
    if local.is_empty() {
        return NetworkStatus::NoLocalNetwork;
    }
    if prober.probe(targets, timeout).await {
        NetworkStatus::Online
    } else {
        NetworkStatus::PortalRequired
    }
}
