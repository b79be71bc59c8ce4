//! Network discovery of Modbus TCP endpoints.
//!
//! Every non-loopback IPv4 interface contributes its `/24` prefix (the real
//! netmask is not consulted). Each of the 254 hosts of every prefix gets one
//! plain TCP connect probe. Probes run on a fixed number of workers pulling
//! from a shared queue, and the scan returns only after every worker is done.
//! Result order follows probe completion and carries no meaning.

use std::collections::BTreeSet;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{ScanError, ValidationError};
use crate::request::ScanParams;

/// A host that accepted a TCP connection on the discovery port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanResult {
    pub host: String,
    pub port: u16,
}

/// First three octets of a `/24` network.
pub type SubnetPrefix = [u8; 3];

#[async_trait]
/// Decides whether something listens at `host:port`.
pub trait Prober: Send + Sync {
    /// `true` iff a connection completes within `timeout`. Never retries.
    async fn probe(&self, host: Ipv4Addr, port: u16, timeout: Duration) -> bool;
}

/// [`Prober`] performing a real TCP connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, host: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        // The stream is dropped right away; only the handshake matters.
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Source of the local IPv4 addresses discovery starts from.
pub trait InterfaceSource: Send + Sync {
    fn ipv4_addresses(&self) -> io::Result<Vec<Ipv4Addr>>;
}

/// Addresses of the host's network interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

#[cfg(unix)]
impl InterfaceSource for SystemInterfaces {
    fn ipv4_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
        use nix::ifaddrs::getifaddrs;
        use nix::net::if_::InterfaceFlags;
        use std::net::SocketAddrV4;

        let addrs = getifaddrs()?
            .filter(|ifaddr| !ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK))
            .filter_map(|ifaddr| {
                let sin = *ifaddr.address?.as_sockaddr_in()?;
                Some(*SocketAddrV4::from(sin).ip())
            })
            .collect();
        Ok(addrs)
    }
}

#[cfg(not(unix))]
impl InterfaceSource for SystemInterfaces {
    fn ipv4_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface enumeration is only available on unix",
        ))
    }
}

/// A fixed list of local addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(Vec<Ipv4Addr>);

impl StaticInterfaces {
    pub fn new(addrs: Vec<Ipv4Addr>) -> Self {
        Self(addrs)
    }
}

impl InterfaceSource for StaticInterfaces {
    fn ipv4_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
        Ok(self.0.clone())
    }
}

/// Deduplicated `/24` prefixes of the non-loopback addresses.
pub fn subnet_prefixes(addrs: &[Ipv4Addr]) -> BTreeSet<SubnetPrefix> {
    addrs
        .iter()
        .filter(|addr| !addr.is_loopback())
        .map(|addr| {
            let [a, b, c, _] = addr.octets();
            [a, b, c]
        })
        .collect()
}

/// Hosts `.1` to `.254` of every prefix.
pub fn candidate_hosts(prefixes: &BTreeSet<SubnetPrefix>) -> Vec<Ipv4Addr> {
    prefixes
        .iter()
        .flat_map(|&[a, b, c]| (1..=254).map(move |d| Ipv4Addr::new(a, b, c, d)))
        .collect()
}

/// Concurrent TCP scanner for Modbus endpoints.
#[derive(Clone)]
pub struct Scanner {
    prober: Arc<dyn Prober>,
    interfaces: Arc<dyn InterfaceSource>,
    config: DiscoveryConfig,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(
        prober: Arc<dyn Prober>,
        interfaces: Arc<dyn InterfaceSource>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            prober,
            interfaces,
            config,
        }
    }

    /// Scanner probing real sockets from the host's own interfaces.
    pub fn system(config: DiscoveryConfig) -> Self {
        Self::new(Arc::new(TcpProber), Arc::new(SystemInterfaces), config)
    }

    fn workers(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Upper bound of a scan over `hosts` candidates when every probe times out.
    pub fn worst_case_duration(&self, hosts: usize, timeout: Duration) -> Duration {
        let rounds = hosts.div_ceil(self.workers());
        timeout * u32::try_from(rounds).unwrap_or(u32::MAX)
    }

    /// Probe timeout for `params`, falling back to the configured default.
    pub fn probe_timeout(&self, params: &ScanParams) -> Result<Duration, ValidationError> {
        params.validate(self.config.default_timeout)
    }

    /// Scan the local `/24` networks.
    ///
    /// # Errors
    ///
    /// Rejects an out-of-range timeout before any probe runs, and reports a
    /// failure to enumerate interfaces. Individual probe failures only drop
    /// that host from the result.
    pub async fn scan(&self, params: ScanParams) -> Result<Vec<ScanResult>, ScanError> {
        let timeout = self.probe_timeout(&params)?;
        let addrs = self
            .interfaces
            .ipv4_addresses()
            .map_err(ScanError::Interfaces)?;
        let prefixes = subnet_prefixes(&addrs);
        if prefixes.is_empty() {
            warn!("no non-loopback IPv4 interface to scan from");
        }

        let hosts = candidate_hosts(&prefixes);
        let total = hosts.len();
        let found = self.scan_hosts(hosts, timeout).await;
        info!(
            hosts = total,
            subnets = prefixes.len(),
            found = found.len(),
            port = self.config.port,
            "discovery scan finished"
        );
        Ok(found)
    }

    /// Probe an explicit list of candidates.
    pub async fn scan_hosts(&self, hosts: Vec<Ipv4Addr>, timeout: Duration) -> Vec<ScanResult> {
        let workers = self.workers().min(hosts.len());
        debug!(
            hosts = hosts.len(),
            workers,
            worst_case = ?self.worst_case_duration(hosts.len(), timeout),
            "probing"
        );

        let queue = Arc::new(Mutex::new(hosts.into_iter()));
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let queue = queue.clone();
            let prober = self.prober.clone();
            let port = self.config.port;
            set.spawn(async move {
                let mut found = Vec::new();
                loop {
                    let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                    let Some(host) = next else { break };
                    if prober.probe(host, port, timeout).await {
                        debug!(%host, port, "endpoint answered");
                        found.push(ScanResult {
                            host: host.to_string(),
                            port,
                        });
                    }
                }
                found
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(found) => results.extend(found),
                Err(err) => warn!(error = %err, "discovery worker failed"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedProber;
    use std::collections::HashSet;

    fn scanner(prober: &Arc<SimulatedProber>, addrs: Vec<Ipv4Addr>) -> Scanner {
        Scanner::new(
            prober.clone(),
            Arc::new(StaticInterfaces::new(addrs)),
            DiscoveryConfig::default(),
        )
    }

    #[test]
    fn prefixes_skip_loopback_and_deduplicate() {
        let prefixes = subnet_prefixes(&[
            Ipv4Addr::new(192, 168, 1, 20),
            Ipv4Addr::new(192, 168, 1, 33),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(10, 4, 0, 2),
        ]);
        assert_eq!(
            prefixes.into_iter().collect::<Vec<_>>(),
            vec![[10, 4, 0], [192, 168, 1]]
        );
    }

    #[test]
    fn candidates_cover_one_to_254() {
        let hosts = candidate_hosts(&BTreeSet::from([[192, 168, 1]]));
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn worst_case_bound() {
        let scanner = scanner(&Arc::new(SimulatedProber::new()), vec![]);
        let timeout = Duration::from_millis(500);
        assert_eq!(scanner.worst_case_duration(254, timeout), timeout * 2);
        assert_eq!(scanner.worst_case_duration(128, timeout), timeout);
        assert_eq!(scanner.worst_case_duration(0, timeout), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_never_exceed_the_bound() {
        let prober = Arc::new(SimulatedProber::new());
        let hosts: Vec<_> = (0..1000u32)
            .map(|i| Ipv4Addr::from(0x0a00_0000 + i))
            .collect();

        let found = scanner(&prober, vec![])
            .scan_hosts(hosts, Duration::from_millis(100))
            .await;

        assert!(found.is_empty());
        assert_eq!(prober.probe_count(), 1000);
        assert!(prober.max_in_flight() <= 128);
        assert!(prober.max_in_flight() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_responding_host_is_found_once() {
        let prober = Arc::new(SimulatedProber::new());
        for d in 1..=254 {
            prober.listen(Ipv4Addr::new(192, 168, 7, d), 502);
        }

        let found = scanner(&prober, vec![Ipv4Addr::new(192, 168, 7, 40)])
            .scan(ScanParams::default())
            .await
            .unwrap();

        assert_eq!(found.len(), 254);
        let unique: HashSet<_> = found.iter().cloned().collect();
        assert_eq!(unique.len(), 254);
        assert!(found.iter().all(|r| r.port == 502));
        assert!(unique.contains(&ScanResult {
            host: "192.168.7.1".into(),
            port: 502
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hosts_are_excluded() {
        let prober = Arc::new(SimulatedProber::new());
        prober.listen(Ipv4Addr::new(10, 1, 1, 9), 502);
        prober.set_latency(Duration::from_millis(300));

        let found = scanner(&prober, vec![Ipv4Addr::new(10, 1, 1, 1)])
            .scan(ScanParams::with_timeout_ms(200))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn configured_default_timeout_applies() {
        let prober = Arc::new(SimulatedProber::new());
        prober.listen(Ipv4Addr::new(10, 1, 1, 9), 502);
        prober.set_latency(Duration::from_millis(700));
        let config = DiscoveryConfig {
            default_timeout: Duration::from_millis(1000),
            ..DiscoveryConfig::default()
        };
        let scanner = Scanner::new(
            prober.clone(),
            Arc::new(StaticInterfaces::new(vec![Ipv4Addr::new(10, 1, 1, 1)])),
            config,
        );

        let found = scanner.scan(ScanParams::default()).await.unwrap();
        assert_eq!(found.len(), 1);

        let found = scanner
            .scan(ScanParams::with_timeout_ms(500))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_finishes_within_the_worst_case() {
        let prober = Arc::new(SimulatedProber::new());
        let scanner = scanner(&prober, vec![Ipv4Addr::new(10, 2, 2, 2)]);
        let timeout = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        scanner.scan(ScanParams::with_timeout_ms(100)).await.unwrap();
        // Timer deadlines round up to the next millisecond.
        let slack = Duration::from_millis(5);
        assert!(started.elapsed() <= scanner.worst_case_duration(254, timeout) + slack);
    }

    #[tokio::test]
    async fn invalid_timeout_is_rejected_before_probing() {
        let prober = Arc::new(SimulatedProber::new());
        let err = scanner(&prober, vec![Ipv4Addr::new(10, 2, 2, 2)])
            .scan(ScanParams::with_timeout_ms(50))
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::Validation(_)));
        assert_eq!(prober.probe_count(), 0);
    }

    struct BrokenInterfaces;

    impl InterfaceSource for BrokenInterfaces {
        fn ipv4_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
            Err(io::ErrorKind::PermissionDenied.into())
        }
    }

    #[tokio::test]
    async fn interface_failure_is_reported() {
        let scanner = Scanner::new(
            Arc::new(SimulatedProber::new()),
            Arc::new(BrokenInterfaces),
            DiscoveryConfig::default(),
        );
        assert!(matches!(
            scanner.scan(ScanParams::default()).await,
            Err(ScanError::Interfaces(_))
        ));
    }

    #[tokio::test]
    async fn tcp_prober_sees_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(
            TcpProber
                .probe(Ipv4Addr::LOCALHOST, port, Duration::from_secs(1))
                .await
        );
        drop(listener);
    }
}
