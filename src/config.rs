use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_server::proto::rr::RecordType;
use log::warn;
use serde::Deserialize;

use crate::hosts::HostTable;
use crate::suffix::SuffixSet;

pub const DEFAULT_TIMEOUT_SECS: u64 = 2;

/// Transport used to reach an upstream resolver, or to serve clients for the
/// `listen` entries (where only `udp` and `tcp` are valid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Udp,
    Tcp,
    HttpsGoogle,
    HttpsCloudflare,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
            Network::HttpsGoogle => "https_google",
            Network::HttpsCloudflare => "https_cloudflare",
        })
    }
}

/// One upstream or listen endpoint. `port` is meaningless for the DoH
/// networks, where `host` identifies the HTTPS endpoint instead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Addr {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub network: Network,
}

impl Addr {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Network::Udp | Network::Tcp => {
                write!(f, "{}:{}/{}", self.host, self.port, self.network)
            }
            Network::HttpsGoogle | Network::HttpsCloudflare => {
                write!(f, "{}/{}", self.host, self.network)
            }
        }
    }
}

/// Routes a group of domains to a group of upstream servers. Rules are
/// scanned in file order and the first match wins.
#[derive(Debug, Default, Deserialize)]
pub struct ForwardRule {
    #[serde(default)]
    pub server: Vec<Addr>,
    #[serde(default)]
    pub domain_file: Option<PathBuf>,
    #[serde(skip)]
    pub domains: SuffixSet,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: Vec<Addr>,
    #[serde(default)]
    pub blacklist_file: Option<PathBuf>,
    #[serde(default)]
    pub host_file: Option<PathBuf>,
    #[serde(default)]
    pub forward_rules: Vec<ForwardRule>,
    #[serde(default)]
    pub default_upstream: Vec<Addr>,
    /// Global race deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub debug: bool,
    /// IP literals whose presence in an answer rejects the whole response.
    #[serde(skip)]
    pub blacklist: SuffixSet,
    #[serde(skip)]
    pub hosts: HostTable,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Config {
    /// Parses the YAML document at `path` and loads the blacklist, per-rule
    /// domain lists, and host file it references. Relative paths inside the
    /// config are resolved from the process working directory.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;

        if config.timeout == 0 {
            config.timeout = DEFAULT_TIMEOUT_SECS;
        }

        if let Some(file) = &config.blacklist_file {
            load_label_file(&mut config.blacklist, file)?;
        }
        for rule in &mut config.forward_rules {
            if let Some(file) = &rule.domain_file {
                load_label_file(&mut rule.domains, file)?;
            }
        }
        if let Some(file) = &config.host_file {
            load_host_file(&config.hosts, file)?;
        }

        Ok(config)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// One entry per line; blank lines and `#` comments are skipped. Shared by
/// the blacklist and per-rule domain files.
fn load_label_file(set: &mut SuffixSet, path: &Path) -> Result<()> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading list {}", path.display()))?;
    parse_labels(set, &data);
    Ok(())
}

fn parse_labels(set: &mut SuffixSet, data: &str) {
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        set.add(line);
    }
}

/// Hosts-file format: first token is the IP, remaining tokens are names for
/// it. A name may start with `*` to mark a suffix wildcard. The address
/// family decides whether the entry answers A or AAAA queries.
fn load_host_file(hosts: &HostTable, path: &Path) -> Result<()> {
    let data =
        fs::read_to_string(path).with_context(|| format!("reading hosts {}", path.display()))?;
    parse_hosts(hosts, &data);
    Ok(())
}

fn parse_hosts(hosts: &HostTable, data: &str) {
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(ip_token) = tokens.next() else {
            continue;
        };
        let ip: IpAddr = match ip_token.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("skipping host entry with bad address {ip_token:?}");
                continue;
            }
        };
        let rtype = if ip.is_ipv6() {
            RecordType::AAAA
        } else {
            RecordType::A
        };
        for name in tokens {
            hosts.add(name, ip, rtype);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn loads_full_config() {
        let config = Config::load(Path::new("testdata/config.yaml")).unwrap();

        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].network, Network::Udp);
        assert_eq!(config.listen[1].network, Network::Tcp);

        assert!(config.blacklist.exists("1.2.3.4"));
        assert!(!config.blacklist.exists("8.8.8.8"));

        assert_eq!(
            config.hosts.get("localhost", RecordType::A),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(
            config.hosts.get("localhost", RecordType::AAAA),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );

        assert_eq!(config.forward_rules.len(), 2);
        assert!(config.forward_rules[0].domains.contains("a.com"));
        assert!(config.forward_rules[0].domains.contains("x.a.com"));
        assert!(config.forward_rules[1].domains.contains("d.com"));

        assert_eq!(config.default_upstream.len(), 1);
        assert_eq!(config.default_upstream[0].endpoint(), "114.114.114.114:53");
    }

    #[test]
    fn timeout_defaults_when_absent() {
        let config = Config::load(Path::new("testdata/config.yaml")).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.race_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn doh_addresses_need_no_port() {
        let config = Config::load(Path::new("testdata/config.yaml")).unwrap();
        let rule = &config.forward_rules[1];
        assert_eq!(rule.server[0].network, Network::HttpsCloudflare);
        assert_eq!(rule.server[0].port, 0);
    }

    #[test]
    fn unknown_network_is_rejected() {
        let err = serde_yaml::from_str::<Config>(
            "default_upstream:\n  - host: 1.1.1.1\n    port: 53\n    network: carrier_pigeon\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("carrier_pigeon"));
    }

    #[test]
    fn label_parser_skips_blanks_and_comments() {
        let mut set = SuffixSet::new();
        parse_labels(&mut set, "# comment\n\n  a.com  \nb.com\n   # indented\n");

        assert_eq!(set.len(), 2);
        assert!(set.exists("a.com"));
        assert!(set.exists("b.com"));
    }

    #[test]
    fn hosts_parser_splits_on_mixed_whitespace() {
        let hosts = HostTable::new();
        parse_hosts(&hosts, "127.0.0.1\tlocalhost  router.local\n");

        assert_eq!(
            hosts.get("localhost", RecordType::A),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(
            hosts.get("router.local", RecordType::A),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }

    #[test]
    fn hosts_parser_detects_address_family() {
        let hosts = HostTable::new();
        parse_hosts(&hosts, "::1 localhost\n10.1.2.3 box\n");

        assert_eq!(
            hosts.get("localhost", RecordType::AAAA),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(hosts.get("localhost", RecordType::A), None);
        assert_eq!(
            hosts.get("box", RecordType::A),
            Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)))
        );
    }

    #[test]
    fn hosts_parser_skips_garbage_addresses() {
        let hosts = HostTable::new();
        parse_hosts(&hosts, "not-an-ip localhost\n# comment\n");
        assert!(hosts.is_empty());
    }

    #[test]
    fn hosts_parser_accepts_wildcard_names() {
        let hosts = HostTable::new();
        parse_hosts(&hosts, "10.0.0.5 *.lab.internal\n");

        assert_eq!(
            hosts.get("box.lab.internal", RecordType::A),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
        );
    }
}
