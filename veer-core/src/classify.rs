//! Endpoint classification
//!
//! Decides, before any failover, what kind of endpoint a server string
//! refers to: an Aurora cluster DNS name, a proxy endpoint, a custom
//! cluster endpoint, a literal IP address, or a custom CNAME. Cluster DNS
//! names also yield the derived cluster host URL and the `?.<suffix>`
//! instance host pattern.

use crate::error::{FailoverError, FailoverResult};
use regex::Regex;
use std::sync::OnceLock;

static AURORA_DNS: OnceLock<Regex> = OnceLock::new();
static AURORA_PROXY_DNS: OnceLock<Regex> = OnceLock::new();
static AURORA_CUSTOM_CLUSTER: OnceLock<Regex> = OnceLock::new();
static IPV4: OnceLock<Regex> = OnceLock::new();
static IPV6: OnceLock<Regex> = OnceLock::new();
static IPV6_COMPRESSED: OnceLock<Regex> = OnceLock::new();

fn aurora_dns() -> &'static Regex {
    AURORA_DNS.get_or_init(|| {
        Regex::new(
            r"(?i)^(.+)\.(proxy-|cluster-|cluster-ro-|cluster-custom-)?([a-zA-Z0-9]+\.[a-zA-Z0-9\-]+\.rds\.amazonaws\.com)$",
        )
        .unwrap()
    })
}

fn aurora_proxy_dns() -> &'static Regex {
    AURORA_PROXY_DNS.get_or_init(|| {
        Regex::new(r"(?i)^(.+)\.(proxy-[a-zA-Z0-9]+\.[a-zA-Z0-9\-]+\.rds\.amazonaws\.com)$")
            .unwrap()
    })
}

fn aurora_custom_cluster() -> &'static Regex {
    AURORA_CUSTOM_CLUSTER.get_or_init(|| {
        Regex::new(r"(?i)^(.+)\.(cluster-custom-[a-zA-Z0-9]+\.[a-zA-Z0-9\-]+\.rds\.amazonaws\.com)$")
            .unwrap()
    })
}

fn ipv4() -> &'static Regex {
    IPV4.get_or_init(|| {
        Regex::new(
            r"^(([1-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.)(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){2}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
        )
        .unwrap()
    })
}

fn ipv6() -> &'static Regex {
    IPV6.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{1,4}(:[0-9a-fA-F]{1,4}){7}$").unwrap())
}

fn ipv6_compressed() -> &'static Regex {
    IPV6_COMPRESSED.get_or_init(|| {
        Regex::new(
            r"^(([0-9A-Fa-f]{1,4}(:[0-9A-Fa-f]{1,4}){0,5})?)::(([0-9A-Fa-f]{1,4}(:[0-9A-Fa-f]{1,4}){0,5})?)$",
        )
        .unwrap()
    })
}

/// Whether the host is any Aurora DNS endpoint (instance, cluster,
/// cluster-ro, proxy or custom cluster)
pub fn is_rds_dns(host: &str) -> bool {
    aurora_dns().is_match(host)
}

/// Whether the host is a proxy endpoint
pub fn is_rds_proxy_dns(host: &str) -> bool {
    aurora_proxy_dns().is_match(host)
}

/// Whether the host is a custom cluster endpoint
pub fn is_rds_custom_cluster_dns(host: &str) -> bool {
    aurora_custom_cluster().is_match(host)
}

pub fn is_ipv4(host: &str) -> bool {
    ipv4().is_match(host)
}

pub fn is_ipv6(host: &str) -> bool {
    ipv6().is_match(host) || ipv6_compressed().is_match(host)
}

/// Whether a host pattern carries the `?` instance-id placeholder
pub fn is_dns_pattern_valid(host: &str) -> bool {
    host.contains('?')
}

/// Reassemble the cluster host URL for a cluster or cluster-ro endpoint;
/// the result is a stable cluster identity
pub fn rds_cluster_host_url(host: &str) -> Option<String> {
    let caps = aurora_dns().captures(host)?;
    let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let marker = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let suffix = caps.get(3).map(|m| m.as_str()).unwrap_or("");

    if name.is_empty() || suffix.is_empty() {
        return None;
    }
    let marker = marker.to_ascii_lowercase();
    if marker == "cluster-" || marker == "cluster-ro-" {
        Some(format!("{}.cluster-{}", name, suffix))
    } else {
        None
    }
}

/// Derive the `?.<suffix>` instance host pattern from an Aurora DNS endpoint
pub fn rds_instance_host_pattern(host: &str) -> Option<String> {
    let caps = aurora_dns().captures(host)?;
    let suffix = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    if suffix.is_empty() {
        None
    } else {
        Some(format!("?.{}", suffix))
    }
}

/// Parse a comma-separated `host[:port]` server list
pub fn parse_server_list(server: &str, default_port: u16) -> FailoverResult<Vec<(String, u16)>> {
    let mut hosts = Vec::new();
    for part in server.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.rsplit_once(':') {
            // A colon inside an IPv6 literal is not a port separator.
            Some((host, port)) if !host.contains(':') => {
                let port: u16 = port.parse().map_err(|_| {
                    FailoverError::Configuration(format!("invalid server '{}'", part))
                })?;
                hosts.push((host.to_string(), port));
            }
            _ => hosts.push((part.to_string(), default_port)),
        }
    }
    if hosts.is_empty() {
        return Err(FailoverError::Configuration(
            "empty server host".to_string(),
        ));
    }
    Ok(hosts)
}
