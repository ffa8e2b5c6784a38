//! IP filtering: blacklist/whitelist with CIDR ranges and temp bans.
//!
//! In blacklist mode (the default) everything is allowed except listed
//! ranges; in whitelist mode everything is denied except listed ranges.
//! Rules live in `ip_rules.json`, maintained by the operator and loaded at
//! startup. Temporary bans from the rate limiter sit in front of both and
//! are in-memory only.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A CIDR range over IPv4 or IPv6. A bare address parses as /32 or /128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrNet {
    addr: IpAddr,
    prefix: u8,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid CIDR {0:?}")]
pub struct BadCidr(String);

impl FromStr for CidrNet {
    type Err = BadCidr;

    fn from_str(s: &str) -> Result<Self, BadCidr> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part.parse().map_err(|_| BadCidr(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            Some(p) => p.parse::<u8>().map_err(|_| BadCidr(s.to_string()))?,
            None => max,
        };
        if prefix > max {
            return Err(BadCidr(s.to_string()));
        }
        Ok(Self { addr, prefix })
    }
}

impl CidrNet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let shift = 32 - u32::from(self.prefix);
                let mask = if shift >= 32 { 0 } else { u32::MAX << shift };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let shift = 128 - u32::from(self.prefix);
                let mask = if shift >= 128 { 0 } else { u128::MAX << shift };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// One filter rule, optionally expiring.
#[derive(Debug, Clone)]
pub struct IpRule {
    pub net: CidrNet,
    pub expires_at: Option<u64>,
}

/// On-disk shape of `ip_rules.json`. Either list may be omitted.
#[derive(Deserialize)]
struct PersistedRules {
    #[serde(default)]
    deny: Vec<RuleRecord>,
    #[serde(default)]
    allow: Vec<RuleRecord>,
}

#[derive(Deserialize)]
struct RuleRecord {
    cidr: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

pub struct IpFilter {
    whitelist_mode: bool,
    deny: Vec<IpRule>,
    allow: Vec<IpRule>,
    temp_bans: HashMap<IpAddr, u64>,
}

impl IpFilter {
    /// Load rules from `path`; a missing file means no rules.
    pub fn load(path: &Path, whitelist_mode: bool) -> Self {
        let mut filter = Self {
            whitelist_mode,
            deny: Vec::new(),
            allow: Vec::new(),
            temp_bans: HashMap::new(),
        };
        if let Ok(contents) = std::fs::read_to_string(path) {
            match serde_json::from_str::<PersistedRules>(&contents) {
                Ok(rules) => {
                    filter.deny = Self::parse_records(rules.deny);
                    filter.allow = Self::parse_records(rules.allow);
                    tracing::info!(
                        deny = filter.deny.len(),
                        allow = filter.allow.len(),
                        "Loaded IP rules"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Unreadable IP rules file: {e}")
                }
            }
        }
        filter
    }

    fn parse_records(records: Vec<RuleRecord>) -> Vec<IpRule> {
        records
            .into_iter()
            .filter_map(|r| match r.cidr.parse() {
                Ok(net) => Some(IpRule {
                    net,
                    expires_at: r.expires_at,
                }),
                Err(e) => {
                    tracing::warn!("Dropping unparseable IP rule: {e}");
                    None
                }
            })
            .collect()
    }

    fn purge_expired(&mut self) {
        let now = unix_now();
        self.temp_bans.retain(|_, expiry| *expiry > now);
        self.deny
            .retain(|r| r.expires_at.map_or(true, |exp| exp > now));
        self.allow
            .retain(|r| r.expires_at.map_or(true, |exp| exp > now));
    }

    /// Whether `ip` may connect right now.
    pub fn is_allowed(&mut self, ip: IpAddr) -> bool {
        self.purge_expired();
        if self.temp_bans.contains_key(&ip) {
            return false;
        }
        if self.deny.iter().any(|r| r.net.contains(ip)) {
            return false;
        }
        if self.whitelist_mode {
            return self.allow.iter().any(|r| r.net.contains(ip));
        }
        true
    }

    /// Ban an address for `minutes` (the escalation path from the
    /// connection gate).
    pub fn temp_ban(&mut self, ip: IpAddr, minutes: u64) {
        self.temp_bans.insert(ip, unix_now() + minutes * 60);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// Build a filter through the real startup path: rules file on disk.
    fn filter_from(json: &str, whitelist_mode: bool) -> IpFilter {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_rules.json");
        std::fs::write(&path, json).unwrap();
        IpFilter::load(&path, whitelist_mode)
    }

    #[test]
    fn cidr_parse_and_match_v4() {
        let net: CidrNet = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(ip("192.168.1.1")));
        assert!(net.contains(ip("192.168.1.254")));
        assert!(!net.contains(ip("192.168.2.1")));
        let host: CidrNet = "10.0.0.1".parse().unwrap();
        assert!(host.contains(ip("10.0.0.1")));
        assert!(!host.contains(ip("10.0.0.2")));
        let all: CidrNet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(ip("203.0.113.9")));
    }

    #[test]
    fn cidr_parse_and_match_v6() {
        let net: CidrNet = "2001:db8::/32".parse().unwrap();
        assert!(net.contains(ip("2001:db8::1")));
        assert!(net.contains(ip("2001:db8:ffff::1")));
        assert!(!net.contains(ip("2001:db9::1")));
        // v6 rules never match v4 addresses.
        assert!(!net.contains(ip("192.0.2.1")));
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!("not-an-ip".parse::<CidrNet>().is_err());
        assert!("10.0.0.0/33".parse::<CidrNet>().is_err());
        assert!("2001:db8::/129".parse::<CidrNet>().is_err());
    }

    #[test]
    fn missing_rules_file_allows_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut filter = IpFilter::load(&dir.path().join("ip_rules.json"), false);
        assert!(filter.is_allowed(ip("203.0.113.7")));
    }

    #[test]
    fn blacklist_mode() {
        let mut filter = filter_from(
            r#"{"deny":[{"cidr":"203.0.113.0/24"}],"allow":[]}"#,
            false,
        );
        assert!(!filter.is_allowed(ip("203.0.113.7")));
        assert!(filter.is_allowed(ip("198.51.100.7")));
    }

    #[test]
    fn whitelist_mode_allows_only_listed() {
        let mut filter = filter_from(
            r#"{"deny":[{"cidr":"10.9.0.0/16"}],"allow":[{"cidr":"10.0.0.0/8"}]}"#,
            true,
        );
        assert!(filter.is_allowed(ip("10.1.2.3")));
        assert!(!filter.is_allowed(ip("192.0.2.1")));
        // Deny rules still win inside the whitelist.
        assert!(!filter.is_allowed(ip("10.9.1.1")));
    }

    #[test]
    fn temp_ban_expires() {
        let dir = tempfile::tempdir().unwrap();
        let mut filter = IpFilter::load(&dir.path().join("ip_rules.json"), false);
        let addr = ip("198.51.100.1");
        filter.temp_ban(addr, 15);
        assert!(!filter.is_allowed(addr));
        // Force-expire.
        filter.temp_bans.insert(addr, unix_now() - 1);
        assert!(filter.is_allowed(addr));
    }

    #[test]
    fn expired_rules_are_purged() {
        let json = format!(
            r#"{{"deny":[{{"cidr":"203.0.113.0/24","expires_at":{}}}],"allow":[]}}"#,
            unix_now() - 10
        );
        let mut filter = filter_from(&json, false);
        assert!(filter.is_allowed(ip("203.0.113.5")));
        assert!(filter.deny.is_empty());
    }

    #[test]
    fn unparseable_rules_are_dropped_not_fatal() {
        let mut filter = filter_from(
            r#"{"deny":[{"cidr":"not-a-net"},{"cidr":"203.0.113.0/24"}],"allow":[]}"#,
            false,
        );
        assert!(!filter.is_allowed(ip("203.0.113.5")));
        assert!(filter.is_allowed(ip("198.51.100.5")));
        assert_eq!(filter.deny.len(), 1);
    }
}
