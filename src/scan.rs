// Scan primitives. Each source returns normalized observations and degrades
// to an empty result (with a logged warning) rather than failing the cycle.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use dns_lookup::lookup_addr;
use serde::{Deserialize, Serialize};

pub mod arp;
pub mod mdns;
pub mod ping;
pub mod snmp;

/// Where an observation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Arp,
    Mdns,
    Snmp,
}

/// One source's report of a MAC/IP/hostname seen in the current scan cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub services: Vec<String>,
    pub properties: HashMap<String, String>,
    pub source: Source,
}

impl Observation {
    pub fn new(mac: String, ip: Ipv4Addr, source: Source) -> Self {
        Observation {
            mac,
            ip,
            hostname: None,
            services: Vec::new(),
            properties: HashMap::new(),
            source,
        }
    }
}

/// An IPv4 CIDR scan range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpRange {
    network: u32,
    prefix: u8,
}

impl IpRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == self.network
    }

    /// Iterate usable host addresses, skipping the network and broadcast
    /// addresses for prefixes shorter than /31.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (first, last) = if self.prefix >= 31 {
            (self.network, self.network | !self.mask())
        } else {
            (self.network + 1, (self.network | !self.mask()) - 1)
        };
        (first..=last).map(Ipv4Addr::from)
    }

    pub fn host_count(&self) -> u32 {
        if self.prefix >= 31 {
            2u32.pow(32 - self.prefix as u32)
        } else {
            2u32.pow(32 - self.prefix as u32) - 2
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }
}

impl FromStr for IpRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid CIDR range: {}", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| anyhow!("invalid address in range: {}", s))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| anyhow!("invalid prefix in range: {}", s))?;
        if prefix > 32 {
            return Err(anyhow!("prefix out of bounds in range: {}", s));
        }
        // A sweep larger than a /16 would take minutes per cycle.
        if prefix < 16 {
            return Err(anyhow!("range {} too large, /16 is the maximum", s));
        }
        let range = IpRange {
            network: 0,
            prefix,
        };
        let network = u32::from(addr) & range.mask();
        Ok(IpRange { network, prefix })
    }
}

/// Derive a /24 around the first non-loopback IPv4 interface address.
pub fn default_ip_range(interface: Option<&str>) -> Option<IpRange> {
    for iface in if_addrs::get_if_addrs().ok()? {
        if iface.is_loopback() {
            continue;
        }
        if let Some(name) = interface {
            if iface.name != name {
                continue;
            }
        }
        if let IpAddr::V4(addr) = iface.ip() {
            let octets = addr.octets();
            let cidr = format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]);
            return cidr.parse().ok();
        }
    }
    None
}

/// Normalize a MAC address to uppercase colon-separated form. Returns None
/// for anything that is not six hex octets, and for the broadcast address.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let cleaned = raw.trim().replace('-', ":").replace('.', ":").to_uppercase();
    let parts: Vec<String> = if cleaned.contains(':') {
        cleaned.split(':').map(|p| p.to_string()).collect()
    } else if cleaned.len() == 12 {
        cleaned
            .as_bytes()
            .chunks(2)
            .map(|c| String::from_utf8_lossy(c).to_string())
            .collect()
    } else {
        return None;
    };
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    let mac = parts.join(":");
    if mac == "FF:FF:FF:FF:FF:FF" || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac)
}

/// Merge per-source observations into one entry per MAC, combining hostnames,
/// services and properties. Earlier entries win on conflicting scalar fields.
pub fn merge_observations(observations: Vec<Observation>) -> Vec<Observation> {
    let mut merged: HashMap<String, Observation> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for obs in observations {
        match merged.get_mut(&obs.mac) {
            Some(existing) => {
                if existing.hostname.is_none() {
                    existing.hostname = obs.hostname;
                }
                for service in obs.services {
                    if !existing.services.contains(&service) {
                        existing.services.push(service);
                    }
                }
                for (key, value) in obs.properties {
                    existing.properties.entry(key).or_insert(value);
                }
            }
            None => {
                order.push(obs.mac.clone());
                merged.insert(obs.mac.clone(), obs);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|mac| merged.remove(&mac))
        .collect()
}

// Map IPv4 address to hostname via reverse DNS.
pub fn host_from_ip(ip: Ipv4Addr) -> Option<String> {
    match lookup_addr(&IpAddr::V4(ip)) {
        Ok(host) if host != ip.to_string() => Some(host),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr_and_iterates_hosts() {
        let range: IpRange = "192.168.1.0/24".parse().unwrap();
        assert_eq!(range.host_count(), 254);
        let hosts: Vec<Ipv4Addr> = range.hosts().collect();
        assert_eq!(hosts.first().unwrap().to_string(), "192.168.1.1");
        assert_eq!(hosts.last().unwrap().to_string(), "192.168.1.254");
        assert!(range.contains("192.168.1.77".parse().unwrap()));
        assert!(!range.contains("192.168.2.1".parse().unwrap()));
    }

    #[test]
    fn cidr_host_bits_are_masked_off() {
        let range: IpRange = "10.0.0.57/24".parse().unwrap();
        assert!(range.contains("10.0.0.1".parse().unwrap()));
        assert_eq!(range.hosts().next().unwrap().to_string(), "10.0.0.1");
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!("10.0.0.0".parse::<IpRange>().is_err());
        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        assert!("10.0.0.0/8".parse::<IpRange>().is_err());
        assert!("banana/24".parse::<IpRange>().is_err());
    }

    #[test]
    fn normalizes_mac_forms() {
        assert_eq!(
            normalize_mac("aa:bb:cc:11:22:33"),
            Some("AA:BB:CC:11:22:33".to_string())
        );
        assert_eq!(
            normalize_mac("aa-bb-cc-11-22-33"),
            Some("AA:BB:CC:11:22:33".to_string())
        );
        assert_eq!(
            normalize_mac("aabbcc112233"),
            Some("AA:BB:CC:11:22:33".to_string())
        );
        assert_eq!(normalize_mac("ff:ff:ff:ff:ff:ff"), None);
        assert_eq!(normalize_mac("00:00:00:00:00:00"), None);
        assert_eq!(normalize_mac("zz:bb:cc:11:22:33"), None);
        assert_eq!(normalize_mac("aa:bb:cc"), None);
    }

    #[test]
    fn merge_combines_sources_per_mac() {
        let ip: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let arp = Observation::new("AA:BB:CC:11:22:33".to_string(), ip, Source::Arp);
        let mut mdns = Observation::new("AA:BB:CC:11:22:33".to_string(), ip, Source::Mdns);
        mdns.hostname = Some("kitchen-display".to_string());
        mdns.services.push("_airplay._tcp.local.".to_string());
        let other = Observation::new(
            "DE:AD:BE:EF:00:01".to_string(),
            "192.168.1.11".parse().unwrap(),
            Source::Snmp,
        );

        let merged = merge_observations(vec![arp, mdns, other]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].hostname.as_deref(), Some("kitchen-display"));
        assert_eq!(merged[0].services.len(), 1);
        assert_eq!(merged[1].mac, "DE:AD:BE:EF:00:01");
    }
}
