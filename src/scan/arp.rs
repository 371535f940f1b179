// Kernel neighbor table reader: /proc/net/arp first, `ip neigh show` as a
// fallback. Either failing yields an empty table and a warning, never an
// error out of the scan cycle.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::warn;
use tokio::process::Command;

use crate::scan::{normalize_mac, IpRange, Observation, Source};

const PROC_NET_ARP: &str = "/proc/net/arp";

/// Read the current IP -> MAC neighbor table.
pub async fn read_table() -> HashMap<Ipv4Addr, String> {
    match tokio::fs::read_to_string(PROC_NET_ARP).await {
        Ok(contents) => parse_proc_net_arp(&contents),
        Err(_) => match Command::new("ip").args(["neigh", "show"]).output().await {
            Ok(output) if output.status.success() => {
                parse_ip_neigh(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(
                    "ip neigh exited with {}: neighbor table unavailable this cycle",
                    output.status
                );
                HashMap::new()
            }
            Err(e) => {
                warn!("no ARP source available ({}): skipping ARP this cycle", e);
                HashMap::new()
            }
        },
    }
}

/// Turn in-range neighbor entries into observations.
pub fn observations(range: &IpRange, table: &HashMap<Ipv4Addr, String>) -> Vec<Observation> {
    let mut result: Vec<Observation> = table
        .iter()
        .filter(|(ip, _)| range.contains(**ip))
        .map(|(ip, mac)| Observation::new(mac.clone(), *ip, Source::Arp))
        .collect();
    result.sort_by(|a, b| a.ip.cmp(&b.ip));
    result
}

fn parse_proc_net_arp(contents: &str) -> HashMap<Ipv4Addr, String> {
    let mut table = HashMap::new();
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        // Flags 0x0 marks an incomplete entry.
        if fields[2] == "0x0" {
            continue;
        }
        let ip = match fields[0].parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        if let Some(mac) = normalize_mac(fields[3]) {
            table.insert(ip, mac);
        }
    }
    table
}

fn parse_ip_neigh(output: &str) -> HashMap<Ipv4Addr, String> {
    let mut table = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let ip = match fields.first().and_then(|f| f.parse::<Ipv4Addr>().ok()) {
            Some(ip) => ip,
            None => continue,
        };
        // Entries without an lladdr (FAILED, INCOMPLETE) carry no MAC.
        let mac = fields
            .windows(2)
            .find(|pair| pair[0] == "lladdr")
            .and_then(|pair| normalize_mac(pair[1]));
        if let Some(mac) = mac {
            table.insert(ip, mac);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_net_arp() {
        let contents = "IP address       HW type     Flags       HW address            Mask     Device\n\
                        192.168.1.1      0x1         0x2         a4:2b:b0:c9:1b:ce     *        wlan0\n\
                        192.168.1.50     0x1         0x0         00:00:00:00:00:00     *        wlan0\n\
                        192.168.1.23     0x1         0x2         de:ad:be:ef:00:01     *        wlan0\n";
        let table = parse_proc_net_arp(contents);
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(&"192.168.1.1".parse().unwrap()).unwrap(),
            "A4:2B:B0:C9:1B:CE"
        );
        // Incomplete entry must be skipped.
        assert!(!table.contains_key(&"192.168.1.50".parse().unwrap()));
    }

    #[test]
    fn parses_ip_neigh_output() {
        let output = "192.168.1.1 dev wlan0 lladdr a4:2b:b0:c9:1b:ce REACHABLE\n\
                      192.168.1.99 dev wlan0 FAILED\n\
                      fe80::1 dev wlan0 lladdr a4:2b:b0:c9:1b:ce router STALE\n\
                      192.168.1.23 dev eth0 lladdr de:ad:be:ef:00:01 STALE\n";
        let table = parse_ip_neigh(output);
        assert_eq!(table.len(), 2);
        assert!(table.contains_key(&"192.168.1.23".parse().unwrap()));
        assert!(!table.contains_key(&"192.168.1.99".parse().unwrap()));
    }

    #[test]
    fn observations_filter_to_range() {
        let range: IpRange = "192.168.1.0/24".parse().unwrap();
        let mut table = HashMap::new();
        table.insert(
            "192.168.1.23".parse().unwrap(),
            "DE:AD:BE:EF:00:01".to_string(),
        );
        table.insert(
            "10.1.2.3".parse().unwrap(),
            "AA:BB:CC:11:22:33".to_string(),
        );
        let observations = observations(&range, &table);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].mac, "DE:AD:BE:EF:00:01");
        assert_eq!(observations[0].source, Source::Arp);
    }
}
