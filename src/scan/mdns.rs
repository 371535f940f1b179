// mDNS service discovery. A fresh daemon browses a fixed set of service types
// for a bounded window each cycle; resolved records are keyed by IP and later
// correlated to MACs through the ARP table.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};

use crate::scan::{Observation, Source};

const SERVICE_TYPES: &[&str] = &[
    "_device-info._tcp.local.",
    "_workstation._tcp.local.",
    "_airplay._tcp.local.",
    "_googlecast._tcp.local.",
    "_http._tcp.local.",
];

#[derive(Clone, Debug, Default)]
pub struct MdnsRecord {
    pub hostname: Option<String>,
    pub services: HashSet<String>,
    pub properties: HashMap<String, String>,
}

/// Browse for the configured window and collect what resolved, per IP.
pub async fn browse(window: Duration) -> HashMap<Ipv4Addr, MdnsRecord> {
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(e) => {
            warn!("mdns daemon unavailable ({}): skipping mdns this cycle", e);
            return HashMap::new();
        }
    };

    let mut receivers = Vec::new();
    for service_type in SERVICE_TYPES {
        match daemon.browse(service_type) {
            Ok(receiver) => receivers.push((service_type.to_string(), receiver)),
            Err(e) => debug!("mdns browse of {} failed: {}", service_type, e),
        }
    }

    let mut records: HashMap<Ipv4Addr, MdnsRecord> = HashMap::new();
    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        for (service_type, receiver) in &receivers {
            while let Ok(event) = receiver.try_recv() {
                if let ServiceEvent::ServiceResolved(info) = event {
                    let hostname = info
                        .get_hostname()
                        .trim_end_matches('.')
                        .trim_end_matches(".local")
                        .to_string();
                    let properties: Vec<(String, String)> = info
                        .get_properties()
                        .iter()
                        .map(|p| (p.key().to_string(), p.val_str().to_string()))
                        .collect();
                    for address in info.get_addresses().iter() {
                        let ip: Ipv4Addr = match address.to_string().parse() {
                            Ok(ip) => ip,
                            Err(_) => continue,
                        };
                        let record = records.entry(ip).or_default();
                        if !hostname.is_empty() {
                            record.hostname = Some(hostname.clone());
                        }
                        record.services.insert(service_type.clone());
                        for (key, value) in &properties {
                            record
                                .properties
                                .entry(key.clone())
                                .or_insert_with(|| value.clone());
                        }
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = daemon.shutdown();
    records
}

/// Attach mDNS records to ARP-discovered MACs.
pub fn observations(
    records: &HashMap<Ipv4Addr, MdnsRecord>,
    arp_table: &HashMap<Ipv4Addr, String>,
) -> Vec<Observation> {
    let mut result = Vec::new();
    for (ip, record) in records {
        // Without an ARP entry there is no MAC to attribute the record to.
        let mac = match arp_table.get(ip) {
            Some(mac) => mac.clone(),
            None => continue,
        };
        let mut observation = Observation::new(mac, *ip, Source::Mdns);
        observation.hostname = record.hostname.clone();
        observation.services = {
            let mut services: Vec<String> = record.services.iter().cloned().collect();
            services.sort();
            services
        };
        observation.properties = record.properties.clone();
        result.push(observation);
    }
    result.sort_by(|a, b| a.ip.cmp(&b.ip));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_without_arp_entries_are_dropped() {
        let ip: Ipv4Addr = "192.168.1.30".parse().unwrap();
        let orphan: Ipv4Addr = "192.168.1.31".parse().unwrap();
        let mut records = HashMap::new();
        records.insert(
            ip,
            MdnsRecord {
                hostname: Some("living-room-tv".to_string()),
                services: HashSet::from(["_googlecast._tcp.local.".to_string()]),
                properties: HashMap::new(),
            },
        );
        records.insert(orphan, MdnsRecord::default());

        let mut arp_table = HashMap::new();
        arp_table.insert(ip, "AA:BB:CC:11:22:33".to_string());

        let observations = observations(&records, &arp_table);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].mac, "AA:BB:CC:11:22:33");
        assert_eq!(observations[0].hostname.as_deref(), Some("living-room-tv"));
        assert_eq!(observations[0].source, Source::Mdns);
    }
}
