// Optional SNMP enrichment: walk a router or access point's
// ipNetToMediaPhysAddress table for an authoritative IP -> MAC mapping.
// A fresh client (and socket) is created per attempt and dropped with it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use csnmp::{ObjectIdentifier, ObjectValue, Snmp2cClient};
use log::warn;

use crate::scan::{normalize_mac, Observation, Source};

// IP-MIB ipNetToMediaPhysAddress: suffix is {ifIndex}.{ip octets}.
const PHYS_ADDRESS_OID: &str = "1.3.6.1.2.1.4.22.1.2";
const SNMP_PORT: u16 = 161;

/// Fetch the client table from an SNMP target. Any failure is non-fatal: the
/// source is simply omitted from the merge for this cycle.
pub async fn fetch_client_table(
    target: &str,
    community: &str,
    timeout: Duration,
) -> Vec<Observation> {
    match walk_client_table(target, community, timeout).await {
        Ok(observations) => observations,
        Err(e) => {
            warn!("snmp client table fetch from {} failed: {:#}", target, e);
            Vec::new()
        }
    }
}

async fn walk_client_table(
    target: &str,
    community: &str,
    timeout: Duration,
) -> Result<Vec<Observation>> {
    let ip: IpAddr = target
        .parse()
        .map_err(|_| anyhow!("invalid snmp target address: {}", target))?;
    let client = Snmp2cClient::new(
        SocketAddr::new(ip, SNMP_PORT),
        community.as_bytes().to_vec(),
        None,
        Some(timeout),
        0,
    )
    .await
    .context("snmp client setup failed")?;

    let top: ObjectIdentifier = PHYS_ADDRESS_OID
        .parse()
        .map_err(|_| anyhow!("invalid OID {}", PHYS_ADDRESS_OID))?;
    let table = client.walk(top).await.context("snmp walk failed")?;

    let mut observations = Vec::new();
    for (oid, value) in table {
        let bytes = match &value {
            ObjectValue::String(bytes) => bytes,
            _ => continue,
        };
        if bytes.len() != 6 {
            continue;
        }
        let mac = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<String>>()
            .join(":");
        let mac = match normalize_mac(&mac) {
            Some(mac) => mac,
            None => continue,
        };
        let ip = match ip_from_oid_suffix(&oid.to_string()) {
            Some(ip) => ip,
            None => continue,
        };
        observations.push(Observation::new(mac, ip, Source::Snmp));
    }
    Ok(observations)
}

// The walked OID ends in the four octets of the client IP.
fn ip_from_oid_suffix(oid: &str) -> Option<Ipv4Addr> {
    let segments: Vec<&str> = oid.split('.').collect();
    if segments.len() < 4 {
        return None;
    }
    let octets: Vec<u8> = segments[segments.len() - 4..]
        .iter()
        .map(|s| s.parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;
    Some(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip_from_oid_suffix() {
        assert_eq!(
            ip_from_oid_suffix("1.3.6.1.2.1.4.22.1.2.4.192.168.1.23"),
            Some("192.168.1.23".parse().unwrap())
        );
        assert_eq!(ip_from_oid_suffix("1.2.3"), None);
        assert_eq!(ip_from_oid_suffix("1.3.6.1.2.1.4.22.1.2.4.192.168.1.999"), None);
    }

    #[tokio::test]
    async fn unreachable_target_degrades_to_empty() {
        // No SNMP agent answers on localhost:161 with this community; the
        // fetch must not panic and must return nothing.
        let observations =
            fetch_client_table("127.0.0.1", "public", Duration::from_millis(50)).await;
        assert!(observations.is_empty());
    }
}
