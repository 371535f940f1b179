// Parallel ICMP reachability sweep. Responding hosts land in the kernel
// neighbor table, which the ARP reader then maps to MAC addresses.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::Semaphore;

use crate::scan::IpRange;

/// Probe every host in the range concurrently, capping fan-out so a /16 sweep
/// cannot exhaust sockets. Total latency is bounded by the per-host timeout,
/// not the host count.
pub async fn sweep(range: &IpRange, timeout: Duration, concurrency: usize) -> HashSet<Ipv4Addr> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::new();

    for ip in range.hosts() {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        handles.push(tokio::spawn(async move {
            let payload = [0u8; 56];
            let result =
                tokio::time::timeout(timeout, surge_ping::ping(IpAddr::V4(ip), &payload)).await;
            drop(permit);
            match result {
                Ok(Ok(_)) => (Some(ip), None),
                Ok(Err(e)) => (None, Some(e.to_string())),
                // Timeout: host is simply not answering.
                Err(_) => (None, None),
            }
        }));
    }

    let mut responding = HashSet::new();
    let mut errors = 0usize;
    let mut first_error = None;
    for handle in handles {
        if let Ok((hit, error)) = handle.await {
            if let Some(ip) = hit {
                responding.insert(ip);
            }
            if let Some(error) = error {
                errors += 1;
                first_error.get_or_insert(error);
            }
        }
    }

    if responding.is_empty() && errors > 0 {
        // Raw ICMP sockets need CAP_NET_RAW; degrade rather than kill the cycle.
        warn!(
            "ping sweep produced no results ({} probe errors, first: {})",
            errors,
            first_error.unwrap_or_default()
        );
    }

    responding
}
