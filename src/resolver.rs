// Identity resolver: turns the merged observation set for a cycle into
// device rows, flags privacy-randomized MACs, and links them back to a
// stable primary identity using weighted behavioral signals.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use log::{info, warn};
use mac_oui::Oui;
use regex::Regex;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use homesense_entity::{device, device_association, prelude::*};

use crate::scan::Observation;

/// Co-occurrence counts at or above this saturate the signal at 1.0.
const CO_OCCURRENCE_SATURATION: f64 = 10.0;
/// Keep at most this many IP history entries per device.
const IP_HISTORY_LIMIT: usize = 20;

/// Relative weight of each linking signal; weights sum to 1.0 so the
/// aggregate score stays in [0, 1].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkWeights {
    pub hostname: f64,
    pub vendor: f64,
    pub co_occurrence: f64,
    pub time_windows: f64,
}

impl Default for LinkWeights {
    fn default() -> Self {
        LinkWeights {
            hostname: 0.40,
            vendor: 0.20,
            co_occurrence: 0.25,
            time_windows: 0.15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkSettings {
    pub threshold: f64,
    pub margin: f64,
    pub weights: LinkWeights,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            threshold: 0.75,
            margin: 0.10,
            weights: LinkWeights::default(),
        }
    }
}

/// True when the locally-administered bit (0x02 of the first octet) is set.
/// Modern phones set it on their per-network randomized MACs.
pub fn is_randomized_mac(mac: &str) -> bool {
    let first_octet = match mac.split(':').next().and_then(|o| u8::from_str_radix(o, 16).ok()) {
        Some(octet) => octet,
        None => return false,
    };
    first_octet & 0x02 != 0
}

// Map MAC to vendor through the OUI registry. Randomized MACs are skipped by
// the caller: their prefix is not a registered OUI.
pub fn vendor_for_mac(oui_db: &Oui, mac_address: &str) -> Option<String> {
    match oui_db.lookup_by_mac(mac_address) {
        Ok(Some(record)) => Some(record.company_name.to_string()),
        Ok(None) => None,
        Err(e) => {
            warn!("OUI lookup error for {}: {}", mac_address, e);
            None
        }
    }
}

/// Comparable behavioral features extracted from a device row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fingerprint {
    pub hostname_pattern: Option<String>,
    pub vendor: Option<String>,
    pub services: HashSet<String>,
    pub hours: HashSet<u32>,
    pub os: Option<String>,
}

pub fn fingerprint(device: &device::Model) -> Fingerprint {
    Fingerprint {
        hostname_pattern: device.hostname.as_deref().and_then(hostname_pattern),
        vendor: device.vendor.clone(),
        services: json_string_set(&device.mdns_services),
        hours: device
            .connection_hours
            .as_array()
            .map(|hours| hours.iter().filter_map(|h| h.as_u64()).map(|h| h as u32).collect())
            .unwrap_or_default(),
        os: device
            .metadata
            .get("os")
            .and_then(|os| os.as_str())
            .map(|os| os.to_string()),
    }
}

/// Reduce a hostname to a stable pattern: a known device token when present,
/// otherwise the name with digits and dashes stripped.
pub fn hostname_pattern(hostname: &str) -> Option<String> {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    let hostname = hostname.to_lowercase();
    for token in [
        "iphone", "ipad", "watch", "macbook", "android", "galaxy", "pixel",
    ] {
        if hostname.contains(token) {
            return Some(token.to_string());
        }
    }
    let strip = STRIP.get_or_init(|| Regex::new(r"[\d\-]+").expect("static regex"));
    let pattern = strip.replace_all(&hostname, "").trim().to_string();
    if pattern.is_empty() {
        None
    } else {
        Some(pattern)
    }
}

/// Weighted similarity between a randomized device and a candidate primary.
/// Each signal contributes [0, 1] scaled by its weight; with default weights
/// the aggregate is in [0, 1].
pub fn link_score(
    randomized: &Fingerprint,
    candidate: &Fingerprint,
    co_occurrence: f64,
    weights: &LinkWeights,
) -> f64 {
    let mut score = 0.0;

    if let (Some(a), Some(b)) = (&randomized.hostname_pattern, &candidate.hostname_pattern) {
        if a == b {
            score += weights.hostname;
        }
    }

    // Randomized MACs rarely resolve to a registered vendor; when either side
    // lacks one, an OS match or advertised mDNS service overlap stands in.
    match (&randomized.vendor, &candidate.vendor) {
        (Some(a), Some(b)) => {
            if a == b {
                score += weights.vendor;
            }
        }
        _ => match (&randomized.os, &candidate.os) {
            (Some(a), Some(b)) if a == b => score += weights.vendor,
            _ => score += weights.vendor * jaccard(&randomized.services, &candidate.services),
        },
    }

    score += weights.co_occurrence * co_occurrence.clamp(0.0, 1.0);
    score += weights.time_windows * jaccard(&randomized.hours, &candidate.hours);
    score
}

fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Pick the winning candidate: best score at or above the threshold, and
/// ahead of the runner-up by at least the margin (ambiguous ties link nothing).
pub fn choose_link(scores: &[(i32, f64)], threshold: f64, margin: f64) -> Option<(i32, f64)> {
    let mut sorted: Vec<(i32, f64)> = scores.to_vec();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let (best_id, best) = *sorted.first()?;
    let second = sorted.get(1).map(|(_, s)| *s).unwrap_or(0.0);
    if best >= threshold && best - second >= margin {
        Some((best_id, best))
    } else {
        None
    }
}

/// Process one cycle's merged observations: upsert devices, link randomized
/// MACs, and update co-occurrence associations. Returns the active device
/// rows as they stand after all mutations. An empty cycle is a no-op.
pub async fn process_cycle(
    db: &DatabaseConnection,
    oui_db: Option<&Oui>,
    observations: &[Observation],
    settings: &LinkSettings,
    now: DateTime<Utc>,
) -> Result<Vec<device::Model>> {
    if observations.is_empty() {
        return Ok(Vec::new());
    }

    let mut active = Vec::with_capacity(observations.len());
    for observation in observations {
        let model = upsert_device(db, oui_db, observation, now).await?;
        active.push(model);
    }

    link_randomized_devices(db, &mut active, settings, now).await?;
    update_co_occurrences(db, &active, now).await?;

    Ok(active)
}

async fn upsert_device(
    db: &DatabaseConnection,
    oui_db: Option<&Oui>,
    observation: &Observation,
    now: DateTime<Utc>,
) -> Result<device::Model> {
    let existing = Device::find()
        .filter(device::Column::MacAddress.eq(observation.mac.clone()))
        .one(db)
        .await
        .context("device lookup failed")?;

    let hostname = observation
        .hostname
        .clone()
        .or_else(|| crate::scan::host_from_ip(observation.ip));

    match existing {
        Some(model) => {
            let mut ip_history = model.ip_history.as_array().cloned().unwrap_or_default();
            if model.last_ip.as_deref() != Some(&observation.ip.to_string()) {
                ip_history.push(json!({"ip": observation.ip.to_string(), "ts": now.to_rfc3339()}));
                if ip_history.len() > IP_HISTORY_LIMIT {
                    let excess = ip_history.len() - IP_HISTORY_LIMIT;
                    ip_history.drain(0..excess);
                }
            }

            let mut services = json_string_set(&model.mdns_services);
            services.extend(observation.services.iter().cloned());
            let mut sorted_services: Vec<String> = services.into_iter().collect();
            sorted_services.sort();

            let mut hours: Vec<Value> =
                model.connection_hours.as_array().cloned().unwrap_or_default();
            let hour = json!(now.hour());
            if !hours.contains(&hour) {
                hours.push(hour);
            }

            let mut metadata = model.metadata.as_object().cloned().unwrap_or_default();
            for (key, value) in &observation.properties {
                metadata
                    .entry(key.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }

            let mut update: device::ActiveModel = model.into();
            update.last_ip = Set(Some(observation.ip.to_string()));
            if hostname.is_some() {
                update.hostname = Set(hostname);
            }
            update.last_seen = Set(now);
            update.ip_history = Set(Value::Array(ip_history));
            update.mdns_services = Set(json!(sorted_services));
            update.connection_hours = Set(Value::Array(hours));
            update.metadata = Set(Value::Object(metadata));
            update.update(db).await.context("device update failed")
        }
        None => {
            let randomized = is_randomized_mac(&observation.mac);
            let vendor = match (randomized, oui_db) {
                (false, Some(oui_db)) => vendor_for_mac(oui_db, &observation.mac),
                _ => None,
            };
            let name = match &hostname {
                Some(host) => format!("{} (auto)", host),
                None => format!(
                    "Unknown ({})",
                    observation.mac.get(12..).unwrap_or(&observation.mac)
                ),
            };
            info!("new device {} at {}", observation.mac, observation.ip);
            let mut services = observation.services.clone();
            services.sort();
            device::ActiveModel {
                mac_address: Set(observation.mac.clone()),
                name: Set(name),
                owner: Set(None),
                hostname: Set(hostname),
                vendor: Set(vendor),
                last_ip: Set(Some(observation.ip.to_string())),
                // New devices start Away; the presence tracker confirms the
                // arrival and emits the event.
                is_home: Set(false),
                is_randomized_mac: Set(randomized),
                track_presence: Set(false),
                first_seen: Set(now),
                last_seen: Set(now),
                linked_to_device_id: Set(None),
                link_confidence: Set(None),
                ip_history: Set(json!([{"ip": observation.ip.to_string(), "ts": now.to_rfc3339()}])),
                mdns_services: Set(json!(services)),
                connection_hours: Set(json!([now.hour()])),
                metadata: Set(json!(observation
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect::<serde_json::Map<String, Value>>())),
                ..Default::default()
            }
            .insert(db)
            .await
            .context("device insert failed")
        }
    }
}

async fn link_randomized_devices(
    db: &DatabaseConnection,
    active: &mut [device::Model],
    settings: &LinkSettings,
    now: DateTime<Utc>,
) -> Result<()> {
    let unlinked: Vec<usize> = active
        .iter()
        .enumerate()
        .filter(|(_, d)| d.is_randomized_mac && d.linked_to_device_id.is_none())
        .map(|(i, _)| i)
        .collect();
    if unlinked.is_empty() {
        return Ok(());
    }

    // Candidates are primaries only: stable MACs not themselves linked, so a
    // link chain can never exceed length one.
    let candidates = Device::find()
        .filter(device::Column::IsRandomizedMac.eq(false))
        .filter(device::Column::LinkedToDeviceId.is_null())
        .all(db)
        .await
        .context("link candidate query failed")?;
    if candidates.is_empty() {
        return Ok(());
    }

    for index in unlinked {
        let randomized_fp = fingerprint(&active[index]);
        let device_id = active[index].device_id;

        let mut scores = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            if candidate.device_id == device_id {
                continue;
            }
            let strength =
                co_occurrence_strength(db, device_id, candidate.device_id).await?;
            let score = link_score(
                &randomized_fp,
                &fingerprint(candidate),
                strength,
                &settings.weights,
            );
            scores.push((candidate.device_id, score));
        }

        if let Some((target_id, confidence)) =
            choose_link(&scores, settings.threshold, settings.margin)
        {
            let target = match candidates.iter().find(|c| c.device_id == target_id) {
                Some(target) => target,
                None => continue,
            };
            if let Err(reason) = validate_link(device_id, target) {
                warn!(
                    "rejecting link {} -> {}: {}",
                    active[index].mac_address, target.mac_address, reason
                );
                continue;
            }
            info!(
                "linked {} -> {} (confidence {:.2})",
                active[index].mac_address, target.name, confidence
            );
            let name = format!("{} (random MAC)", target.name);
            let track = target.track_presence;
            let mut update: device::ActiveModel = active[index].clone().into();
            update.linked_to_device_id = Set(Some(target_id));
            update.link_confidence = Set(Some(confidence));
            update.name = Set(name);
            update.track_presence = Set(track);
            update.last_seen = Set(now);
            active[index] = update.update(db).await.context("device link failed")?;
        }
    }
    Ok(())
}

// Data-integrity guard: no self-links, and the target must itself be a
// primary (chain length stays at one, so no cycles are possible).
fn validate_link(device_id: i32, target: &device::Model) -> Result<(), &'static str> {
    if target.device_id == device_id {
        return Err("device cannot link to itself");
    }
    if target.linked_to_device_id.is_some() {
        return Err("link target is not a primary device");
    }
    Ok(())
}

async fn co_occurrence_strength(
    db: &DatabaseConnection,
    device1: i32,
    device2: i32,
) -> Result<f64> {
    let (low, high) = ordered_pair(device1, device2);
    let association = DeviceAssociation::find()
        .filter(device_association::Column::Device1Id.eq(low))
        .filter(device_association::Column::Device2Id.eq(high))
        .one(db)
        .await
        .context("association lookup failed")?;
    Ok(association
        .map(|a| (a.co_occurrence_count as f64 / CO_OCCURRENCE_SATURATION).clamp(0.0, 1.0))
        .unwrap_or(0.0))
}

/// Record that every pair of devices seen this cycle was seen together.
async fn update_co_occurrences(
    db: &DatabaseConnection,
    active: &[device::Model],
    now: DateTime<Utc>,
) -> Result<()> {
    for i in 0..active.len() {
        for j in (i + 1)..active.len() {
            let (low, high) = ordered_pair(active[i].device_id, active[j].device_id);
            let existing = DeviceAssociation::find()
                .filter(device_association::Column::Device1Id.eq(low))
                .filter(device_association::Column::Device2Id.eq(high))
                .one(db)
                .await
                .context("association lookup failed")?;
            match existing {
                Some(model) => {
                    let count = model.co_occurrence_count + 1;
                    let mut update: device_association::ActiveModel = model.into();
                    update.co_occurrence_count = Set(count);
                    update.last_seen_together = Set(now);
                    update.update(db).await.context("association update failed")?;
                }
                None => {
                    device_association::ActiveModel {
                        device1_id: Set(low),
                        device2_id: Set(high),
                        association_type: Set("co_occurrence".to_string()),
                        confidence: Set(0.5),
                        co_occurrence_count: Set(1),
                        last_seen_together: Set(now),
                        ..Default::default()
                    }
                    .insert(db)
                    .await
                    .context("association insert failed")?;
                }
            }
        }
    }
    Ok(())
}

fn ordered_pair(a: i32, b: i32) -> (i32, i32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn json_string_set(value: &Value) -> HashSet<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|item| item.to_string())
                .collect()
        })
        .unwrap_or_default()
}
