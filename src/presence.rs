// Presence tracking. A pure ledger debounces per-device state (one missed
// scan is not a departure), and the scanner service drives the full cycle:
// sweep, collect, merge, resolve, then apply transitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use mac_oui::Oui;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use homesense_entity::{device, network_snapshot, presence_event, prelude::*};

use crate::events::{EngineEvent, EventBus, PresenceUpdate};
use crate::resolver::{self, LinkSettings};
use crate::scan::{self, arp, mdns, ping, snmp, IpRange};
use crate::service::Service;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub interval_seconds: u64,
    /// CIDR range to sweep; derived from the first usable interface when unset.
    pub ip_range: Option<String>,
    pub interface: Option<String>,
    pub ping_timeout_ms: u64,
    pub ping_concurrency: usize,
    pub mdns_window_ms: u64,
    /// Router or AP to query over SNMP; the source is skipped when unset.
    pub snmp_target: Option<String>,
    pub snmp_community: String,
    pub snmp_timeout_ms: u64,
    /// Consecutive missed scans before a device is marked away.
    pub miss_threshold: u32,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            interval_seconds: 60,
            ip_range: None,
            interface: None,
            ping_timeout_ms: 1000,
            ping_concurrency: 32,
            mdns_window_ms: 3000,
            snmp_target: None,
            snmp_community: "public".to_string(),
            snmp_timeout_ms: 2000,
            miss_threshold: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Arrived,
    Left,
}

#[derive(Clone, Debug)]
struct DeviceState {
    home: bool,
    misses: u32,
}

/// Per-device presence state with departure debounce. Arrivals are immediate;
/// departures require `miss_threshold` consecutive missed cycles.
#[derive(Clone, Debug)]
pub struct Ledger {
    pub miss_threshold: u32,
    states: HashMap<i32, DeviceState>,
}

impl Ledger {
    pub fn new(miss_threshold: u32) -> Ledger {
        Ledger {
            miss_threshold: miss_threshold.max(1),
            states: HashMap::new(),
        }
    }

    /// Adopt persisted state at startup so a restart does not replay events.
    pub fn seed(&mut self, device_id: i32, is_home: bool) {
        self.states.insert(
            device_id,
            DeviceState {
                home: is_home,
                misses: 0,
            },
        );
    }

    /// Fold one cycle's observed device ids into the ledger and return the
    /// transitions it caused, ordered by device id.
    pub fn cycle(&mut self, observed: &HashSet<i32>) -> Vec<(i32, Transition)> {
        let mut transitions = Vec::new();

        for &device_id in observed {
            let state = self.states.entry(device_id).or_insert(DeviceState {
                home: false,
                misses: 0,
            });
            state.misses = 0;
            if !state.home {
                state.home = true;
                transitions.push((device_id, Transition::Arrived));
            }
        }

        for (&device_id, state) in self.states.iter_mut() {
            if observed.contains(&device_id) || !state.home {
                continue;
            }
            state.misses += 1;
            if state.misses >= self.miss_threshold {
                state.home = false;
                state.misses = 0;
                transitions.push((device_id, Transition::Left));
            }
        }

        transitions.sort_by_key(|(device_id, _)| *device_id);
        transitions
    }
}

/// Per-cycle {mac, ip} rollup of the devices actually observed, ordered by
/// MAC for stable replay.
fn snapshot_entries(active: &[device::Model]) -> Value {
    let mut entries: Vec<Value> = active
        .iter()
        .map(|d| json!({"mac": d.mac_address, "ip": d.last_ip}))
        .collect();
    entries.sort_by(|a, b| a["mac"].as_str().cmp(&b["mac"].as_str()));
    Value::Array(entries)
}

/// The scanning service: one cycle sweeps the network, merges every source's
/// observations, resolves identities, and applies presence transitions.
pub struct PresenceScanner {
    db: DatabaseConnection,
    oui_db: Option<Arc<Oui>>,
    settings: Arc<Mutex<ScanSettings>>,
    link: LinkSettings,
    bus: EventBus,
    ledger: Ledger,
    interval: Duration,
}

impl PresenceScanner {
    pub fn new(
        db: DatabaseConnection,
        oui_db: Option<Arc<Oui>>,
        settings: ScanSettings,
        link: LinkSettings,
        bus: EventBus,
    ) -> PresenceScanner {
        let ledger = Ledger::new(settings.miss_threshold);
        let interval = Duration::from_secs(settings.interval_seconds.max(1));
        PresenceScanner {
            db,
            oui_db,
            settings: Arc::new(Mutex::new(settings)),
            link,
            bus,
            ledger,
            interval,
        }
    }

    /// Shared handle for swapping scan parameters between cycles. The cycle
    /// interval itself is fixed at spawn.
    pub fn settings_handle(&self) -> Arc<Mutex<ScanSettings>> {
        self.settings.clone()
    }

    /// A primary seen only through a linked randomized MAC is still seen:
    /// refresh its `last_seen` so it does not look stale while home.
    async fn touch_linked_primaries(
        &self,
        active: &[device::Model],
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<i32>> {
        let seen: HashSet<i32> = active.iter().map(|d| d.device_id).collect();
        let mut touched = Vec::new();
        for primary_id in active.iter().filter_map(|d| d.linked_to_device_id) {
            if seen.contains(&primary_id) || touched.contains(&primary_id) {
                continue;
            }
            let primary = Device::find_by_id(primary_id)
                .one(&self.db)
                .await
                .context("linked primary lookup failed")?;
            if let Some(primary) = primary {
                let mut update: device::ActiveModel = primary.into();
                update.last_seen = Set(now);
                update
                    .update(&self.db)
                    .await
                    .context("linked primary update failed")?;
                touched.push(primary_id);
            }
        }
        touched.sort_unstable();
        Ok(touched)
    }

    async fn apply_transition(
        &self,
        device_id: i32,
        transition: Transition,
        active: &[device::Model],
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        // Linked primaries transition without being directly observed.
        let model = match active.iter().find(|d| d.device_id == device_id) {
            Some(model) => model.clone(),
            None => Device::find_by_id(device_id)
                .one(&self.db)
                .await
                .context("device lookup failed")?
                .ok_or_else(|| anyhow!("device {} missing during transition", device_id))?,
        };

        let arrived = transition == Transition::Arrived;
        let event_type = if arrived { "arrived" } else { "left" };
        // Both directions snapshot the last known IP at transition time.
        let ip_address = model.last_ip.clone();
        info!("{} {} [{}]", model.name, event_type, model.mac_address);

        let mut update: device::ActiveModel = model.clone().into();
        update.is_home = Set(arrived);
        update.update(&self.db).await.context("presence update failed")?;

        presence_event::ActiveModel {
            device_id: Set(device_id),
            event_type: Set(event_type.to_string()),
            timestamp: Set(now),
            ip_address: Set(ip_address.clone()),
            hostname: Set(model.hostname.clone()),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .context("presence event insert failed")?;

        self.bus.emit(EngineEvent::Presence(PresenceUpdate {
            device_id,
            device_name: model.name,
            event_type: event_type.to_string(),
            timestamp: now,
            ip_address,
        }));
        Ok(())
    }
}

#[async_trait]
impl Service for PresenceScanner {
    fn name(&self) -> &str {
        "presence scanner"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn setup(&mut self) -> Result<()> {
        let devices = Device::find()
            .all(&self.db)
            .await
            .context("presence state load failed")?;
        for device in &devices {
            self.ledger.seed(device.device_id, device.is_home);
        }
        info!("seeded presence state for {} devices", devices.len());
        Ok(())
    }

    async fn cycle(&mut self) -> Result<()> {
        let snapshot = self.settings.lock().await.clone();
        let range = match &snapshot.ip_range {
            Some(range) => range
                .parse::<IpRange>()
                .with_context(|| format!("bad ip_range {}", range))?,
            None => scan::default_ip_range(snapshot.interface.as_deref())
                .ok_or_else(|| anyhow!("no usable IPv4 interface to derive a scan range"))?,
        };

        let responding = ping::sweep(
            &range,
            Duration::from_millis(snapshot.ping_timeout_ms),
            snapshot.ping_concurrency,
        )
        .await;
        debug!(
            "{} of {} swept hosts answered",
            responding.len(),
            range.host_count()
        );

        let arp_table = arp::read_table().await;
        let mut observations = arp::observations(&range, &arp_table);

        let records = mdns::browse(Duration::from_millis(snapshot.mdns_window_ms)).await;
        observations.extend(mdns::observations(&records, &arp_table));

        if let Some(target) = &snapshot.snmp_target {
            observations.extend(
                snmp::fetch_client_table(
                    target,
                    &snapshot.snmp_community,
                    Duration::from_millis(snapshot.snmp_timeout_ms),
                )
                .await,
            );
        }

        let merged = scan::merge_observations(observations);
        let now = Utc::now();
        let active =
            resolver::process_cycle(&self.db, self.oui_db.as_deref(), &merged, &self.link, now)
                .await?;

        // A linked randomized MAC counts as a sighting of its primary.
        let mut observed: HashSet<i32> = active.iter().map(|d| d.device_id).collect();
        observed.extend(active.iter().filter_map(|d| d.linked_to_device_id));
        self.touch_linked_primaries(&active, now).await?;

        self.ledger.miss_threshold = snapshot.miss_threshold.max(1);
        let transitions = self.ledger.cycle(&observed);
        for (device_id, transition) in &transitions {
            self.apply_transition(*device_id, *transition, &active, now)
                .await?;
        }

        network_snapshot::ActiveModel {
            timestamp: Set(now),
            device_count: Set(active.len() as i32),
            devices_present: Set(snapshot_entries(&active)),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .context("snapshot insert failed")?;

        debug!(
            "cycle complete: {} present, {} transitions",
            active.len(),
            transitions.len()
        );
        Ok(())
    }
}
