// Local hardware polling. Active units live in a slot list behind a short
// outer lock that is never held across I/O; each unit has its own lock for
// reads. Configuration reloads build the replacement units first and swap
// the slot list in one step, so a concurrent poll never sees a torn mix of
// old and new units.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::Deserialize;
use tokio::sync::Mutex;

use homesense_entity::{hardware, hardware_event, prelude::*};

use crate::events::{EngineEvent, EventBus, HardwareUpdate};
use crate::service::Service;

pub struct Reading {
    pub value: f64,
    pub unit: String,
}

/// One polled hardware unit. Strategies degrade to reporting nothing when
/// their backing device is absent; they never take the poller down.
#[async_trait]
pub trait HardwareStrategy: Send + Sync {
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read(&mut self) -> Option<Reading>;

    async fn teardown(&mut self) {}
}

/// Digest of everything that defines a unit's runtime shape; a changed
/// fingerprint means the unit must be rebuilt on reload.
pub fn fingerprint(model: &hardware::Model) -> String {
    format!("{}|{}|{}", model.driver, model.name, model.configuration)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GpioConfig {
    pin: Option<u32>,
    /// Explicit value file; overrides the sysfs path derived from `pin`.
    value_path: Option<PathBuf>,
    active_low: bool,
    debounce_ms: u64,
    unit: String,
}

impl Default for GpioConfig {
    fn default() -> Self {
        GpioConfig {
            pin: None,
            value_path: None,
            active_low: false,
            debounce_ms: 50,
            unit: "state".to_string(),
        }
    }
}

impl GpioConfig {
    fn path(&self) -> Result<PathBuf> {
        match (&self.value_path, self.pin) {
            (Some(path), _) => Ok(path.clone()),
            (None, Some(pin)) => Ok(PathBuf::from(format!("/sys/class/gpio/gpio{}/value", pin))),
            (None, None) => Err(anyhow!("gpio configuration needs a pin or value_path")),
        }
    }
}

async fn read_gpio_bit(path: &PathBuf, active_low: bool) -> Result<f64> {
    let raw = tokio::fs::read_to_string(path).await?;
    let bit = match raw.trim() {
        "0" => 0.0,
        "1" => 1.0,
        other => return Err(anyhow!("unexpected gpio value {:?}", other)),
    };
    Ok(if active_low { 1.0 - bit } else { bit })
}

/// Debounced binary input (door contact, motion sensor). A level change is
/// only accepted once it has held across the debounce window.
pub struct GpioBinaryStrategy {
    name: String,
    path: PathBuf,
    active_low: bool,
    debounce: Duration,
    unit: String,
    stable: Option<f64>,
    candidate: Option<(f64, tokio::time::Instant)>,
    warned: bool,
}

#[async_trait]
impl HardwareStrategy for GpioBinaryStrategy {
    async fn setup(&mut self) -> Result<()> {
        // An absent device leaves the unit inert rather than failing setup.
        if let Err(e) = tokio::fs::metadata(&self.path).await {
            warn!(
                "{}: {} unavailable ({}), unit starts inert",
                self.name,
                self.path.display(),
                e
            );
            self.warned = true;
        } else {
            info!("{} reading {}", self.name, self.path.display());
        }
        Ok(())
    }

    async fn read(&mut self) -> Option<Reading> {
        let value = match read_gpio_bit(&self.path, self.active_low).await {
            Ok(value) => {
                self.warned = false;
                value
            }
            Err(e) => {
                if !self.warned {
                    warn!("{} read failed ({}), reporting nothing", self.name, e);
                    self.warned = true;
                }
                return None;
            }
        };

        let now = tokio::time::Instant::now();
        match self.stable {
            None => self.stable = Some(value),
            Some(stable) if stable == value => self.candidate = None,
            Some(_) if self.debounce.is_zero() => {
                self.stable = Some(value);
                self.candidate = None;
            }
            Some(_) => match self.candidate {
                Some((candidate, since)) if candidate == value => {
                    if now.duration_since(since) >= self.debounce {
                        self.stable = Some(value);
                        self.candidate = None;
                    }
                }
                _ => self.candidate = Some((value, now)),
            },
        }

        self.stable.map(|value| Reading {
            value,
            unit: self.unit.clone(),
        })
    }
}

/// Relay state readback: reports the driven level without debounce.
pub struct GpioRelayStrategy {
    name: String,
    path: PathBuf,
    active_low: bool,
    unit: String,
    warned: bool,
}

#[async_trait]
impl HardwareStrategy for GpioRelayStrategy {
    async fn setup(&mut self) -> Result<()> {
        if let Err(e) = tokio::fs::metadata(&self.path).await {
            warn!(
                "{}: {} unavailable ({}), unit starts inert",
                self.name,
                self.path.display(),
                e
            );
            self.warned = true;
        }
        Ok(())
    }

    async fn read(&mut self) -> Option<Reading> {
        match read_gpio_bit(&self.path, self.active_low).await {
            Ok(value) => {
                self.warned = false;
                Some(Reading {
                    value,
                    unit: self.unit.clone(),
                })
            }
            Err(e) => {
                if !self.warned {
                    warn!("{} read failed ({}), reporting nothing", self.name, e);
                    self.warned = true;
                }
                None
            }
        }
    }
}

/// Instantiate the strategy a hardware row asks for.
pub fn build_strategy(model: &hardware::Model) -> Result<Box<dyn HardwareStrategy>> {
    let config: GpioConfig = serde_json::from_value(model.configuration.clone())
        .with_context(|| format!("bad configuration for hardware {}", model.name))?;
    let path = config.path()?;
    match model.driver.as_str() {
        "gpio_binary" => Ok(Box::new(GpioBinaryStrategy {
            name: model.name.clone(),
            path,
            active_low: config.active_low,
            debounce: Duration::from_millis(config.debounce_ms),
            unit: config.unit,
            stable: None,
            candidate: None,
            warned: false,
        })),
        "gpio_relay" => Ok(Box::new(GpioRelayStrategy {
            name: model.name.clone(),
            path,
            active_low: config.active_low,
            unit: config.unit,
            warned: false,
        })),
        other => Err(anyhow!("unknown hardware driver {:?}", other)),
    }
}

/// Reload actions keyed by hardware id, derived purely from fingerprints.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    pub keep: Vec<i32>,
    pub replace: Vec<i32>,
    pub add: Vec<i32>,
    pub remove: Vec<i32>,
}

/// Diff running fingerprints against the configured set. Every existing id
/// lands in exactly one of keep/replace/remove, every incoming id in exactly
/// one of keep/replace/add.
pub fn plan_reload(existing: &HashMap<i32, String>, incoming: &HashMap<i32, String>) -> ReloadPlan {
    let mut plan = ReloadPlan::default();
    for (&id, fingerprint) in incoming {
        match existing.get(&id) {
            Some(current) if current == fingerprint => plan.keep.push(id),
            Some(_) => plan.replace.push(id),
            None => plan.add.push(id),
        }
    }
    for &id in existing.keys() {
        if !incoming.contains_key(&id) {
            plan.remove.push(id);
        }
    }
    plan.keep.sort_unstable();
    plan.replace.sort_unstable();
    plan.add.sort_unstable();
    plan.remove.sort_unstable();
    plan
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub kept: usize,
    pub replaced: usize,
    pub added: usize,
    pub removed: usize,
}

/// An active unit. The outer slot list is cloned under a brief lock; the
/// strategy's own lock serializes reads with teardown.
#[derive(Clone)]
struct UnitSlot {
    hardware_id: i32,
    name: String,
    fingerprint: String,
    strategy: Arc<Mutex<Box<dyn HardwareStrategy>>>,
}

struct Inner {
    db: DatabaseConnection,
    bus: EventBus,
    interval: Duration,
    units: Mutex<Vec<UnitSlot>>,
    last_values: Mutex<HashMap<i32, f64>>,
}

/// The polling service. Clones share one unit set, so a clone held by the
/// signal handler can reload configuration while the scheduler drives the
/// cycles.
#[derive(Clone)]
pub struct HardwarePoller {
    inner: Arc<Inner>,
}

impl HardwarePoller {
    pub fn new(db: DatabaseConnection, bus: EventBus, interval: Duration) -> HardwarePoller {
        HardwarePoller {
            inner: Arc::new(Inner {
                db,
                bus,
                interval,
                units: Mutex::new(Vec::new()),
                last_values: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Rebuild the unit set from the enabled hardware rows. New units are
    /// constructed and set up before the swap; unchanged units keep their
    /// running instance (and accumulated debounce state), and the swap
    /// itself is a single locked assignment.
    pub async fn reload_config(&self) -> Result<ReloadSummary> {
        let rows = Hardware::find()
            .filter(hardware::Column::Enabled.eq(true))
            .all(&self.inner.db)
            .await
            .context("hardware configuration load failed")?;

        let mut incoming_models: HashMap<i32, hardware::Model> = HashMap::new();
        let mut incoming_fps: HashMap<i32, String> = HashMap::new();
        for row in rows {
            incoming_fps.insert(row.hardware_id, fingerprint(&row));
            incoming_models.insert(row.hardware_id, row);
        }

        let existing_fps: HashMap<i32, String> = {
            let units = self.inner.units.lock().await;
            units
                .iter()
                .map(|slot| (slot.hardware_id, slot.fingerprint.clone()))
                .collect()
        };
        let plan = plan_reload(&existing_fps, &incoming_fps);

        // Construct replacements while the old set keeps serving polls.
        let mut built: Vec<UnitSlot> = Vec::new();
        for id in plan.add.iter().chain(plan.replace.iter()) {
            let model = match incoming_models.get(id) {
                Some(model) => model,
                None => continue,
            };
            match build_strategy(model) {
                Ok(mut strategy) => {
                    if let Err(e) = strategy.setup().await {
                        warn!("hardware {} setup failed ({:#}), skipping", model.name, e);
                        continue;
                    }
                    built.push(UnitSlot {
                        hardware_id: model.hardware_id,
                        name: model.name.clone(),
                        fingerprint: fingerprint(model),
                        strategy: Arc::new(Mutex::new(strategy)),
                    });
                }
                Err(e) => warn!("hardware {} rejected: {:#}", model.name, e),
            }
        }

        let retired: Vec<UnitSlot> = {
            let mut units = self.inner.units.lock().await;
            let mut next: Vec<UnitSlot> = Vec::with_capacity(plan.keep.len() + built.len());
            let mut retired = Vec::new();
            for slot in units.drain(..) {
                if plan.keep.contains(&slot.hardware_id) {
                    next.push(slot);
                } else {
                    retired.push(slot);
                }
            }
            next.append(&mut built);
            next.sort_by_key(|slot| slot.hardware_id);
            *units = next;
            retired
        };

        // Any in-flight read of a retired unit finishes before its teardown.
        for slot in retired {
            slot.strategy.lock().await.teardown().await;
        }
        {
            let mut last_values = self.inner.last_values.lock().await;
            for id in plan.remove.iter().chain(plan.replace.iter()) {
                last_values.remove(id);
            }
        }

        let summary = ReloadSummary {
            kept: plan.keep.len(),
            replaced: plan.replace.len(),
            added: plan.add.len(),
            removed: plan.remove.len(),
        };
        info!(
            "hardware reload: {} kept, {} replaced, {} added, {} removed",
            summary.kept, summary.replaced, summary.added, summary.removed
        );
        Ok(summary)
    }

    pub async fn unit_count(&self) -> usize {
        self.inner.units.lock().await.len()
    }
}

#[async_trait]
impl Service for HardwarePoller {
    fn name(&self) -> &str {
        "hardware poller"
    }

    fn interval(&self) -> Duration {
        self.inner.interval
    }

    async fn setup(&mut self) -> Result<()> {
        self.reload_config().await?;
        Ok(())
    }

    async fn cycle(&mut self) -> Result<()> {
        // Snapshot the slot list; the outer lock is not held across reads.
        let slots: Vec<UnitSlot> = self.inner.units.lock().await.clone();

        let mut readings: Vec<(i32, String, Reading)> = Vec::new();
        for slot in &slots {
            let mut strategy = slot.strategy.lock().await;
            if let Some(reading) = strategy.read().await {
                readings.push((slot.hardware_id, slot.name.clone(), reading));
            }
        }

        let now = Utc::now();
        let mut last_values = self.inner.last_values.lock().await;
        for (hardware_id, name, reading) in readings {
            let unchanged = last_values
                .get(&hardware_id)
                .is_some_and(|previous| *previous == reading.value);
            if unchanged {
                continue;
            }
            last_values.insert(hardware_id, reading.value);
            debug!("{} -> {} {}", name, reading.value, reading.unit);

            hardware_event::ActiveModel {
                hardware_id: Set(hardware_id),
                value: Set(reading.value),
                unit: Set(reading.unit.clone()),
                timestamp: Set(now),
                ..Default::default()
            }
            .insert(&self.inner.db)
            .await
            .context("hardware event insert failed")?;

            self.inner.bus.emit(EngineEvent::Hardware(HardwareUpdate {
                hardware_id,
                name,
                value: reading.value,
                unit: reading.unit,
                timestamp: now,
            }));
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        let slots: Vec<UnitSlot> = {
            let mut units = self.inner.units.lock().await;
            units.drain(..).collect()
        };
        for slot in slots {
            slot.strategy.lock().await.teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use sea_orm::Database;
    use serde_json::json;

    fn fps(pairs: &[(i32, &str)]) -> HashMap<i32, String> {
        pairs.iter().map(|(id, fp)| (*id, fp.to_string())).collect()
    }

    #[test]
    fn reload_plan_classifies_each_unit_once() {
        let existing = fps(&[(1, "a"), (2, "b"), (3, "c")]);
        let incoming = fps(&[(1, "a"), (2, "b2"), (4, "d")]);
        let plan = plan_reload(&existing, &incoming);
        assert_eq!(plan.keep, vec![1]);
        assert_eq!(plan.replace, vec![2]);
        assert_eq!(plan.add, vec![4]);
        assert_eq!(plan.remove, vec![3]);

        // No unit is lost or duplicated by the diff.
        let old_side: HashSet<i32> = plan
            .keep
            .iter()
            .chain(plan.replace.iter())
            .chain(plan.remove.iter())
            .copied()
            .collect();
        assert_eq!(old_side, existing.keys().copied().collect());
        let new_side: HashSet<i32> = plan
            .keep
            .iter()
            .chain(plan.replace.iter())
            .chain(plan.add.iter())
            .copied()
            .collect();
        assert_eq!(new_side, incoming.keys().copied().collect());
    }

    #[test]
    fn reload_plan_of_identical_sets_keeps_everything() {
        let set = fps(&[(1, "a"), (2, "b")]);
        let plan = plan_reload(&set, &set);
        assert_eq!(plan.keep, vec![1, 2]);
        assert!(plan.replace.is_empty() && plan.add.is_empty() && plan.remove.is_empty());
    }

    fn hardware_model(hardware_id: i32, name: &str, config: serde_json::Value) -> hardware::Model {
        hardware::Model {
            hardware_id,
            name: name.to_string(),
            enabled: true,
            driver: "gpio_binary".to_string(),
            configuration: config,
        }
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let mut model = hardware_model(1, "mystery", json!({"pin": 4}));
        model.driver = "dht22".to_string();
        assert!(build_strategy(&model).is_err());
    }

    #[test]
    fn gpio_config_requires_a_source() {
        let model = hardware_model(1, "pinless", json!({}));
        assert!(build_strategy(&model).is_err());
        let model = hardware_model(1, "pinned", json!({"pin": 17}));
        assert!(build_strategy(&model).is_ok());
    }

    fn value_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("homesense-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn binary_input_debounces_level_changes() {
        let path = value_file("debounce", "0\n");
        let model = hardware_model(
            5,
            "front door",
            json!({"value_path": path, "debounce_ms": 30}),
        );
        let mut strategy = build_strategy(&model).unwrap();
        strategy.setup().await.unwrap();

        assert_eq!(strategy.read().await.unwrap().value, 0.0);

        // A change must hold for the debounce window before it is reported.
        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(strategy.read().await.unwrap().value, 0.0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(strategy.read().await.unwrap().value, 1.0);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn zero_debounce_follows_the_input() {
        let path = value_file("instant", "1\n");
        let model = hardware_model(
            6,
            "motion",
            json!({"value_path": path, "debounce_ms": 0, "active_low": true}),
        );
        let mut strategy = build_strategy(&model).unwrap();
        assert_eq!(strategy.read().await.unwrap().value, 0.0);
        std::fs::write(&path, "0\n").unwrap();
        assert_eq!(strategy.read().await.unwrap().value, 1.0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_device_reports_nothing() {
        let model = hardware_model(
            7,
            "ghost",
            json!({"value_path": "/nonexistent/homesense/value"}),
        );
        let mut strategy = build_strategy(&model).unwrap();
        strategy.setup().await.unwrap();
        assert!(strategy.read().await.is_none());
        assert!(strategy.read().await.is_none());
    }

    async fn test_db() -> DatabaseConnection {
        use homesense_migration::MigratorTrait;
        let db = Database::connect("sqlite::memory:").await.unwrap();
        homesense_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn insert_hardware(
        db: &DatabaseConnection,
        name: &str,
        config: serde_json::Value,
    ) -> i32 {
        hardware::ActiveModel {
            name: Set(name.to_string()),
            enabled: Set(true),
            driver: Set("gpio_binary".to_string()),
            configuration: Set(config),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
        .hardware_id
    }

    #[tokio::test]
    async fn reload_applies_configuration_changes_in_place() {
        let db = test_db().await;
        let poller = HardwarePoller::new(db.clone(), EventBus::new(None), Duration::from_secs(1));

        let door = insert_hardware(&db, "door", json!({"pin": 4})).await;
        insert_hardware(&db, "window", json!({"pin": 5})).await;

        let summary = poller.reload_config().await.unwrap();
        assert_eq!(summary, ReloadSummary { kept: 0, replaced: 0, added: 2, removed: 0 });
        assert_eq!(poller.unit_count().await, 2);

        // Same configuration: everything is kept, nothing rebuilt.
        let summary = poller.reload_config().await.unwrap();
        assert_eq!(summary, ReloadSummary { kept: 2, replaced: 0, added: 0, removed: 0 });

        // Changing one unit's configuration replaces only that unit.
        let row = Hardware::find_by_id(door).one(&db).await.unwrap().unwrap();
        let mut update: hardware::ActiveModel = row.into();
        update.configuration = Set(json!({"pin": 4, "active_low": true}));
        update.update(&db).await.unwrap();

        let summary = poller.reload_config().await.unwrap();
        assert_eq!(summary, ReloadSummary { kept: 1, replaced: 1, added: 0, removed: 0 });
        assert_eq!(poller.unit_count().await, 2);

        // Disabling a unit removes it on the next reload.
        let row = Hardware::find_by_id(door).one(&db).await.unwrap().unwrap();
        let mut update: hardware::ActiveModel = row.into();
        update.enabled = Set(false);
        update.update(&db).await.unwrap();

        let summary = poller.reload_config().await.unwrap();
        assert_eq!(summary, ReloadSummary { kept: 1, replaced: 0, added: 0, removed: 1 });
        assert_eq!(poller.unit_count().await, 1);
    }
}
