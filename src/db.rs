// Database access: one process-wide connection established with bounded
// retries, plus the read queries the engine and its consumers need.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_once_cell::OnceCell;
use log::{info, warn};
use sea_orm::{
    ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};

use homesense_entity::{device, presence_event, prelude::*};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_DELAY: Duration = Duration::from_secs(2);

static CONNECTION: OnceCell<DatabaseConnection> = OnceCell::new();

/// The shared connection, opened on first use. Subsequent callers get the
/// same handle regardless of the URL they pass.
pub async fn connection(database_url: &str) -> Result<&'static DatabaseConnection> {
    CONNECTION
        .get_or_try_init(connect_with_retry(database_url))
        .await
}

async fn connect_with_retry(database_url: &str) -> Result<DatabaseConnection> {
    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match Database::connect(database_url).await {
            Ok(db) => {
                info!("connected to {}", database_url);
                return Ok(db);
            }
            Err(e) => {
                warn!(
                    "database connection attempt {}/{} failed: {}",
                    attempt, CONNECT_ATTEMPTS, e
                );
                last_error = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_DELAY).await;
                }
            }
        }
    }
    Err(anyhow!(
        "could not open {}: {}",
        database_url,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Devices currently home, limited to the ones someone asked to track.
pub async fn who_is_home(db: &DatabaseConnection) -> Result<Vec<device::Model>> {
    Device::find()
        .filter(device::Column::IsHome.eq(true))
        .filter(device::Column::TrackPresence.eq(true))
        .order_by_asc(device::Column::Name)
        .all(db)
        .await
        .context("who-is-home query failed")
}

/// Presence history, newest first, one page at a time.
pub async fn recent_events(
    db: &DatabaseConnection,
    page: u64,
    per_page: u64,
) -> Result<Vec<presence_event::Model>> {
    PresenceEvent::find()
        .order_by_desc(presence_event::Column::Timestamp)
        .order_by_desc(presence_event::Column::PresenceEventId)
        .paginate(db, per_page.max(1))
        .fetch_page(page)
        .await
        .context("event history query failed")
}

pub struct DeviceDetail {
    pub device: device::Model,
    /// Randomized-MAC devices resolved to this one.
    pub linked: Vec<device::Model>,
}

pub async fn device_detail(
    db: &DatabaseConnection,
    device_id: i32,
) -> Result<Option<DeviceDetail>> {
    let device = Device::find_by_id(device_id)
        .one(db)
        .await
        .context("device detail query failed")?;
    let device = match device {
        Some(device) => device,
        None => return Ok(None),
    };
    let linked = Device::find()
        .filter(device::Column::LinkedToDeviceId.eq(device.device_id))
        .order_by_asc(device::Column::DeviceId)
        .all(db)
        .await
        .context("linked device query failed")?;
    Ok(Some(DeviceDetail { device, linked }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set};
    use serde_json::json;

    async fn test_db() -> DatabaseConnection {
        use homesense_migration::MigratorTrait;
        let db = Database::connect("sqlite::memory:").await.unwrap();
        homesense_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn insert_device(
        db: &DatabaseConnection,
        mac: &str,
        name: &str,
        is_home: bool,
        track: bool,
    ) -> i32 {
        device::ActiveModel {
            mac_address: Set(mac.to_string()),
            name: Set(name.to_string()),
            is_home: Set(is_home),
            is_randomized_mac: Set(false),
            track_presence: Set(track),
            first_seen: Set(Utc::now()),
            last_seen: Set(Utc::now()),
            ip_history: Set(json!([])),
            mdns_services: Set(json!([])),
            connection_hours: Set(json!([])),
            metadata: Set(json!({})),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
        .device_id
    }

    #[tokio::test]
    async fn who_is_home_requires_tracking() {
        let db = test_db().await;
        insert_device(&db, "AA:BB:CC:00:00:01", "phone", true, true).await;
        insert_device(&db, "AA:BB:CC:00:00:02", "printer", true, false).await;
        insert_device(&db, "AA:BB:CC:00:00:03", "laptop", false, true).await;

        let home = who_is_home(&db).await.unwrap();
        assert_eq!(home.len(), 1);
        assert_eq!(home[0].name, "phone");
    }

    #[tokio::test]
    async fn event_history_pages_newest_first() {
        let db = test_db().await;
        let device_id = insert_device(&db, "AA:BB:CC:00:00:01", "phone", true, true).await;
        for i in 0..5 {
            presence_event::ActiveModel {
                device_id: Set(device_id),
                event_type: Set(if i % 2 == 0 { "arrived" } else { "left" }.to_string()),
                timestamp: Set(Utc::now() + chrono::Duration::seconds(i)),
                ..Default::default()
            }
            .insert(&db)
            .await
            .unwrap();
        }

        let first_page = recent_events(&db, 0, 2).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert!(first_page[0].timestamp >= first_page[1].timestamp);
        let last_page = recent_events(&db, 2, 2).await.unwrap();
        assert_eq!(last_page.len(), 1);
    }

    #[tokio::test]
    async fn device_detail_includes_linked_devices() {
        let db = test_db().await;
        let primary = insert_device(&db, "AA:BB:CC:00:00:01", "phone", true, true).await;
        let shadow = insert_device(&db, "D2:00:00:00:00:01", "phone (random MAC)", true, true).await;
        let row = Device::find_by_id(shadow).one(&db).await.unwrap().unwrap();
        let mut update: device::ActiveModel = row.into();
        update.linked_to_device_id = Set(Some(primary));
        update.update(&db).await.unwrap();

        let detail = device_detail(&db, primary).await.unwrap().unwrap();
        assert_eq!(detail.device.device_id, primary);
        assert_eq!(detail.linked.len(), 1);
        assert_eq!(detail.linked[0].device_id, shadow);

        assert!(device_detail(&db, 9999).await.unwrap().is_none());
    }
}
