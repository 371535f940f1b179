use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A resolved network identity, keyed by MAC address. Randomized MACs roll up
/// into a primary device through `linked_to_device_id` (chain length is at
/// most one; the link target always has `linked_to_device_id = NULL`).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub device_id: i32,
    #[sea_orm(unique)]
    pub mac_address: String,
    pub name: String,
    pub owner: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub last_ip: Option<String>,
    pub is_home: bool,
    pub is_randomized_mac: bool,
    pub track_presence: bool,
    pub first_seen: DateTimeUtc,
    pub last_seen: DateTimeUtc,
    pub linked_to_device_id: Option<i32>,
    pub link_confidence: Option<f64>,
    /// Last N {ip, ts} pairs, newest last.
    pub ip_history: Json,
    /// mDNS service types this device has advertised.
    pub mdns_services: Json,
    /// Hours of day (0-23) during which the device has connected.
    pub connection_hours: Json,
    /// Free-form enrichment (os guess, mDNS txt properties).
    pub metadata: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::presence_event::Entity")]
    PresenceEvent,
    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::LinkedToDeviceId",
        to = "Column::DeviceId"
    )]
    LinkedTo,
}

impl Related<super::presence_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PresenceEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
