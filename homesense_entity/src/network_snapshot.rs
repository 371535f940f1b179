use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-cycle rollup of which devices were present, for historical replay.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "network_snapshot")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub network_snapshot_id: i32,
    pub timestamp: DateTimeUtc,
    pub device_count: i32,
    /// JSON list of {mac, ip} observed during the cycle.
    pub devices_present: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
