use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Undirected co-presence pair, stored normalized with
/// `device1_id < device2_id` and unique per pair.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_association")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub device_association_id: i32,
    pub device1_id: i32,
    pub device2_id: i32,
    pub association_type: String,
    pub confidence: f64,
    pub co_occurrence_count: i32,
    pub last_seen_together: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
