use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only record of a confirmed home/away transition.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "presence_event")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub presence_event_id: i32,
    pub device_id: i32,
    /// Either "arrived" or "left".
    pub event_type: String,
    pub timestamp: DateTimeUtc,
    pub ip_address: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::device::Entity",
        from = "Column::DeviceId",
        to = "super::device::Column::DeviceId"
    )]
    Device,
}

impl Related<super::device::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Device.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
