use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only reading from one hardware strategy.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hardware_event")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub hardware_event_id: i32,
    pub hardware_id: i32,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::hardware::Entity",
        from = "Column::HardwareId",
        to = "super::hardware::Column::HardwareId"
    )]
    Hardware,
}

impl Related<super::hardware::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Hardware.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
