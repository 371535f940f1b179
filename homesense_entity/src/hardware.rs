use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A physical input or output polled by the hardware service. The `driver`
/// column selects the strategy; `configuration` holds pin numbers, debounce
/// windows and labels.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hardware")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub hardware_id: i32,
    pub name: String,
    pub enabled: bool,
    pub driver: String,
    pub configuration: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::hardware_event::Entity")]
    HardwareEvent,
}

impl Related<super::hardware_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::HardwareEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
