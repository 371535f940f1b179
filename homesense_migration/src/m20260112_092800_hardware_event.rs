use sea_orm_migration::prelude::*;

use super::m20260112_091400_hardware::Hardware;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(HardwareEvent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(HardwareEvent::HardwareEventId)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(HardwareEvent::HardwareId).integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-hardware-event-hardware")
                            .from(HardwareEvent::Table, HardwareEvent::HardwareId)
                            .to(Hardware::Table, Hardware::HardwareId),
                    )
                    .col(ColumnDef::new(HardwareEvent::Value).double().not_null())
                    .col(ColumnDef::new(HardwareEvent::Unit).string().not_null())
                    .col(
                        ColumnDef::new(HardwareEvent::Timestamp)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-hardware-event-ts")
                    .table(HardwareEvent::Table)
                    .col(HardwareEvent::Timestamp)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(HardwareEvent::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum HardwareEvent {
    Table,
    HardwareEventId,
    HardwareId,
    Value,
    Unit,
    Timestamp,
}
