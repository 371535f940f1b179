use sea_orm_migration::prelude::*;

use super::m20260110_103000_device::Device;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PresenceEvent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PresenceEvent::PresenceEventId)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PresenceEvent::DeviceId).integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-presence-event-device")
                            .from(PresenceEvent::Table, PresenceEvent::DeviceId)
                            .to(Device::Table, Device::DeviceId),
                    )
                    .col(ColumnDef::new(PresenceEvent::EventType).string().not_null())
                    .col(
                        ColumnDef::new(PresenceEvent::Timestamp)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PresenceEvent::IpAddress).string())
                    .col(ColumnDef::new(PresenceEvent::Hostname).string())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-presence-event-device-ts")
                    .table(PresenceEvent::Table)
                    .col(PresenceEvent::DeviceId)
                    .col(PresenceEvent::Timestamp)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PresenceEvent::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum PresenceEvent {
    Table,
    PresenceEventId,
    DeviceId,
    EventType,
    Timestamp,
    IpAddress,
    Hostname,
}
