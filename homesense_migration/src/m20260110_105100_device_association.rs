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
                    .table(DeviceAssociation::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceAssociation::DeviceAssociationId)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DeviceAssociation::Device1Id)
                            .integer()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-association-device1")
                            .from(DeviceAssociation::Table, DeviceAssociation::Device1Id)
                            .to(Device::Table, Device::DeviceId),
                    )
                    .col(
                        ColumnDef::new(DeviceAssociation::Device2Id)
                            .integer()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-association-device2")
                            .from(DeviceAssociation::Table, DeviceAssociation::Device2Id)
                            .to(Device::Table, Device::DeviceId),
                    )
                    .col(
                        ColumnDef::new(DeviceAssociation::AssociationType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceAssociation::Confidence)
                            .double()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceAssociation::CoOccurrenceCount)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceAssociation::LastSeenTogether)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One row per unordered pair; the application stores device1 < device2.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-association-pair")
                    .unique()
                    .table(DeviceAssociation::Table)
                    .col(DeviceAssociation::Device1Id)
                    .col(DeviceAssociation::Device2Id)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceAssociation::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum DeviceAssociation {
    Table,
    DeviceAssociationId,
    Device1Id,
    Device2Id,
    AssociationType,
    Confidence,
    CoOccurrenceCount,
    LastSeenTogether,
}
