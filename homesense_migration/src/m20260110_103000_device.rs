use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Device::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Device::DeviceId)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Device::MacAddress).string().not_null())
                    .col(ColumnDef::new(Device::Name).string().not_null())
                    .col(ColumnDef::new(Device::Owner).string())
                    .col(ColumnDef::new(Device::Hostname).string())
                    .col(ColumnDef::new(Device::Vendor).string())
                    .col(ColumnDef::new(Device::LastIp).string())
                    .col(ColumnDef::new(Device::IsHome).boolean().not_null())
                    .col(ColumnDef::new(Device::IsRandomizedMac).boolean().not_null())
                    .col(ColumnDef::new(Device::TrackPresence).boolean().not_null())
                    .col(ColumnDef::new(Device::FirstSeen).timestamp().not_null())
                    .col(ColumnDef::new(Device::LastSeen).timestamp().not_null())
                    .col(ColumnDef::new(Device::LinkedToDeviceId).integer())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-device-linked-to")
                            .from(Device::Table, Device::LinkedToDeviceId)
                            .to(Device::Table, Device::DeviceId),
                    )
                    .col(ColumnDef::new(Device::LinkConfidence).double())
                    .col(ColumnDef::new(Device::IpHistory).json().not_null())
                    .col(ColumnDef::new(Device::MdnsServices).json().not_null())
                    .col(ColumnDef::new(Device::ConnectionHours).json().not_null())
                    .col(ColumnDef::new(Device::Metadata).json().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-device-mac")
                    .unique()
                    .table(Device::Table)
                    .col(Device::MacAddress)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-device-home-tracked")
                    .table(Device::Table)
                    .col(Device::IsHome)
                    .col(Device::TrackPresence)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Device::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub(crate) enum Device {
    Table,
    DeviceId,
    MacAddress,
    Name,
    Owner,
    Hostname,
    Vendor,
    LastIp,
    IsHome,
    IsRandomizedMac,
    TrackPresence,
    FirstSeen,
    LastSeen,
    LinkedToDeviceId,
    LinkConfidence,
    IpHistory,
    MdnsServices,
    ConnectionHours,
    Metadata,
}
