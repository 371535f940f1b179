use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NetworkSnapshot::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NetworkSnapshot::NetworkSnapshotId)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(NetworkSnapshot::Timestamp)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NetworkSnapshot::DeviceCount)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NetworkSnapshot::DevicesPresent)
                            .json()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-snapshot-timestamp")
                    .table(NetworkSnapshot::Table)
                    .col(NetworkSnapshot::Timestamp)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NetworkSnapshot::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum NetworkSnapshot {
    Table,
    NetworkSnapshotId,
    Timestamp,
    DeviceCount,
    DevicesPresent,
}
