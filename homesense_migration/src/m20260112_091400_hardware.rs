use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Hardware::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Hardware::HardwareId)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Hardware::Name).string().not_null())
                    .col(ColumnDef::new(Hardware::Enabled).boolean().not_null())
                    .col(ColumnDef::new(Hardware::Driver).string().not_null())
                    .col(ColumnDef::new(Hardware::Configuration).json().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Hardware::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub(crate) enum Hardware {
    Table,
    HardwareId,
    Name,
    Enabled,
    Driver,
    Configuration,
}
