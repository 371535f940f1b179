pub use sea_orm_migration::prelude::*;

mod m20260110_103000_device;
mod m20260110_104500_presence_event;
mod m20260110_105100_device_association;
mod m20260110_110200_network_snapshot;
mod m20260112_091400_hardware;
mod m20260112_092800_hardware_event;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260110_103000_device::Migration),
            Box::new(m20260110_104500_presence_event::Migration),
            Box::new(m20260110_105100_device_association::Migration),
            Box::new(m20260110_110200_network_snapshot::Migration),
            Box::new(m20260112_091400_hardware::Migration),
            Box::new(m20260112_092800_hardware_event::Migration),
        ]
    }
}
