pub mod device;
pub mod device_association;
pub mod hardware;
pub mod hardware_event;
pub mod network_snapshot;
pub mod presence_event;

pub mod prelude;
