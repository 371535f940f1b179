pub use super::device::Entity as Device;
pub use super::device_association::Entity as DeviceAssociation;
pub use super::hardware::Entity as Hardware;
pub use super::hardware_event::Entity as HardwareEvent;
pub use super::network_snapshot::Entity as NetworkSnapshot;
pub use super::presence_event::Entity as PresenceEvent;
