pub mod buffer;
pub mod channel;
pub mod channel_kind;
pub mod device;
pub mod devices;
pub mod loader;
pub mod registry;
pub mod setup;

pub use buffer::{resolve_buffer, BufferList, BufferOwner};
pub use channel::Channel;
pub use channel_kind::{sensor_to_channel_type, ChannelKind, SensorTable};
pub use device::{Device, SyncOptions};
pub use loader::{DataLoader, TextLoader};
pub use registry::{DeviceKind, DeviceKindRegistration, DeviceRegistry, ALIASES, DEFAULT_LOCATION};
pub use setup::Setup;
