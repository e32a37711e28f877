pub mod config;
pub mod error;
pub mod hal;
pub mod pipeline;
pub mod session;

pub use config::{ChannelSpec, DeviceSpec, SessionConfig, SetupConfig};
pub use error::{Error, Result};
pub use hal::{Channel, ChannelKind, Device, DeviceRegistry, Setup, SyncOptions};
pub use pipeline::{Chunk, Receiver, ReceiverConfig, StreamInfo, Transmitter, TransmitterConfig};
pub use session::{Sample, Setting, Subject};
