pub mod loopback;
pub mod mock;
pub mod receiver;
pub mod transmitter;
pub mod types;

pub use loopback::{ChunkSize, LoopbackReceiver, LoopbackTransmitter};
pub use mock::SimulatedReceiver;
pub use receiver::{BackgroundReceiver, Receiver, ReceiverConfig, ReceiverFromConfig, ReceiverWorker};
pub use transmitter::{
    AugmentRate, BackgroundTransmitter, DeviceSnapshot, Payload, Transmitter, TransmitterConfig,
    TransmitterFromConfig, TransmitterWorker,
};
pub use types::{ChannelFormat, ChannelMetadata, Chunk, StreamInfo, StreamMetadata, StreamType};
