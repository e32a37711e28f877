use thiserror::Error;

/// Errors raised by the hardware hierarchy and the streaming pipeline.
///
/// Hierarchy and binding variants are configuration errors: they are returned
/// synchronously and never retried. Worker-side failures are logged in the
/// worker and surface to the foreground only as `WorkerTerminated`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Only positive sampling rates are allowed, got {0}")]
    InvalidSamplingRate(f64),

    #[error("Device `{device}` is not a member of setup `{setup}`")]
    DeviceNotFound { device: String, setup: String },

    #[error("Channel `{channel}` is not a member of device `{device}`")]
    ChannelNotFound { channel: String, device: String },

    #[error("Device `{0}` already has a receiver bound")]
    ReceiverAlreadyBound(String),

    #[error("Device `{0}` already has a transmitter bound")]
    TransmitterAlreadyBound(String),

    #[error("Device `{0}` has no receiver bound")]
    MissingReceiver(String),

    #[error("Stream `{0}` reported an empty channel list")]
    EmptyChannelMetadata(String),

    #[error("Unknown device class `{0}`")]
    UnknownDeviceClass(String),

    #[error("Background streaming of `{0}` needs to be started first")]
    NotStarted(String),

    #[error("Background worker for `{0}` has terminated")]
    WorkerTerminated(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::Shape(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
