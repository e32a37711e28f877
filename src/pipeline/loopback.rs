//! In-process stream transport.
//!
//! Transmitters publish outlets on a process-wide bus and push timestamped
//! samples to every subscribed receiver. Streams are resolved by name, type or
//! hostname like on a network transport, which makes the bus usable for
//! demos and for wiring transmitters to receivers in tests.

use crossbeam_channel::{bounded, Receiver as Inlet, RecvTimeoutError, Sender, TrySendError};
use ndarray::ArrayView2;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use super::receiver::{Receiver, ReceiverConfig, ReceiverFromConfig};
use super::transmitter::{Transmitter, TransmitterConfig, TransmitterFromConfig};
use super::types::{Chunk, StreamInfo, StreamType};
use crate::error::{Error, Result};

/// Hostname reported by loopback outlets
pub const LOOPBACK_HOST: &str = "localhost";

/// Samples kept per subscriber before new ones are dropped
const INLET_CAPACITY: usize = 65_536;

const RESOLVE_POLL: Duration = Duration::from_millis(10);

type Sample = (f64, Vec<f64>);

struct Outlet {
    info: StreamInfo,
    subscribers: Vec<Sender<Sample>>,
}

struct Bus {
    epoch: Instant,
    next_id: AtomicU64,
    outlets: Mutex<HashMap<u64, Outlet>>,
}

fn bus() -> &'static Bus {
    static BUS: OnceLock<Bus> = OnceLock::new();
    BUS.get_or_init(|| Bus {
        epoch: Instant::now(),
        next_id: AtomicU64::new(1),
        outlets: Mutex::new(HashMap::new()),
    })
}

/// Seconds since the bus was created, used to stamp samples
pub fn local_clock() -> f64 {
    bus().epoch.elapsed().as_secs_f64()
}

fn matches(info: &StreamInfo, stream_type: StreamType, value: &str) -> bool {
    match stream_type {
        StreamType::Name => info.meta_data.name == value,
        StreamType::Type => info.meta_data.stream_type == value,
        StreamType::Hostname => info.meta_data.hostname == value,
    }
}

/// Descriptions of the streams currently published
pub fn published_streams() -> Vec<StreamInfo> {
    let outlets = bus().outlets.lock();
    let mut ids: Vec<&u64> = outlets.keys().collect();
    ids.sort();
    ids.into_iter().map(|id| outlets[id].info.clone()).collect()
}

/// Published streams matching `value` under `stream_type`
pub fn resolve_streams(stream_type: StreamType, value: &str) -> Vec<StreamInfo> {
    published_streams()
        .into_iter()
        .filter(|info| matches(info, stream_type, value))
        .collect()
}

fn publish(info: StreamInfo) -> u64 {
    let bus = bus();
    let id = bus.next_id.fetch_add(1, Ordering::SeqCst);
    bus.outlets.lock().insert(
        id,
        Outlet {
            info,
            subscribers: Vec::new(),
        },
    );
    id
}

fn unpublish(id: u64) {
    bus().outlets.lock().remove(&id);
}

/// Subscribes to the oldest outlet matching the query
fn subscribe(stream_type: StreamType, value: &str) -> Option<(StreamInfo, Inlet<Sample>)> {
    let mut outlets = bus().outlets.lock();
    let id = outlets
        .iter()
        .filter(|(_, outlet)| matches(&outlet.info, stream_type, value))
        .map(|(id, _)| *id)
        .min()?;
    let outlet = outlets.get_mut(&id)?;
    let (tx, rx) = bounded(INLET_CAPACITY);
    outlet.subscribers.push(tx);
    Some((outlet.info.clone(), rx))
}

fn push_sample(id: u64, timestamp: f64, values: Vec<f64>) -> Result<()> {
    let mut outlets = bus().outlets.lock();
    let outlet = outlets
        .get_mut(&id)
        .ok_or_else(|| Error::Transport(format!("outlet {} is not published", id)))?;
    outlet.subscribers.retain(|subscriber| {
        match subscriber.try_send((timestamp, values.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::trace!("Inlet of `{}` is full, dropping sample", outlet.info.meta_data.name);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    });
    Ok(())
}

/// Publishes a device snapshot on the loopback bus
pub struct LoopbackTransmitter {
    config: TransmitterConfig,
    outlet: Option<u64>,
    info: Option<StreamInfo>,
}

impl TransmitterFromConfig for LoopbackTransmitter {
    fn from_config(config: TransmitterConfig) -> Self {
        Self {
            config,
            outlet: None,
            info: None,
        }
    }
}

impl Transmitter for LoopbackTransmitter {
    fn config(&self) -> &TransmitterConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.outlet.is_some()
    }

    fn connect(&mut self) -> Result<StreamInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let mut info = self.config.stream_info();
        info.meta_data.hostname = LOOPBACK_HOST.to_string();
        info.meta_data
            .extra
            .insert("manufacturer".into(), Value::from(self.config.device.device_type.clone()));
        self.outlet = Some(publish(info.clone()));
        self.info = Some(info.clone());
        Ok(info)
    }

    fn stream_info(&mut self) -> Result<StreamInfo> {
        self.connect()
    }

    fn transmit_data(&mut self, data: ArrayView2<f64>, sleep: Duration) -> Result<()> {
        let id = self
            .outlet
            .ok_or_else(|| Error::Connection(format!("stream `{}` is not published", self.config.stream)))?;
        for row in data.outer_iter() {
            push_sample(id, local_clock(), row.to_vec())?;
        }
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }
        Ok(())
    }

    fn replicate(&self) -> Box<dyn Transmitter> {
        Box::new(Self::from_config(self.config.clone()))
    }
}

impl Drop for LoopbackTransmitter {
    fn drop(&mut self) {
        if let Some(id) = self.outlet.take() {
            unpublish(id);
        }
    }
}

/// Number of samples grouped into one chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkSize {
    /// Fraction of the nominal sampling rate
    Fraction(f64),
    Samples(usize),
}

impl ChunkSize {
    fn from_option(value: Option<&Value>) -> Self {
        match value {
            Some(value) if value.is_u64() => ChunkSize::Samples(value.as_u64().unwrap_or(1) as usize),
            Some(value) => ChunkSize::Fraction(value.as_f64().unwrap_or(1.0)),
            None => ChunkSize::Fraction(1.0),
        }
    }

    pub fn samples(&self, nominal_srate: f64) -> usize {
        let n = match self {
            ChunkSize::Samples(n) => *n,
            ChunkSize::Fraction(fraction) => (fraction * nominal_srate).round() as usize,
        };
        n.max(1)
    }
}

/// Receives a loopback stream.
///
/// Options: `chunk_size` (float: fraction of the rate, integer: samples),
/// `pull_chunks` (drain everything available per read) and
/// `resolve_timeout` in seconds.
pub struct LoopbackReceiver {
    config: ReceiverConfig,
    inlet: Option<Inlet<Sample>>,
    info: Option<StreamInfo>,
}

impl LoopbackReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self::from_config(config)
    }

    pub fn chunk_size(&self) -> ChunkSize {
        ChunkSize::from_option(self.config.options.get("chunk_size"))
    }

    pub fn pull_chunks(&self) -> bool {
        self.config.option_bool("pull_chunks").unwrap_or(false)
    }

    fn resolve_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.option_f64("resolve_timeout").unwrap_or(5.0).max(0.0))
    }

    fn closed(&self) -> Error {
        Error::Connection(format!("stream `{}` was closed", self.config.stream))
    }
}

impl ReceiverFromConfig for LoopbackReceiver {
    fn from_config(config: ReceiverConfig) -> Self {
        Self {
            config,
            inlet: None,
            info: None,
        }
    }
}

impl Receiver for LoopbackReceiver {
    fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.inlet.is_some()
    }

    fn connect(&mut self) -> Result<StreamInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let (stream, stream_type) = (self.config.stream.clone(), self.config.stream_type);
        if self.config.verbose {
            log::info!("Connecting to stream `{}` of type `{}`", stream, stream_type);
        }

        let deadline = Instant::now() + self.resolve_timeout();
        loop {
            if let Some((info, inlet)) = subscribe(stream_type, &stream) {
                if self.config.verbose {
                    log::info!("Connection to stream `{}` established", stream);
                }
                self.inlet = Some(inlet);
                self.info = Some(info.clone());
                return Ok(info);
            }
            if Instant::now() >= deadline {
                return Err(Error::Connection(format!(
                    "no stream `{}` of type `{}` found",
                    stream, stream_type
                )));
            }
            thread::sleep(RESOLVE_POLL);
        }
    }

    fn stream_info(&mut self) -> Result<StreamInfo> {
        self.connect()
    }

    fn receive_data(&mut self) -> Result<Chunk> {
        let info = self.connect()?;
        let n_channels = info.meta_data.channel_count;
        let wanted = self.chunk_size().samples(info.nominal_srate());
        let pull_chunks = self.pull_chunks();
        let inlet = self.inlet.as_ref().ok_or_else(|| self.closed())?;

        let mut timestamps = Vec::with_capacity(wanted);
        let mut rows = Vec::with_capacity(wanted);
        while rows.len() < wanted {
            let (timestamp, values) = loop {
                match inlet.recv_timeout(Duration::from_millis(100)) {
                    Ok(sample) => break sample,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Err(self.closed()),
                }
            };
            timestamps.push(timestamp);
            rows.push(values);
            if pull_chunks {
                for (timestamp, values) in inlet.try_iter() {
                    timestamps.push(timestamp);
                    rows.push(values);
                }
            }
        }
        Chunk::from_rows(timestamps, rows, n_channels)
    }

    fn replicate(&self) -> Box<dyn Receiver> {
        Box::new(Self::from_config(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_from_option() {
        assert_eq!(ChunkSize::from_option(None).samples(250.0), 250);
        assert_eq!(ChunkSize::from_option(Some(&Value::from(0.1))).samples(250.0), 25);
        assert_eq!(ChunkSize::from_option(Some(&Value::from(3u64))).samples(250.0), 3);
        assert_eq!(ChunkSize::Fraction(0.0).samples(250.0), 1);
    }

    #[test]
    fn test_resolve_times_out() {
        let mut receiver = LoopbackReceiver::new(
            ReceiverConfig::new("loopback-test-absent")
                .with_verbose(false)
                .with_option("resolve_timeout", 0.05),
        );
        assert!(matches!(receiver.connect(), Err(Error::Connection(_))));
        assert!(!receiver.is_connected());
    }
}
