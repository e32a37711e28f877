use crossbeam_channel::{bounded, Receiver as QueueReceiver, Sender};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::receiver::DEFAULT_QUEUE_CAPACITY;
use super::types::{ChannelFormat, ChannelMetadata, StreamInfo, StreamMetadata, StreamType};
use crate::error::{Error, Result};
use crate::hal::{Channel, Device};

/// Artificial pacing of transmitted samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AugmentRate {
    /// `true` paces at the device's nominal rate, `false` disables pacing
    Enabled(bool),
    /// Paces at the given rate in Hz
    Rate(f64),
}

impl Default for AugmentRate {
    fn default() -> Self {
        AugmentRate::Enabled(false)
    }
}

/// Device description sent along with the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub channel_count: usize,
    pub nominal_srate: f64,
    #[serde(default)]
    pub channel_format: ChannelFormat,
    pub source_id: String,
}

fn default_true() -> bool {
    true
}

/// Serializable construction arguments of a transmitter.
///
/// Built once from a [`Device`]; later changes to the device are not seen by
/// the transmitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitterConfig {
    pub stream: String,
    #[serde(default)]
    pub stream_type: StreamType,
    pub device: DeviceSnapshot,
    pub channels: Vec<ChannelMetadata>,
    #[serde(default = "default_true")]
    pub terminate_when_empty: bool,
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub augment_sampling_rate: AugmentRate,
    #[serde(default, flatten)]
    pub options: Map<String, Value>,
}

impl TransmitterConfig {
    /// Snapshot of `device`; the stream name defaults to the device name
    pub fn from_device(device: &Device, stream: Option<&str>) -> Self {
        let stream = stream.map(str::to_string).unwrap_or_else(|| device.name());
        Self {
            device: Self::device_to_dict(device, &stream, ChannelFormat::default()),
            channels: Self::channels_to_list_of_dicts(&device.channels()),
            stream,
            stream_type: StreamType::default(),
            terminate_when_empty: true,
            verbose: true,
            augment_sampling_rate: AugmentRate::default(),
            options: Map::new(),
        }
    }

    pub fn device_to_dict(device: &Device, stream: &str, channel_format: ChannelFormat) -> DeviceSnapshot {
        DeviceSnapshot {
            name: stream.to_string(),
            device_type: device.class_name().to_string(),
            channel_count: device.n_channels(),
            nominal_srate: device.sampling_rate().unwrap_or(0.0),
            channel_format,
            source_id: device.name(),
        }
    }

    pub fn channels_to_list_of_dicts(channels: &[Channel]) -> Vec<ChannelMetadata> {
        channels
            .iter()
            .map(|channel| ChannelMetadata::new(channel.name(), channel.unit(), channel.kind().tag()))
            .collect()
    }

    pub fn with_stream_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    pub fn with_terminate_when_empty(mut self, terminate_when_empty: bool) -> Self {
        self.terminate_when_empty = terminate_when_empty;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_augment_sampling_rate(mut self, augment: AugmentRate) -> Self {
        self.augment_sampling_rate = augment;
        self
    }

    /// Stream description announced on connect
    pub fn stream_info(&self) -> StreamInfo {
        let mut meta = StreamMetadata::new(self.stream.clone(), self.device.channel_count, self.device.nominal_srate);
        meta.stream_type = self.device.device_type.clone();
        meta.channel_format = self.device.channel_format;
        meta.source_id = self.device.source_id.clone();
        StreamInfo::new(meta, self.channels.clone())
    }

    /// Delay between transmitted samples.
    ///
    /// A positive `override_rate` wins; otherwise the configured augment
    /// setting decides. No pacing yields a zero delay.
    pub fn augment_delay(&self, override_rate: Option<f64>) -> Duration {
        let rate = match override_rate {
            Some(rate) if rate > 0.0 => rate,
            _ => match self.augment_sampling_rate {
                AugmentRate::Enabled(true) => self.device.nominal_srate,
                AugmentRate::Enabled(false) => 0.0,
                AugmentRate::Rate(rate) => rate,
            },
        };
        if rate == 0.0 || !rate.is_finite() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(1.0 / rate.abs()).unwrap_or_else(|_| {
            log::warn!("Pacing rate {} is too small, sending without delay", rate);
            Duration::ZERO
        })
    }
}

/// Foreground side of an outgoing stream
pub trait Transmitter: Send {
    fn config(&self) -> &TransmitterConfig;

    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> Result<StreamInfo>;

    fn stream_info(&mut self) -> Result<StreamInfo>;

    /// Sends `[n_samples, n_channels]` rows, sleeping `sleep` afterwards
    fn transmit_data(&mut self, data: ArrayView2<f64>, sleep: Duration) -> Result<()>;

    /// Fresh, unconnected transmitter built from the same configuration
    fn replicate(&self) -> Box<dyn Transmitter>;

    fn get_augment_sampling_rate_delay(&self, override_rate: Option<f64>) -> Duration {
        self.config().augment_delay(override_rate)
    }
}

/// Transmitters that can be rebuilt from their configuration alone
pub trait TransmitterFromConfig: Transmitter + Sized + 'static {
    fn from_config(config: TransmitterConfig) -> Self;
}

/// Data queued for transmission: one chunk or a batch of chunks
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chunk(Array2<f64>),
    Batch(Vec<Array2<f64>>),
}

impl From<Array2<f64>> for Payload {
    fn from(chunk: Array2<f64>) -> Self {
        Payload::Chunk(chunk)
    }
}

impl From<Vec<Array2<f64>>> for Payload {
    fn from(batch: Vec<Array2<f64>>) -> Self {
        Payload::Batch(batch)
    }
}

impl Payload {
    /// Concatenates two payloads; two chunks are joined along the sample axis
    pub fn append(self, other: Payload) -> Result<Payload> {
        Ok(match (self, other) {
            (Payload::Chunk(a), Payload::Chunk(b)) => Payload::Chunk(concatenate(Axis(0), &[a.view(), b.view()])?),
            (Payload::Batch(mut a), Payload::Batch(b)) => {
                a.extend(b);
                Payload::Batch(a)
            }
            (Payload::Batch(mut a), Payload::Chunk(b)) => {
                a.push(b);
                Payload::Batch(a)
            }
            (Payload::Chunk(a), Payload::Batch(b)) => {
                let mut batch = Vec::with_capacity(b.len() + 1);
                batch.push(a);
                batch.extend(b);
                Payload::Batch(batch)
            }
        })
    }

    pub fn n_samples(&self) -> usize {
        match self {
            Payload::Chunk(chunk) => chunk.nrows(),
            Payload::Batch(batch) => batch.iter().map(Array2::nrows).sum(),
        }
    }

    fn into_chunks(self) -> Vec<Array2<f64>> {
        match self {
            Payload::Chunk(chunk) => vec![chunk],
            Payload::Batch(batch) => batch,
        }
    }
}

/// Sends one payload.
///
/// Chunks holding more samples than the nominal rate are sent sample by
/// sample, smaller chunks in one call.
fn dispatch(transmitter: &mut dyn Transmitter, payload: Payload, stop: &AtomicBool) -> Result<()> {
    let config = transmitter.config();
    let sampling_rate = config.device.nominal_srate;
    let verbose = config.verbose;
    let stream = config.stream.clone();
    let sleep = transmitter.get_augment_sampling_rate_delay(None);

    for chunk in payload.into_chunks() {
        let n_samples = chunk.nrows();
        if n_samples as f64 > sampling_rate {
            let every = (sampling_rate.max(1.0)) as usize;
            for (i, sample) in chunk.outer_iter().enumerate() {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                transmitter.transmit_data(sample.insert_axis(Axis(0)), sleep)?;
                if verbose && ((i + 1) % every == 0 || i + 1 == n_samples) {
                    log::info!("`{}` sent {}/{} samples", stream, i + 1, n_samples);
                }
            }
        } else {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            transmitter.transmit_data(chunk.view(), sleep)?;
        }
    }
    Ok(())
}

fn run_transmitter(
    mut transmitter: Box<dyn Transmitter>,
    queue: QueueReceiver<Payload>,
    ready: Sender<std::result::Result<(), String>>,
    stop: Arc<AtomicBool>,
) {
    let stream = transmitter.config().stream.clone();
    let verbose = transmitter.config().verbose;
    if verbose {
        log::info!("Establishing connection to stream `{}`", stream);
    }
    if let Err(err) = transmitter.connect() {
        log::error!("Transmitter for `{}` could not connect: {}", stream, err);
        let _ = ready.send(Err(err.to_string()));
        return;
    }
    if verbose {
        log::info!("Connection to stream `{}` established", stream);
    }
    let _ = ready.send(Ok(()));

    let terminate_when_empty = transmitter.config().terminate_when_empty;
    while !stop.load(Ordering::SeqCst) {
        let payload = match queue.recv() {
            Ok(payload) => payload,
            Err(_) => break,
        };
        if verbose {
            log::info!("`{}` transmitting {} samples", stream, payload.n_samples());
        }
        if let Err(err) = dispatch(transmitter.as_mut(), payload, &stop) {
            log::error!("Transmitter for `{}` failed: {}", stream, err);
            break;
        }
        if terminate_when_empty && queue.is_empty() {
            break;
        }
    }
    if verbose {
        log::info!("Transmitter `{}` terminated", stream);
    }
}

/// Background thread transmitting queued payloads with its own transmitter
pub struct TransmitterWorker {
    stream: String,
    queue: Option<Sender<Payload>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TransmitterWorker {
    /// Spawns the worker and blocks until it connected.
    ///
    /// A failed connection is returned as [`Error::Connection`].
    pub fn spawn(transmitter: Box<dyn Transmitter>, capacity: usize) -> Result<Self> {
        let stream = transmitter.config().stream.clone();
        let (tx, rx) = bounded(capacity.max(1));
        let (ready_tx, ready_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("transmit {}", stream))
            .spawn(move || run_transmitter(transmitter, rx, ready_tx, stop_flag))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stream,
                queue: Some(tx),
                stop,
                handle: Some(handle),
            }),
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(Error::Connection(message))
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::WorkerTerminated(stream))
            }
        }
    }

    pub fn push(&self, payload: Payload) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| Error::WorkerTerminated(self.stream.clone()))?;
        queue
            .send(payload)
            .map_err(|_| Error::WorkerTerminated(self.stream.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Closes the queue and waits until everything pushed so far was sent
    pub fn join(&mut self) -> Result<()> {
        self.queue.take();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::WorkerTerminated(self.stream.clone()))?;
        }
        Ok(())
    }

    /// Stops after the current send; a worker blocked in its transport is detached
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.take();
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::debug!("Detaching transmitter worker for `{}`", self.stream);
            }
        }
    }
}

impl Drop for TransmitterWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A transmitter with a backlog and an optional background worker.
///
/// Data pushed before `start` accumulates in a backlog that is flushed as a
/// single payload once the worker is connected.
pub struct BackgroundTransmitter {
    transmitter: Box<dyn Transmitter>,
    worker: Option<TransmitterWorker>,
    backlog: Option<Payload>,
    capacity: usize,
}

impl BackgroundTransmitter {
    pub fn new(transmitter: Box<dyn Transmitter>) -> Self {
        Self {
            transmitter,
            worker: None,
            backlog: None,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn transmitter(&self) -> &dyn Transmitter {
        self.transmitter.as_ref()
    }

    pub fn config(&self) -> &TransmitterConfig {
        self.transmitter.config()
    }

    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.as_ref().map(Payload::n_samples).unwrap_or(0)
    }

    /// Spawns the worker, waits for its connection and flushes the backlog
    pub fn start(&mut self) -> Result<&mut Self> {
        if self.worker.is_some() {
            return Ok(self);
        }
        let worker = TransmitterWorker::spawn(self.transmitter.replicate(), self.capacity)?;
        if let Some(backlog) = self.backlog.take() {
            worker.push(backlog)?;
        }
        self.worker = Some(worker);
        Ok(self)
    }

    pub fn push_data(&mut self, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        match &self.worker {
            Some(worker) => worker.push(payload),
            None => {
                self.backlog = Some(match self.backlog.take() {
                    None => payload,
                    Some(backlog) => backlog.append(payload)?,
                });
                Ok(())
            }
        }
    }

    /// Waits for the worker to transmit everything pushed
    pub fn join(&mut self) -> Result<()> {
        let mut worker = self
            .worker
            .take()
            .ok_or_else(|| Error::NotStarted(self.transmitter.config().stream.clone()))?;
        worker.join()
    }

    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    /// Starts the worker, runs `f` and stops the worker whatever `f` returns
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.start()?;
        let result = f(self);
        self.stop();
        result
    }
}

impl Drop for BackgroundTransmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Channel, ChannelKind};
    use ndarray::array;

    fn config(augment: AugmentRate) -> TransmitterConfig {
        let device = Device::with_channels(
            "Amp",
            vec![
                Channel::of_kind(ChannelKind::Eeg, "Fz", 200.0).unwrap(),
                Channel::of_kind(ChannelKind::Ecg, "ECG", 200.0).unwrap(),
            ],
        )
        .unwrap();
        TransmitterConfig::from_device(&device, None).with_augment_sampling_rate(augment)
    }

    #[test]
    fn test_device_snapshot() {
        let config = config(AugmentRate::default());
        assert_eq!(config.stream, "Amp");
        assert_eq!(config.device.device_type, "Device");
        assert_eq!(config.device.channel_count, 2);
        assert_eq!(config.device.nominal_srate, 200.0);
        assert_eq!(config.channels[1], ChannelMetadata::new("ECG", "mV", "ECG"));
    }

    #[test]
    fn test_augment_delay() {
        assert_eq!(config(AugmentRate::Enabled(false)).augment_delay(None), Duration::ZERO);
        assert_eq!(
            config(AugmentRate::Enabled(true)).augment_delay(None),
            Duration::from_secs_f64(1.0 / 200.0)
        );
        assert_eq!(
            config(AugmentRate::Rate(-50.0)).augment_delay(None),
            Duration::from_secs_f64(1.0 / 50.0)
        );
        assert_eq!(
            config(AugmentRate::Enabled(false)).augment_delay(Some(10.0)),
            Duration::from_secs_f64(1.0 / 10.0)
        );
    }

    #[test]
    fn test_vanishing_rate_sends_without_delay() {
        assert_eq!(config(AugmentRate::Rate(1e-30)).augment_delay(None), Duration::ZERO);
        assert_eq!(
            config(AugmentRate::Enabled(false)).augment_delay(Some(f64::MIN_POSITIVE)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_augment_rate_from_json() {
        let flag: AugmentRate = serde_json::from_str("true").unwrap();
        let rate: AugmentRate = serde_json::from_str("125.0").unwrap();
        assert_eq!(flag, AugmentRate::Enabled(true));
        assert_eq!(rate, AugmentRate::Rate(125.0));
    }

    #[test]
    fn test_payload_append() {
        let joined = Payload::from(array![[1.0]]).append(array![[2.0]].into()).unwrap();
        assert_eq!(joined, Payload::Chunk(array![[1.0], [2.0]]));

        let mixed = Payload::from(array![[1.0]])
            .append(vec![array![[2.0]], array![[3.0]]].into())
            .unwrap();
        assert_eq!(mixed.n_samples(), 3);
        assert!(matches!(mixed, Payload::Batch(ref b) if b.len() == 3));
    }
}
