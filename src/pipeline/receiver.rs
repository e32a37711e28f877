use crossbeam_channel::{bounded, Receiver as QueueReceiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::types::{Chunk, StreamInfo, StreamType};
use crate::error::{Error, Result};

/// Default number of chunks buffered between a worker and its consumer
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

fn default_verbose() -> bool {
    true
}

/// Serializable construction arguments of a receiver.
///
/// A worker rebuilds its own receiver from this value, so everything a
/// receiver needs to reconnect must live here. Transport specific settings go
/// into `options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub stream: String,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default = "default_verbose")]
    pub verbose: bool,
    #[serde(default, flatten)]
    pub options: Map<String, Value>,
}

impl ReceiverConfig {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            stream_type: StreamType::default(),
            verbose: default_verbose(),
            options: Map::new(),
        }
    }

    pub fn with_stream_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(Value::as_f64)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }
}

/// Foreground side of a data-acquisition stream.
///
/// Implementations connect to a transport and deliver chunks of
/// `(timestamps, samples)`. `connect` is idempotent and `stream_info`
/// connects on first use.
pub trait Receiver: Send {
    fn config(&self) -> &ReceiverConfig;

    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> Result<StreamInfo>;

    fn stream_info(&mut self) -> Result<StreamInfo>;

    /// Blocks until the next chunk is available
    fn receive_data(&mut self) -> Result<Chunk>;

    /// Fresh, unconnected receiver built from the same configuration
    fn replicate(&self) -> Box<dyn Receiver>;
}

/// Receivers that can be rebuilt from their configuration alone
pub trait ReceiverFromConfig: Receiver + Sized + 'static {
    fn from_config(config: ReceiverConfig) -> Self;
}

/// Background thread pulling chunks from its own receiver into a bounded queue
pub struct ReceiverWorker {
    stream: String,
    queue: Option<QueueReceiver<Chunk>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

fn run_receiver(mut receiver: Box<dyn Receiver>, queue: Sender<Chunk>, stop: Arc<AtomicBool>) {
    let stream = receiver.config().stream.clone();
    if let Err(err) = receiver.connect() {
        log::error!("Receiver worker for `{}` could not connect: {}", stream, err);
        return;
    }
    if receiver.config().verbose {
        log::info!("Receiver worker for `{}` connected", stream);
    }

    while !stop.load(Ordering::SeqCst) {
        match receiver.receive_data() {
            Ok(chunk) => {
                if queue.send(chunk).is_err() {
                    break;
                }
            }
            Err(err) => {
                log::error!("Receiver worker for `{}` failed: {}", stream, err);
                break;
            }
        }
    }
    log::debug!("Receiver worker for `{}` exited", stream);
}

impl ReceiverWorker {
    /// Spawns a worker owning `receiver`; the worker connects on its own thread
    pub fn spawn(receiver: Box<dyn Receiver>, capacity: usize) -> Result<Self> {
        let stream = receiver.config().stream.clone();
        let (tx, rx) = bounded(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("receive {}", stream))
            .spawn(move || run_receiver(receiver, tx, stop_flag))?;

        Ok(Self {
            stream,
            queue: Some(rx),
            stop,
            handle: Some(handle),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    fn queue(&self) -> Result<&QueueReceiver<Chunk>> {
        self.queue
            .as_ref()
            .ok_or_else(|| Error::NotStarted(self.stream.clone()))
    }

    /// Blocks until the worker delivers a chunk.
    ///
    /// Fails with [`Error::WorkerTerminated`] once the worker exited and the
    /// queue is drained.
    pub fn pull_data(&self) -> Result<Chunk> {
        self.queue()?
            .recv()
            .map_err(|_| Error::WorkerTerminated(self.stream.clone()))
    }

    /// Like [`pull_data`](Self::pull_data) but gives up after `timeout`
    pub fn pull_data_timeout(&self, timeout: Duration) -> Result<Option<Chunk>> {
        match self.queue()?.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::WorkerTerminated(self.stream.clone())),
        }
    }

    pub fn try_pull_data(&self) -> Result<Option<Chunk>> {
        match self.queue()?.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::WorkerTerminated(self.stream.clone())),
        }
    }

    /// Chunks waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.as_ref().map(QueueReceiver::len).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the worker and discards queued chunks.
    ///
    /// A worker blocked inside its transport is detached; it exits on its
    /// next iteration since the queue is gone.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(queue) = self.queue.take() {
            let dropped = queue.try_iter().count();
            if dropped > 0 {
                log::debug!("Discarded {} queued chunks of `{}`", dropped, self.stream);
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("Receiver worker for `{}` panicked", self.stream);
                }
            } else {
                log::debug!("Detaching receiver worker for `{}`", self.stream);
            }
        }
    }
}

impl Drop for ReceiverWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A receiver together with its optional background worker.
///
/// `start` spawns a worker running a replica of the receiver, `pull_data`
/// blocks on the worker's queue and `close` (or dropping) stops it.
pub struct BackgroundReceiver {
    receiver: Box<dyn Receiver>,
    worker: Option<ReceiverWorker>,
    capacity: usize,
}

impl BackgroundReceiver {
    pub fn new(receiver: Box<dyn Receiver>) -> Self {
        Self::with_capacity(receiver, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(receiver: Box<dyn Receiver>, capacity: usize) -> Self {
        Self {
            receiver,
            worker: None,
            capacity,
        }
    }

    pub fn receiver(&self) -> &dyn Receiver {
        self.receiver.as_ref()
    }

    pub fn receiver_mut(&mut self) -> &mut dyn Receiver {
        self.receiver.as_mut()
    }

    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawns the worker; starting twice keeps the running one
    pub fn start(&mut self) -> Result<&mut Self> {
        if self.worker.is_none() {
            self.worker = Some(ReceiverWorker::spawn(self.receiver.replicate(), self.capacity)?);
        }
        Ok(self)
    }

    fn worker(&self) -> Result<&ReceiverWorker> {
        self.worker
            .as_ref()
            .ok_or_else(|| Error::NotStarted(self.receiver.config().stream.clone()))
    }

    pub fn pull_data(&self) -> Result<Chunk> {
        self.worker()?.pull_data()
    }

    pub fn pull_data_timeout(&self, timeout: Duration) -> Result<Option<Chunk>> {
        self.worker()?.pull_data_timeout(timeout)
    }

    pub fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    /// Starts the worker, runs `f` and closes the worker whatever `f` returns
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.start()?;
        let result = f(self);
        self.close();
        result
    }

    pub fn into_inner(mut self) -> Box<dyn Receiver> {
        self.close();
        let replica = self.receiver.replicate();
        std::mem::replace(&mut self.receiver, replica)
    }
}

impl Drop for BackgroundReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ChannelMetadata, StreamMetadata};
    use ndarray::array;

    struct Failing {
        config: ReceiverConfig,
    }

    impl Receiver for Failing {
        fn config(&self) -> &ReceiverConfig {
            &self.config
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn connect(&mut self) -> Result<StreamInfo> {
            Err(Error::Connection(format!("no stream `{}`", self.config.stream)))
        }

        fn stream_info(&mut self) -> Result<StreamInfo> {
            self.connect()
        }

        fn receive_data(&mut self) -> Result<Chunk> {
            unreachable!()
        }

        fn replicate(&self) -> Box<dyn Receiver> {
            Box::new(Failing {
                config: self.config.clone(),
            })
        }
    }

    struct Finite {
        config: ReceiverConfig,
        remaining: usize,
    }

    impl Receiver for Finite {
        fn config(&self) -> &ReceiverConfig {
            &self.config
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn connect(&mut self) -> Result<StreamInfo> {
            Ok(StreamInfo::new(
                StreamMetadata::new(self.config.stream.clone(), 1, 10.0),
                vec![ChannelMetadata::new("CH1", "", "")],
            ))
        }

        fn stream_info(&mut self) -> Result<StreamInfo> {
            self.connect()
        }

        fn receive_data(&mut self) -> Result<Chunk> {
            if self.remaining == 0 {
                return Err(Error::Transport("exhausted".into()));
            }
            self.remaining -= 1;
            Chunk::new(array![0.0], array![[self.remaining as f64]])
        }

        fn replicate(&self) -> Box<dyn Receiver> {
            Box::new(Finite {
                config: self.config.clone(),
                remaining: self.remaining,
            })
        }
    }

    #[test]
    fn test_pull_before_start_is_rejected() {
        let background = BackgroundReceiver::new(Box::new(Failing {
            config: ReceiverConfig::new("missing"),
        }));
        assert!(matches!(background.pull_data(), Err(Error::NotStarted(_))));
    }

    #[test]
    fn test_connect_failure_terminates_worker() {
        let mut background = BackgroundReceiver::new(Box::new(Failing {
            config: ReceiverConfig::new("missing"),
        }));
        background.start().unwrap();
        assert!(matches!(background.pull_data(), Err(Error::WorkerTerminated(_))));
    }

    #[test]
    fn test_queued_chunks_survive_worker_exit() {
        let mut background = BackgroundReceiver::new(Box::new(Finite {
            config: ReceiverConfig::new("finite"),
            remaining: 2,
        }));
        let pulled = background
            .scoped(|bg| {
                let first = bg.pull_data()?;
                let second = bg.pull_data()?;
                assert!(matches!(bg.pull_data(), Err(Error::WorkerTerminated(_))));
                Ok(vec![first, second])
            })
            .unwrap();
        assert_eq!(pulled[0].samples, array![[1.0]]);
        assert_eq!(pulled[1].samples, array![[0.0]]);
        assert!(!background.is_started());
    }

    #[test]
    fn test_config_options_flatten() {
        let config: ReceiverConfig =
            serde_json::from_value(serde_json::json!({"stream": "Unicorn", "chunk_size": 0.5})).unwrap();
        assert_eq!(config.stream_type, StreamType::Name);
        assert!(config.verbose);
        assert_eq!(config.option_f64("chunk_size"), Some(0.5));
    }
}
