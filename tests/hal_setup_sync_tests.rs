use biosync::hal::{Channel, Device, DeviceRegistry, Setup, SyncOptions};
use biosync::pipeline::{
    BackgroundTransmitter, ChannelMetadata, Chunk, LoopbackReceiver, LoopbackTransmitter, Receiver, ReceiverConfig,
    SimulatedReceiver, StreamInfo, StreamMetadata, TransmitterConfig, TransmitterFromConfig,
};
use biosync::{Error, Result};
use ndarray::{array, Array2};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Emits `value` rows forever, waiting `delay` before every chunk
#[derive(Clone)]
struct Delayed {
    config: ReceiverConfig,
    delay: Duration,
    value: f64,
    labels: Vec<&'static str>,
    broken: bool,
}

impl Delayed {
    fn new(stream: &str, delay: Duration, value: f64) -> Self {
        Self {
            config: ReceiverConfig::new(stream).with_verbose(false),
            delay,
            value,
            labels: vec!["CH"],
            broken: false,
        }
    }

    /// Announces a stream without any channel entries
    fn unlabelled(mut self) -> Self {
        self.labels.clear();
        self
    }

    /// Fails on every read
    fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
}

impl Receiver for Delayed {
    fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn connect(&mut self) -> Result<StreamInfo> {
        Ok(StreamInfo::new(
            StreamMetadata::new(self.config.stream.clone(), self.labels.len(), 100.0),
            self.labels
                .iter()
                .map(|label| ChannelMetadata::new(*label, "", ""))
                .collect(),
        ))
    }

    fn stream_info(&mut self) -> Result<StreamInfo> {
        self.connect()
    }

    fn receive_data(&mut self) -> Result<Chunk> {
        thread::sleep(self.delay);
        if self.broken {
            return Err(Error::Connection(format!("`{}` went away", self.config.stream)));
        }
        Chunk::new(array![0.0, 0.01], array![[self.value], [self.value]])
    }

    fn replicate(&self) -> Box<dyn Receiver> {
        Box::new(self.clone())
    }
}

fn device(name: &str) -> Device {
    Device::with_channels(name, vec![Channel::new("CH", 100.0).unwrap()]).unwrap()
}

#[test]
fn test_receive_waits_for_slowest_device() {
    let fast = device("fast");
    let slow = device("slow");
    let setup = Setup::new("barrier", vec![fast.clone(), slow.clone()]).unwrap();
    let delay = Duration::from_millis(300);

    let started = Instant::now();
    let chunks = setup
        .receive_data_with(
            Some(vec![
                Box::new(Delayed::new("fast", Duration::ZERO, 1.0)),
                Box::new(Delayed::new("slow", delay, 2.0)),
            ]),
            Some(SyncOptions::none()),
        )
        .unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(chunks.len(), 2);

    assert_eq!(fast.data().unwrap(), Some(array![[1.0], [1.0]]));
    assert_eq!(slow.data().unwrap(), Some(array![[2.0], [2.0]]));

    setup.receive_data().unwrap();
    assert_eq!(fast.data().unwrap().unwrap().nrows(), 4);
    assert_eq!(slow.data().unwrap().unwrap().nrows(), 4);
    setup.stop();
    assert!(!setup.is_receiving());
}

#[test]
fn test_receiver_count_must_match_devices() {
    let setup = Setup::new("mismatch", vec![device("a"), device("b")]).unwrap();
    let result = setup.receive_data_with(
        Some(vec![Box::new(Delayed::new("a", Duration::ZERO, 0.0))]),
        None,
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_bound_device_rejects_setup_receivers() {
    let a = device("a");
    a.set_receiver_with(Box::new(Delayed::new("a", Duration::ZERO, 0.0)), SyncOptions::none())
        .unwrap();
    let setup = Setup::new("bound", vec![a]).unwrap();
    let result = setup.receive_data_with(
        Some(vec![Box::new(Delayed::new("other", Duration::ZERO, 0.0))]),
        None,
    );
    assert!(matches!(result, Err(Error::ReceiverAlreadyBound(_))));
}

#[test]
fn test_failed_bind_restores_every_device() {
    let a = device("a");
    let b = device("b");
    let setup = Setup::new("rollback", vec![a.clone(), b.clone()]).unwrap();

    let result = setup.receive_data_with(
        Some(vec![
            Box::new(Delayed::new("stream a", Duration::ZERO, 1.0)),
            Box::new(Delayed::new("stream b", Duration::ZERO, 2.0).unlabelled()),
        ]),
        Some(SyncOptions::all()),
    );
    assert!(matches!(result, Err(Error::EmptyChannelMetadata(_))));
    assert!(!setup.is_receiving());
    for (device, name) in [(&a, "a"), (&b, "b")] {
        assert!(!device.has_receiver());
        assert_eq!(device.name(), name);
        assert_eq!(device.channel_names(), vec!["CH"]);
    }

    let chunks = setup
        .receive_data_with(
            Some(vec![
                Box::new(Delayed::new("stream a", Duration::ZERO, 1.0)),
                Box::new(Delayed::new("stream b", Duration::ZERO, 2.0)),
            ]),
            Some(SyncOptions::all()),
        )
        .unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(a.name(), "stream a");
    assert_eq!(b.data().unwrap(), Some(array![[2.0], [2.0]]));
    setup.stop();
}

#[test]
fn test_device_added_while_receiving_gets_a_worker() {
    let a = device("a");
    let b = device("b");
    let setup = Setup::new("grow", vec![a.clone()]).unwrap();
    setup
        .receive_data_with(
            Some(vec![Box::new(Delayed::new("a", Duration::ZERO, 1.0))]),
            Some(SyncOptions::none()),
        )
        .unwrap();
    assert!(setup.is_receiving());

    b.set_receiver_with(Box::new(Delayed::new("b", Duration::ZERO, 2.0)), SyncOptions::none())
        .unwrap();
    setup.push_device(b.clone()).unwrap();
    assert!(!setup.is_receiving());

    let chunks = setup.receive_data().unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(a.data().unwrap().unwrap().nrows(), 4);
    assert_eq!(b.data().unwrap(), Some(array![[2.0], [2.0]]));
    setup.stop();
}

#[test]
fn test_chunks_before_a_failed_device_are_kept() {
    let healthy = device("healthy");
    let failing = device("failing");
    let setup = Setup::new("partial", vec![healthy.clone(), failing.clone()]).unwrap();

    let result = setup.receive_data_with(
        Some(vec![
            Box::new(Delayed::new("healthy", Duration::ZERO, 1.0)),
            Box::new(Delayed::new("failing", Duration::ZERO, 0.0).broken()),
        ]),
        Some(SyncOptions::none()),
    );
    assert!(matches!(result, Err(Error::WorkerTerminated(_))));
    assert_eq!(healthy.data().unwrap(), Some(array![[1.0], [1.0]]));
    assert_eq!(failing.data().unwrap(), None);
    setup.stop();
}

#[tokio::test]
async fn test_from_simulated_streams() {
    let registry = DeviceRegistry::with_builtin();
    let template = ReceiverConfig::new("")
        .with_verbose(false)
        .with_option("nominal_srate", 250.0)
        .with_option("channels", serde_json::json!(["EEG 1", "EEG 2", "Q1", "Q2"]))
        .with_option("samples_per_chunk", 25u64);
    let setup = Setup::from_streams::<SimulatedReceiver, _>(
        "simulated",
        &["Melomind sim", "Some amplifier"],
        &template,
        &registry,
    )
    .unwrap();

    let devices = setup.devices();
    assert_eq!(devices[0].class_name(), "Melomind");
    assert_eq!(devices[0].name(), "Melomind sim");
    assert_eq!(devices[1].class_name(), "Device");
    assert_eq!(devices[1].channel_names(), vec!["EEG 1", "EEG 2", "Q1", "Q2"]);

    let receiving = setup.clone();
    let round = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || receiving.receive_data()),
    )
    .await
    .expect("acquisition round timed out")
    .unwrap();
    let chunks = tokio_test::assert_ok!(round);
    assert!(chunks.iter().all(|chunk| chunk.samples.dim() == (25, 4)));
    assert_eq!(devices[0].data().unwrap().unwrap().dim(), (25, 4));
    setup.stop();
}

#[test]
fn test_from_loopback_streams() {
    let registry = DeviceRegistry::with_builtin();
    let source = Device::of_kind(registry.resolve("Unicorn", None).unwrap()).unwrap();
    let stream = "Unicorn loopback sync test";
    let n_channels = source.n_channels();

    let config = TransmitterConfig::from_device(&source, Some(stream))
        .with_terminate_when_empty(false)
        .with_verbose(false);
    let mut transmitter = BackgroundTransmitter::new(Box::new(LoopbackTransmitter::from_config(config)));
    transmitter.start().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let feeding = running.clone();
    let feeder = thread::spawn(move || {
        let mut round = 0.0;
        while feeding.load(Ordering::SeqCst) {
            transmitter
                .push_data(Array2::from_elem((5, n_channels), round))
                .unwrap();
            round += 1.0;
            thread::sleep(Duration::from_millis(10));
        }
        transmitter.stop();
    });

    let template = ReceiverConfig::new("")
        .with_verbose(false)
        .with_option("chunk_size", 10u64)
        .with_option("resolve_timeout", 2.0);
    let setup = Setup::from_streams::<LoopbackReceiver, _>("loopback", &[stream], &template, &registry).unwrap();
    let device = setup.device_at(0).unwrap();
    assert_eq!(device.class_name(), "Unicorn");
    assert_eq!(device.n_channels(), n_channels);
    assert_eq!(device.channel_names(), source.channel_names());

    let first = setup.receive_data().unwrap();
    let second = setup.receive_data().unwrap();
    assert_eq!(first[0].samples.dim(), (10, n_channels));
    assert!(second[0].timestamps[0] >= first[0].timestamps[9]);
    assert_eq!(device.data().unwrap().unwrap().nrows(), 20);

    setup.stop();
    running.store(false, Ordering::SeqCst);
    feeder.join().unwrap();
}
