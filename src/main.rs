use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use biosync::hal::{Device, DeviceRegistry, Setup};
use biosync::pipeline::{
    BackgroundTransmitter, LoopbackReceiver, LoopbackTransmitter, Receiver, ReceiverConfig, ReceiverFromConfig,
    SimulatedReceiver, TransmitterConfig, TransmitterFromConfig,
};
use biosync::session::Sample;
use biosync::SessionConfig;

#[derive(Parser)]
#[command(name = "biosync", about = "Multi-device biosignal acquisition and stream synchronization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered device classes and aliases
    Devices,
    /// Stream simulated devices over the loopback bus and record them in sync
    Demo {
        /// Device classes to simulate
        #[arg(long, value_delimiter = ',', default_value = "Unicorn,Melomind")]
        devices: Vec<String>,
        /// Acquisition rounds, 0 runs until Ctrl-C
        #[arg(long, default_value_t = 10)]
        rounds: usize,
        /// Seconds of signal per chunk
        #[arg(long, default_value_t = 0.2)]
        chunk: f64,
    },
    /// Load a session document and print the resolved hierarchy
    Session { config: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let registry = DeviceRegistry::discover();

    match cli.command {
        Command::Devices => {
            for class in registry.list_classes() {
                println!("{}", class);
            }
            for (alias, class) in registry.list_aliases() {
                println!("{} -> {}", alias, class);
            }
        }
        Command::Demo { devices, rounds, chunk } => {
            tokio::select! {
                result = tokio::task::spawn_blocking(move || run_demo(devices, rounds, chunk)) => {
                    result.context("demo task panicked")??;
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted");
                }
            }
        }
        Command::Session { config } => {
            let session = SessionConfig::from_file(&config)
                .with_context(|| format!("reading session document {}", config.display()))?;
            let sample = session.build(&registry)?;
            print_sample(&sample)?;
        }
    }
    Ok(())
}

fn print_sample(sample: &Sample) -> anyhow::Result<()> {
    println!("{}", sample);
    let setup = sample.setup();
    println!("  {}", setup);
    for device in setup.devices() {
        println!("    {} ({} channels)", device, device.n_channels());
        for channel in device.channels() {
            println!(
                "      {} [{}] {} Hz {}",
                channel,
                channel.label(),
                channel.sampling_rate(),
                channel.unit()
            );
        }
    }
    if !sample.filenames().is_empty() {
        sample.load_data()?;
        for (device, data) in setup.devices().iter().zip(sample.data()) {
            let shape = data.map(|d| format!("{:?}", d.dim())).unwrap_or_else(|| "empty".into());
            println!("    {} data: {}", device.name(), shape);
        }
    }
    Ok(())
}

fn run_demo(classes: Vec<String>, rounds: usize, chunk: f64) -> anyhow::Result<()> {
    let registry = DeviceRegistry::discover();
    let running = Arc::new(AtomicBool::new(true));
    let mut feeders = Vec::new();
    let mut streams = Vec::new();

    for class in &classes {
        let device = Device::of_kind(registry.resolve(class, None)?)?;
        let stream = format!("{} demo", device.class_name());
        let rate = device.sampling_rate().unwrap_or(250.0);
        let n_samples = (rate * chunk).ceil().max(1.0) as usize;

        let config = TransmitterConfig::from_device(&device, Some(&stream))
            .with_terminate_when_empty(false)
            .with_verbose(false);
        let mut transmitter = BackgroundTransmitter::new(Box::new(LoopbackTransmitter::from_config(config)));
        transmitter.start()?;

        let mut source = SimulatedReceiver::from_config(
            ReceiverConfig::new(stream.clone())
                .with_option("nominal_srate", rate)
                .with_option("channel_count", device.n_channels() as u64)
                .with_option("samples_per_chunk", n_samples as u64)
                .with_option("realtime", true),
        );
        let running = running.clone();
        feeders.push(thread::spawn(move || -> biosync::Result<()> {
            while running.load(Ordering::SeqCst) {
                transmitter.push_data(source.receive_data()?.samples)?;
            }
            transmitter.stop();
            Ok(())
        }));
        streams.push(stream);
    }

    let template = ReceiverConfig::new("")
        .with_verbose(false)
        .with_option("chunk_size", chunk);
    let setup = Setup::from_streams::<LoopbackReceiver, _>("demo", &streams, &template, &registry)?;
    log::info!("Recording {} devices: {:?}", setup.n_devices(), setup.device_names());

    let mut round = 0;
    while rounds == 0 || round < rounds {
        let chunks = setup.receive_data()?;
        round += 1;
        for (device, chunk) in setup.devices().iter().zip(&chunks) {
            let buffered = device.data()?.map(|d| d.nrows()).unwrap_or(0);
            log::info!(
                "round {}: {} +{} samples (t0 = {:.3}s), {} buffered",
                round,
                device,
                chunk.n_samples(),
                chunk.timestamps.first().copied().unwrap_or_default(),
                buffered
            );
        }
    }

    setup.stop();
    running.store(false, Ordering::SeqCst);
    for feeder in feeders {
        match feeder.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("feeder thread panicked"),
        }
    }
    Ok(())
}
