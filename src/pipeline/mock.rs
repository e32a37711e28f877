use ndarray::{Array1, Array2};
use serde_json::Value;
use std::f64::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

use super::receiver::{Receiver, ReceiverConfig, ReceiverFromConfig};
use super::types::{ChannelMetadata, Chunk, StreamInfo, StreamMetadata};
use crate::error::{Error, Result};

/// Sine generator standing in for hardware.
///
/// Options: `nominal_srate` (default 250), `channels` (list of labels) or
/// `channel_count` (default 4), `frequency` in Hz (default 10), `amplitude`
/// (default 1), `samples_per_chunk` (default a tenth of a second) and
/// `realtime` to pace chunks at the nominal rate.
pub struct SimulatedReceiver {
    config: ReceiverConfig,
    info: Option<StreamInfo>,
    phase: f64,
    frame_counter: u64,
    started: Option<Instant>,
}

impl SimulatedReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self::from_config(config)
    }

    fn sampling_rate(&self) -> f64 {
        self.config.option_f64("nominal_srate").unwrap_or(250.0)
    }

    fn labels(&self) -> Vec<String> {
        match self.config.options.get("channels") {
            Some(Value::Array(labels)) => labels
                .iter()
                .enumerate()
                .map(|(i, label)| label.as_str().map(str::to_string).unwrap_or_else(|| format!("CH{}", i)))
                .collect(),
            _ => {
                let count = self
                    .config
                    .options
                    .get("channel_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(4);
                (1..=count).map(|i| format!("EEG {}", i)).collect()
            }
        }
    }

    fn samples_per_chunk(&self) -> usize {
        self.config
            .options
            .get("samples_per_chunk")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or_else(|| (self.sampling_rate() / 10.0).ceil() as usize)
            .max(1)
    }

    fn generate_samples(&mut self, n_samples: usize, n_channels: usize) -> Array2<f64> {
        let frequency = self.config.option_f64("frequency").unwrap_or(10.0);
        let amplitude = self.config.option_f64("amplitude").unwrap_or(1.0);
        let delta_phase = 2.0 * PI * frequency / self.sampling_rate();

        let mut samples = Array2::zeros((n_samples, n_channels));
        for mut row in samples.rows_mut() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = amplitude * (self.phase + c as f64 * PI / 4.0).sin();
            }
            self.phase += delta_phase;
            if self.phase > 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }
        samples
    }
}

impl ReceiverFromConfig for SimulatedReceiver {
    fn from_config(config: ReceiverConfig) -> Self {
        Self {
            config,
            info: None,
            phase: 0.0,
            frame_counter: 0,
            started: None,
        }
    }
}

impl Receiver for SimulatedReceiver {
    fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.info.is_some()
    }

    fn connect(&mut self) -> Result<StreamInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let sampling_rate = self.sampling_rate();
        if sampling_rate <= 0.0 {
            return Err(Error::InvalidSamplingRate(sampling_rate));
        }
        let channels: Vec<ChannelMetadata> = self
            .labels()
            .into_iter()
            .map(|label| ChannelMetadata::new(label, "muV", "EEG"))
            .collect();
        let mut meta = StreamMetadata::new(self.config.stream.clone(), channels.len(), sampling_rate);
        meta.stream_type = "EEG".into();
        meta.hostname = "simulated".into();

        let info = StreamInfo::new(meta, channels);
        self.info = Some(info.clone());
        self.started = Some(Instant::now());
        Ok(info)
    }

    fn stream_info(&mut self) -> Result<StreamInfo> {
        self.connect()
    }

    fn receive_data(&mut self) -> Result<Chunk> {
        let info = self.connect()?;
        let sampling_rate = info.nominal_srate();
        let n_samples = self.samples_per_chunk();
        let n_channels = info.meta_data.channel_count;

        let first = self.frame_counter;
        self.frame_counter += n_samples as u64;
        if self.config.option_bool("realtime").unwrap_or(false) {
            if let Some(started) = self.started {
                let due = Duration::from_secs_f64(self.frame_counter as f64 / sampling_rate);
                let elapsed = started.elapsed();
                if due > elapsed {
                    thread::sleep(due - elapsed);
                }
            }
        }

        let timestamps = Array1::from_iter((first..self.frame_counter).map(|i| i as f64 / sampling_rate));
        let samples = self.generate_samples(n_samples, n_channels);
        Chunk::new(timestamps, samples)
    }

    fn replicate(&self) -> Box<dyn Receiver> {
        Box::new(Self::from_config(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_configured_layout() {
        let mut receiver = SimulatedReceiver::new(
            ReceiverConfig::new("sim")
                .with_option("nominal_srate", 100.0)
                .with_option("channels", serde_json::json!(["EEG 1", "ECG"]))
                .with_option("samples_per_chunk", 5u64),
        );
        let info = receiver.stream_info().unwrap();
        assert_eq!(info.channels.len(), 2);

        let first = receiver.receive_data().unwrap();
        let second = receiver.receive_data().unwrap();
        assert_eq!(first.samples.dim(), (5, 2));
        assert_eq!(second.timestamps[0], 0.05);
        assert!(first.samples.iter().all(|v| v.abs() <= 1.0));
    }
}
