use std::sync::Arc;

use crate::error::Result;
use crate::hal::channel::Channel;
use crate::hal::channel_kind::{ChannelKind, SensorTable};
use crate::hal::registry::{DeviceKind, DeviceKindRegistration, DEFAULT_LOCATION};

/// myBrain Melomind two-electrode EEG headset
#[derive(Debug, Clone, Copy, Default)]
pub struct Melomind;

pub const SAMPLING_RATE: f64 = 250.0;

const LAYOUT: &[(&str, ChannelKind)] = &[
    ("EEG 1", ChannelKind::Eeg),
    ("EEG 2", ChannelKind::Eeg),
    ("Q1", ChannelKind::Qc),
    ("Q2", ChannelKind::Qc),
];

const SENSORS: SensorTable = &[
    ("EEG 1", ChannelKind::Eeg),
    ("EEG 2", ChannelKind::Eeg),
    ("EEG", ChannelKind::Eeg),
    ("Q1", ChannelKind::Qc),
    ("Q2", ChannelKind::Qc),
    ("Q", ChannelKind::Qc),
];

impl DeviceKind for Melomind {
    fn class_name(&self) -> &'static str {
        "Melomind"
    }

    fn default_channels(&self) -> Result<Vec<Channel>> {
        LAYOUT
            .iter()
            .map(|(name, kind)| Channel::of_kind(*kind, *name, SAMPLING_RATE))
            .collect()
    }

    fn sensor_table(&self) -> SensorTable {
        SENSORS
    }
}

fn kind() -> Arc<dyn DeviceKind> {
    Arc::new(Melomind)
}

inventory::submit! {
    DeviceKindRegistration {
        location: DEFAULT_LOCATION,
        factory: kind,
    }
}
