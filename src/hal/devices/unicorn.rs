use std::sync::Arc;

use crate::error::Result;
use crate::hal::channel::Channel;
use crate::hal::channel_kind::{ChannelKind, SensorTable};
use crate::hal::registry::{DeviceKind, DeviceKindRegistration, DEFAULT_LOCATION};

/// g.tec Unicorn Hybrid Black EEG headset
#[derive(Debug, Clone, Copy, Default)]
pub struct Unicorn;

pub const SAMPLING_RATE: f64 = 250.0;

const SENSORS: SensorTable = &[
    ("EEG", ChannelKind::Eeg),
    ("ACC", ChannelKind::Acc),
    ("Accelerometer", ChannelKind::Acc),
    ("GYR", ChannelKind::Gyr),
    ("Gyroscope", ChannelKind::Gyr),
    ("BATT", ChannelKind::Bat),
    ("Battery Level", ChannelKind::Bat),
    ("CNT", ChannelKind::Cnt),
    ("Counter", ChannelKind::Cnt),
    ("VALID", ChannelKind::Qc),
    ("Validation Indicator", ChannelKind::Qc),
];

fn layout() -> Vec<(String, String, ChannelKind)> {
    let mut layout: Vec<(String, String, ChannelKind)> = (1..=8)
        .map(|i| (format!("EEG {}", i), format!("EEG {}", i), ChannelKind::Eeg))
        .collect();
    for axis in ["X", "Y", "Z"] {
        layout.push((format!("Accelerometer {}", axis), format!("ACC {}", axis), ChannelKind::Acc));
    }
    for axis in ["X", "Y", "Z"] {
        layout.push((format!("Gyroscope {}", axis), format!("GYR {}", axis), ChannelKind::Gyr));
    }
    layout.push(("Battery Level".into(), "BATT".into(), ChannelKind::Bat));
    layout.push(("Counter".into(), "CNT".into(), ChannelKind::Cnt));
    layout.push(("Validation Indicator".into(), "VALID".into(), ChannelKind::Qc));
    layout
}

impl DeviceKind for Unicorn {
    fn class_name(&self) -> &'static str {
        "Unicorn"
    }

    fn default_channels(&self) -> Result<Vec<Channel>> {
        layout()
            .into_iter()
            .map(|(name, label, kind)| Ok(Channel::of_kind(kind, name, SAMPLING_RATE)?.with_label(label)))
            .collect()
    }

    fn sensor_table(&self) -> SensorTable {
        SENSORS
    }
}

fn kind() -> Arc<dyn DeviceKind> {
    Arc::new(Unicorn)
}

inventory::submit! {
    DeviceKindRegistration {
        location: DEFAULT_LOCATION,
        factory: kind,
    }
}
