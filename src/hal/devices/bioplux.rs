use std::sync::Arc;

use crate::error::Result;
use crate::hal::channel::Channel;
use crate::hal::channel_kind::{ChannelKind, SensorTable};
use crate::hal::registry::{DeviceKind, DeviceKindRegistration, DEFAULT_LOCATION};

/// PLUX biosignalsplux hub recorded through OpenSignals
#[derive(Debug, Clone, Copy, Default)]
pub struct Bioplux;

pub const SAMPLING_RATE: f64 = 500.0;

/// Default layout as `(name, port label, kind)`
const LAYOUT: &[(&str, &str, ChannelKind)] = &[
    ("DI", "DI", ChannelKind::Di),
    ("EOG", "CH1", ChannelKind::Eog),
    ("ECG", "CH2", ChannelKind::Ecg),
    ("RESPIRATION", "CH3", ChannelKind::Pzt),
    ("EEG", "CH4", ChannelKind::Eeg),
    ("EDA", "CH5", ChannelKind::Eda),
    ("EMG", "CH6", ChannelKind::Emg),
    ("FSW", "CH8", ChannelKind::Fsw),
    ("BPV", "CH7", ChannelKind::Bvp),
];

const SENSORS: SensorTable = &[
    ("BVP", ChannelKind::Bvp),
    ("nSeq", ChannelKind::Cnt),
    ("ECG", ChannelKind::Ecg),
    ("EDA", ChannelKind::Eda),
    ("EEG", ChannelKind::Eeg),
    ("EMG", ChannelKind::Emg),
    ("EOG", ChannelKind::Eog),
    ("TEMP", ChannelKind::Temp),
    ("RESPIRATION", ChannelKind::Pzt),
    ("DI", ChannelKind::Di),
    ("CUSTOM", ChannelKind::Fsw),
];

impl DeviceKind for Bioplux {
    fn class_name(&self) -> &'static str {
        "Bioplux"
    }

    fn default_channels(&self) -> Result<Vec<Channel>> {
        LAYOUT
            .iter()
            .map(|(name, port, kind)| {
                Ok(Channel::of_kind(*kind, *name, SAMPLING_RATE)?.with_label(*port))
            })
            .collect()
    }

    fn sensor_table(&self) -> SensorTable {
        SENSORS
    }
}

fn kind() -> Arc<dyn DeviceKind> {
    Arc::new(Bioplux)
}

inventory::submit! {
    DeviceKindRegistration {
        location: DEFAULT_LOCATION,
        factory: kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::channel_kind::sensor_to_channel_type;

    #[test]
    fn test_default_layout() {
        let channels = Bioplux.default_channels().unwrap();
        assert_eq!(channels.len(), 9);
        assert_eq!(channels[1].label(), "CH1");
        assert_eq!(channels[3].unit(), "V");
        assert_eq!(channels[4].unit(), "muV");
        assert!(channels.iter().all(|c| c.sampling_rate() == SAMPLING_RATE));
    }

    #[test]
    fn test_vendor_labels() {
        assert_eq!(sensor_to_channel_type(SENSORS, Some("nSeq")), ChannelKind::Cnt);
        assert_eq!(sensor_to_channel_type(SENSORS, Some("CUSTOM/0.5/V")), ChannelKind::Fsw);
        assert_eq!(sensor_to_channel_type(SENSORS, Some("EMG2")), ChannelKind::Emg);
    }
}
