use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Sensor family of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelKind {
    /// Accelerometer
    Acc,
    /// Battery level
    Bat,
    /// Blood volume pressure
    Bvp,
    /// Sample counter
    Cnt,
    /// Digital input/output
    Di,
    /// Electrocardiogram
    Ecg,
    /// Electrodermal activity
    Eda,
    /// Electroencephalogram
    Eeg,
    /// Electromyogram
    Emg,
    /// Electrooculogram
    Eog,
    /// Footswitch
    Fsw,
    /// Gyroscope
    Gyr,
    /// Piezoelectric respiration belt
    Pzt,
    /// Signal quality indicator
    Qc,
    /// Temperature
    Temp,
    /// Generic fallback
    #[default]
    Custom,
}

/// Maps raw sensor labels to channel kinds for one device kind
pub type SensorTable = &'static [(&'static str, ChannelKind)];

impl ChannelKind {
    pub const ALL: [ChannelKind; 16] = [
        ChannelKind::Acc,
        ChannelKind::Bat,
        ChannelKind::Bvp,
        ChannelKind::Cnt,
        ChannelKind::Di,
        ChannelKind::Ecg,
        ChannelKind::Eda,
        ChannelKind::Eeg,
        ChannelKind::Emg,
        ChannelKind::Eog,
        ChannelKind::Fsw,
        ChannelKind::Gyr,
        ChannelKind::Pzt,
        ChannelKind::Qc,
        ChannelKind::Temp,
        ChannelKind::Custom,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ChannelKind::Acc => "ACC",
            ChannelKind::Bat => "BAT",
            ChannelKind::Bvp => "BVP",
            ChannelKind::Cnt => "CNT",
            ChannelKind::Di => "DI",
            ChannelKind::Ecg => "ECG",
            ChannelKind::Eda => "EDA",
            ChannelKind::Eeg => "EEG",
            ChannelKind::Emg => "EMG",
            ChannelKind::Eog => "EOG",
            ChannelKind::Fsw => "FSW",
            ChannelKind::Gyr => "GYR",
            ChannelKind::Pzt => "PZT",
            ChannelKind::Qc => "QC",
            ChannelKind::Temp => "TEMP",
            ChannelKind::Custom => "CUSTOM",
        }
    }

    pub fn default_unit(&self) -> &'static str {
        match self {
            ChannelKind::Eeg => "muV",
            ChannelKind::Ecg | ChannelKind::Emg | ChannelKind::Eog => "mV",
            ChannelKind::Eda => "muS",
            ChannelKind::Pzt => "V",
            ChannelKind::Acc => "g",
            ChannelKind::Gyr => "deg/s",
            ChannelKind::Temp => "degC",
            ChannelKind::Bat => "%",
            ChannelKind::Bvp
            | ChannelKind::Cnt
            | ChannelKind::Di
            | ChannelKind::Fsw
            | ChannelKind::Qc
            | ChannelKind::Custom => "",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    /// Table mapping every kind tag to itself, used by devices without a vendor table
    pub fn identity_table() -> SensorTable {
        &[
            ("ACC", ChannelKind::Acc),
            ("BAT", ChannelKind::Bat),
            ("BVP", ChannelKind::Bvp),
            ("CNT", ChannelKind::Cnt),
            ("DI", ChannelKind::Di),
            ("ECG", ChannelKind::Ecg),
            ("EDA", ChannelKind::Eda),
            ("EEG", ChannelKind::Eeg),
            ("EMG", ChannelKind::Emg),
            ("EOG", ChannelKind::Eog),
            ("FSW", ChannelKind::Fsw),
            ("GYR", ChannelKind::Gyr),
            ("PZT", ChannelKind::Pzt),
            ("QC", ChannelKind::Qc),
            ("TEMP", ChannelKind::Temp),
            ("CUSTOM", ChannelKind::Custom),
        ]
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_tag(s).ok_or_else(|| Error::InvalidConfig(format!("Unknown channel kind `{}`", s)))
    }
}

/// Resolves a raw sensor label to a channel kind.
///
/// Looks up an exact match in `table`; on a miss the last character is
/// stripped and the lookup retried, so `"EEG 3"` resolves through `"EEG "`
/// to `"EEG"`. Labels sharing a prefix alias to the same kind. Missing or
/// exhausted labels resolve to [`ChannelKind::Custom`].
pub fn sensor_to_channel_type(table: &[(&str, ChannelKind)], label: Option<&str>) -> ChannelKind {
    let mut candidate = match label {
        Some(label) if !label.is_empty() => label,
        _ => return ChannelKind::Custom,
    };

    loop {
        if let Some((_, kind)) = table.iter().find(|(sensor, _)| *sensor == candidate) {
            return *kind;
        }

        match candidate.char_indices().last() {
            Some((idx, _)) if idx > 0 => candidate = &candidate[..idx],
            _ => return ChannelKind::Custom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: SensorTable = &[
        ("EEG", ChannelKind::Eeg),
        ("ECG", ChannelKind::Ecg),
        ("RESPIRATION", ChannelKind::Pzt),
        ("nSeq", ChannelKind::Cnt),
    ];

    #[test]
    fn test_suffix_stripping_resolves_base_family() {
        assert_eq!(sensor_to_channel_type(TABLE, Some("EEG 3")), ChannelKind::Eeg);
        assert_eq!(
            sensor_to_channel_type(TABLE, Some("EEG 3")),
            sensor_to_channel_type(TABLE, Some("EEG"))
        );
        assert_eq!(sensor_to_channel_type(TABLE, Some("RESPIRATION_chest")), ChannelKind::Pzt);
    }

    #[test]
    fn test_missing_labels_fall_back_to_custom() {
        assert_eq!(sensor_to_channel_type(TABLE, Some("")), ChannelKind::Custom);
        assert_eq!(sensor_to_channel_type(TABLE, None), ChannelKind::Custom);
        assert_eq!(sensor_to_channel_type(TABLE, Some("XYZ")), ChannelKind::Custom);
    }

    #[test]
    fn test_exact_match_wins_over_stripping() {
        const NESTED: SensorTable = &[("EE", ChannelKind::Custom), ("EEG", ChannelKind::Eeg)];
        assert_eq!(sensor_to_channel_type(NESTED, Some("EEG")), ChannelKind::Eeg);
        assert_eq!(sensor_to_channel_type(NESTED, Some("EEX")), ChannelKind::Custom);
    }

    #[test]
    fn test_multibyte_labels_strip_by_character() {
        assert_eq!(sensor_to_channel_type(TABLE, Some("ECGµ")), ChannelKind::Ecg);
    }

    #[test]
    fn test_tag_roundtrip() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_tag(kind.tag()), Some(kind));
        }
        assert!("EEG".parse::<ChannelKind>().is_ok());
    }
}
