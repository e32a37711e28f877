use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use ndarray::{Array2, ArrayView2};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::setting::Setting;
use super::subject::Subject;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::hal::buffer::{realign, BufferList};
use crate::hal::{Device, DeviceRegistry, Setup};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d_%H-%M-%S",
    "%Y-%m-%d %H-%M-%S",
    "%Y-%m-%d_%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y%m%d_%H-%M-%S",
    "%Y%m%d %H-%M-%S",
    "%Y%m%d_%H:%M:%S",
    "%Y%m%d %H:%M:%S",
    "%Y%m%d_%H%M%S",
    "%Y%m%d%H%M%S",
];

/// Acquisition time as written in a session document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    /// Seconds since the Unix epoch
    Seconds(f64),
    Text(String),
}

impl Timestamp {
    pub fn to_datetime(&self) -> Result<DateTime<Local>> {
        match self {
            Timestamp::Seconds(seconds) => {
                let secs = seconds.floor();
                let nanos = ((seconds - secs) * 1e9).round().min(999_999_999.0) as u32;
                DateTime::from_timestamp(secs as i64, nanos)
                    .map(|utc| utc.with_timezone(&Local))
                    .ok_or_else(|| Error::Parse(format!("timestamp {} is out of range", seconds)))
            }
            Timestamp::Text(text) => parse_timestamp(text),
        }
    }
}

/// Parses a local date-time in one of the accepted recording formats
pub fn parse_timestamp(text: &str) -> Result<DateTime<Local>> {
    let naive = TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .ok_or_else(|| Error::Parse(format!("Date format not recognized: {}", text)))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| Error::Parse(format!("`{}` does not exist in the local time zone", text)))
}

/// Descriptive part of a sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleMetadata {
    pub subject: Subject,
    pub setting: Option<Setting>,
    pub timestamp: DateTime<Local>,
}

pub(crate) type SampleCell = Mutex<SampleState>;

pub(crate) struct SampleState {
    setup: Setup,
    subject: Subject,
    setting: Option<Setting>,
    timestamp: DateTime<Local>,
    comments: Vec<String>,
    filenames: Vec<PathBuf>,
    data: Option<BufferList>,
}

/// One recording session: a setup, the subject and the recorded data.
///
/// A sample owns the buffer list of its setup. Buffers the setup held before
/// it was embedded move into the sample.
#[derive(Clone)]
pub struct Sample {
    inner: Arc<SampleCell>,
}

impl Sample {
    pub fn new(setup: Setup, subject: Subject) -> Self {
        let data = setup.take_buffers();
        let sample = Self {
            inner: Arc::new(Mutex::new(SampleState {
                setup: setup.clone(),
                subject,
                setting: None,
                timestamp: Local::now(),
                comments: Vec::new(),
                filenames: Vec::new(),
                data,
            })),
        };
        setup.attach_sample(Arc::downgrade(&sample.inner));
        sample
    }

    /// Builds the whole hierarchy from a session document
    pub fn from_config(config: &SessionConfig, registry: &DeviceRegistry) -> Result<Self> {
        let setup = Setup::load(&config.setup, registry)?;
        let sample = Self::new(setup, config.subject.clone());
        {
            let mut state = sample.inner.lock();
            state.setting = config.setting.clone();
            state.comments = config.comments.clone();
            state.filenames = config.filenames.clone();
            if let Some(timestamp) = &config.timestamp {
                state.timestamp = timestamp.to_datetime()?;
            }
        }
        Ok(sample)
    }

    pub(crate) fn from_cell(inner: Arc<SampleCell>) -> Self {
        Self { inner }
    }

    pub fn same_as(&self, other: &Sample) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn setup(&self) -> Setup {
        self.inner.lock().setup.clone()
    }

    pub fn subject(&self) -> Subject {
        self.inner.lock().subject.clone()
    }

    pub fn set_subject(&self, subject: Subject) {
        self.inner.lock().subject = subject;
    }

    pub fn setting(&self) -> Option<Setting> {
        self.inner.lock().setting.clone()
    }

    pub fn set_setting(&self, setting: Option<Setting>) {
        self.inner.lock().setting = setting;
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.inner.lock().timestamp
    }

    pub fn set_timestamp(&self, timestamp: DateTime<Local>) {
        self.inner.lock().timestamp = timestamp;
    }

    pub fn set_timestamp_from(&self, timestamp: &Timestamp) -> Result<()> {
        let timestamp = timestamp.to_datetime()?;
        self.set_timestamp(timestamp);
        Ok(())
    }

    pub fn comments(&self) -> Vec<String> {
        self.inner.lock().comments.clone()
    }

    pub fn comment(&self, comment: impl Into<String>) {
        self.inner.lock().comments.push(comment.into());
    }

    pub fn filenames(&self) -> Vec<PathBuf> {
        self.inner.lock().filenames.clone()
    }

    pub fn set_filenames(&self, filenames: Vec<PathBuf>) {
        self.inner.lock().filenames = filenames;
    }

    pub fn meta_data(&self) -> SampleMetadata {
        let state = self.inner.lock();
        SampleMetadata {
            subject: state.subject.clone(),
            setting: state.setting.clone(),
            timestamp: state.timestamp,
        }
    }

    pub(crate) fn with_slots<T>(&self, f: impl FnOnce(&mut BufferList) -> T) -> T {
        let mut state = self.inner.lock();
        f(state.data.get_or_insert_with(Vec::new))
    }

    pub(crate) fn realign_slots(&self, previous: &[Device], current: &[Device]) {
        let mut state = self.inner.lock();
        if let Some(slots) = state.data.take() {
            state.data = Some(realign(slots, previous, current));
        }
    }

    /// Buffer list, one entry per device of the setup
    pub fn data(&self) -> BufferList {
        let n_devices = self.setup().n_devices();
        let mut slots = self.inner.lock().data.clone().unwrap_or_default();
        slots.resize(n_devices, None);
        slots
    }

    pub fn set_data(&self, data: BufferList) -> Result<()> {
        let n_devices = self.setup().n_devices();
        if data.len() != n_devices {
            return Err(Error::Shape(format!(
                "sample holds {} devices, got {} buffers",
                n_devices,
                data.len()
            )));
        }
        self.inner.lock().data = Some(data);
        Ok(())
    }

    /// Names of all channels across devices, in order
    pub fn labels(&self) -> Vec<String> {
        self.setup()
            .devices()
            .iter()
            .flat_map(|device| device.channel_names())
            .collect()
    }

    /// Per-device time axes shaped like the device buffers.
    ///
    /// Column `c` holds `i / rate_c` for every sample `i`.
    pub fn time(&self) -> Result<Vec<Option<Array2<f64>>>> {
        self.setup()
            .devices()
            .iter()
            .map(|device| {
                let rates = device.sampling_rates();
                Ok(device.data()?.map(|data| {
                    Array2::from_shape_fn((data.nrows(), rates.len()), |(i, c)| i as f64 / rates[c])
                }))
            })
            .collect()
    }

    /// Runs one synchronized acquisition round and returns only the samples
    pub fn state(&self) -> Result<Vec<Array2<f64>>> {
        let chunks = self.setup().receive_data()?;
        Ok(chunks.into_iter().map(|chunk| chunk.samples).collect())
    }

    /// Loads one file per device with each device's loader
    pub fn load_data(&self) -> Result<()> {
        let devices = self.setup().devices();
        let filenames = self.filenames();
        if filenames.len() > devices.len() {
            return Err(Error::InvalidConfig(format!(
                "{} files for {} devices",
                filenames.len(),
                devices.len()
            )));
        }

        let mut data: BufferList = vec![None; devices.len()];
        for (slot, (device, path)) in devices.iter().zip(&filenames).enumerate() {
            let loaded = device.read_data_file(path, &Map::new()).map_err(|err| {
                log::error!("Could not load `{}` via {}: {}", path.display(), device, err);
                err
            })?;
            data[slot] = Some(loaded);
        }
        self.inner.lock().data = Some(data);
        Ok(())
    }

    /// Appends rows to the slot of `device`
    pub fn append_device_data(&self, device: &Device, chunk: ArrayView2<f64>) -> Result<()> {
        self.setup().append_device_data(device, chunk)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        write!(
            f,
            "<Sample: Subject {} at {}>",
            state.subject.identity,
            state.timestamp.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Sample")
            .field("subject", &state.subject.identity)
            .field("timestamp", &state.timestamp)
            .field("setup", &state.setup)
            .finish()
    }
}
