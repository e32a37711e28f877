use ndarray::Array1;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

use super::channel_kind::ChannelKind;
use super::device::{Device, DeviceCell};
use crate::config::ChannelSpec;
use crate::error::{Error, Result};

/// One physical or logical signal of a device.
///
/// `Channel` is a cheap handle: clones refer to the same channel and
/// [`Channel::same_as`] compares identity. While attached to a device the
/// channel owns no samples of its own; [`Channel::data`] reads the matching
/// column of the device buffer. Only a detached channel keeps a local array.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Mutex<ChannelState>>,
}

struct ChannelState {
    name: String,
    label: Option<String>,
    sampling_rate: f64,
    unit: String,
    description: String,
    kind: ChannelKind,
    device: Weak<DeviceCell>,
    data: Option<Array1<f64>>,
}

fn check_sampling_rate(sampling_rate: f64) -> Result<f64> {
    if sampling_rate.is_finite() && sampling_rate > 0.0 {
        Ok(sampling_rate)
    } else {
        Err(Error::InvalidSamplingRate(sampling_rate))
    }
}

impl Channel {
    pub fn new(name: impl Into<String>, sampling_rate: f64) -> Result<Self> {
        Self::of_kind(ChannelKind::Custom, name, sampling_rate)
    }

    /// Creates a channel of `kind` carrying the kind's default unit
    pub fn of_kind(kind: ChannelKind, name: impl Into<String>, sampling_rate: f64) -> Result<Self> {
        let state = ChannelState {
            name: name.into(),
            label: None,
            sampling_rate: check_sampling_rate(sampling_rate)?,
            unit: kind.default_unit().to_string(),
            description: String::new(),
            kind,
            device: Weak::new(),
            data: None,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
        })
    }

    /// Builds a channel from its serialized description
    pub fn load(spec: &ChannelSpec) -> Result<Self> {
        let kind = spec
            .kind
            .or_else(|| ChannelKind::from_tag(&spec.name))
            .unwrap_or_default();
        let channel = Self::of_kind(kind, spec.name.clone(), spec.sampling_rate)?;
        {
            let mut state = channel.inner.lock();
            state.label = spec.label.clone();
            if let Some(unit) = &spec.unit {
                state.unit = unit.clone();
            }
            state.description = spec.description.clone();
        }
        Ok(channel)
    }

    pub fn to_spec(&self) -> ChannelSpec {
        let state = self.inner.lock();
        ChannelSpec {
            name: state.name.clone(),
            sampling_rate: state.sampling_rate,
            label: state.label.clone(),
            unit: Some(state.unit.clone()),
            description: state.description.clone(),
            kind: Some(state.kind),
        }
    }

    /// Copies the attributes into a new, independent channel.
    ///
    /// The copy points at the same device but is not listed by it, and holds
    /// no samples.
    pub fn duplicate(&self) -> Self {
        let state = self.inner.lock();
        Self {
            inner: Arc::new(Mutex::new(ChannelState {
                name: state.name.clone(),
                label: state.label.clone(),
                sampling_rate: state.sampling_rate,
                unit: state.unit.clone(),
                description: state.description.clone(),
                kind: state.kind,
                device: state.device.clone(),
                data: None,
            })),
        }
    }

    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.set_label(Some(label.into()));
        self
    }

    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.set_unit(unit);
        self
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.set_description(description);
        self
    }

    pub fn same_as(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.lock().name = name.into();
    }

    /// Display label, defaulting to the name
    pub fn label(&self) -> String {
        let state = self.inner.lock();
        state.label.clone().unwrap_or_else(|| state.name.clone())
    }

    pub fn set_label(&self, label: Option<String>) {
        self.inner.lock().label = label;
    }

    pub fn sampling_rate(&self) -> f64 {
        self.inner.lock().sampling_rate
    }

    pub fn set_sampling_rate(&self, sampling_rate: f64) -> Result<()> {
        let sampling_rate = check_sampling_rate(sampling_rate)?;
        self.inner.lock().sampling_rate = sampling_rate;
        Ok(())
    }

    pub fn unit(&self) -> String {
        self.inner.lock().unit.clone()
    }

    pub fn set_unit(&self, unit: impl Into<String>) {
        self.inner.lock().unit = unit.into();
    }

    pub fn description(&self) -> String {
        self.inner.lock().description.clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.lock().description = description.into();
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.lock().kind
    }

    pub fn set_kind(&self, kind: ChannelKind) {
        self.inner.lock().kind = kind;
    }

    /// Owning device, if the channel is attached to one that is still alive
    pub fn device(&self) -> Option<Device> {
        let weak = self.inner.lock().device.clone();
        weak.upgrade().map(Device::from_cell)
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().device.strong_count() > 0
    }

    pub(crate) fn attach(&self, device: Weak<DeviceCell>) {
        let mut state = self.inner.lock();
        state.device = device;
        state.data = None;
    }

    /// Clears the back-reference if it still points at `device`
    pub(crate) fn detach_from(&self, device: &Weak<DeviceCell>) {
        let mut state = self.inner.lock();
        if state.device.ptr_eq(device) {
            state.device = Weak::new();
        }
    }

    /// Samples of this channel.
    ///
    /// Attached channels read their column of the device buffer, which itself
    /// may live in a setup or sample. Detached channels return their local
    /// array.
    pub fn data(&self) -> Result<Option<Array1<f64>>> {
        let (weak, local) = {
            let state = self.inner.lock();
            (state.device.clone(), state.data.clone())
        };
        match weak.upgrade() {
            Some(cell) => Device::from_cell(cell).channel_data(self),
            None => Ok(local),
        }
    }

    pub fn set_data(&self, values: Array1<f64>) -> Result<()> {
        let weak = self.inner.lock().device.clone();
        match weak.upgrade() {
            Some(cell) => Device::from_cell(cell).set_channel_data(self, values),
            None => {
                self.inner.lock().data = Some(values);
                Ok(())
            }
        }
    }

    /// Time axis in seconds derived from the number of samples and the rate
    pub fn time(&self) -> Result<Option<Array1<f64>>> {
        let sampling_rate = self.sampling_rate();
        Ok(self
            .data()?
            .map(|data| Array1::from_iter((0..data.len()).map(|i| i as f64 / sampling_rate))))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        match state.kind {
            ChannelKind::Custom => write!(f, "<Channel: {}>", state.name),
            kind => write!(f, "<{}-Channel: {}>", kind, state.name),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Channel")
            .field("name", &state.name)
            .field("kind", &state.kind)
            .field("sampling_rate", &state.sampling_rate)
            .field("unit", &state.unit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_rejects_non_positive_sampling_rate() {
        assert!(matches!(Channel::new("EEG", 0.0), Err(Error::InvalidSamplingRate(_))));
        assert!(matches!(Channel::new("EEG", -250.0), Err(Error::InvalidSamplingRate(_))));
        assert!(matches!(Channel::new("EEG", f64::NAN), Err(Error::InvalidSamplingRate(_))));

        let channel = Channel::new("EEG", 250.0).unwrap();
        assert!(channel.set_sampling_rate(0.0).is_err());
        assert_eq!(channel.sampling_rate(), 250.0);
    }

    #[test]
    fn test_label_defaults_to_name() {
        let channel = Channel::new("CH1", 100.0).unwrap();
        assert_eq!(channel.label(), "CH1");
        channel.set_label(Some("Fz".into()));
        assert_eq!(channel.label(), "Fz");
    }

    #[test]
    fn test_detached_channel_owns_data() {
        let channel = Channel::new("CH1", 2.0).unwrap();
        assert!(channel.data().unwrap().is_none());

        channel.set_data(array![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(channel.data().unwrap(), Some(array![1.0, 2.0, 3.0]));
        assert_eq!(channel.time().unwrap(), Some(array![0.0, 0.5, 1.0]));
    }

    #[test]
    fn test_duplicate_is_independent() {
        let channel = Channel::of_kind(ChannelKind::Eeg, "EEG 1", 250.0).unwrap();
        let copy = channel.duplicate();
        assert!(!copy.same_as(&channel));
        copy.set_name("EEG 2");
        assert_eq!(channel.name(), "EEG 1");
        assert_eq!(copy.unit(), "muV");
        assert_eq!(copy.to_string(), "<EEG-Channel: EEG 2>");
    }

    #[test]
    fn test_load_infers_kind_from_name() {
        let spec: ChannelSpec =
            serde_json::from_value(serde_json::json!({"name": "ECG", "sampling_rate": 500.0})).unwrap();
        let channel = Channel::load(&spec).unwrap();
        assert_eq!(channel.kind(), ChannelKind::Ecg);
        assert_eq!(channel.unit(), "mV");
    }
}
