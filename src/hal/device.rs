use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};

use super::buffer::resolve_buffer;
use super::channel::Channel;
use super::channel_kind::{sensor_to_channel_type, ChannelKind};
use super::devices::generic::GenericDevice;
use super::registry::{DeviceKind, DeviceRegistry};
use super::setup::{Setup, SetupCell};
use crate::config::DeviceSpec;
use crate::error::{Error, Result};
use crate::pipeline::receiver::{Receiver, ReceiverWorker};
use crate::pipeline::transmitter::{BackgroundTransmitter, TransmitterConfig};
use crate::pipeline::types::StreamInfo;

pub(crate) type DeviceCell = Mutex<DeviceState>;

/// Which device attributes are overwritten from live stream metadata when a
/// receiver is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub update_device: bool,
    pub update_channels: bool,
    pub update_sampling_rate: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            update_device: false,
            update_channels: true,
            update_sampling_rate: true,
        }
    }
}

impl SyncOptions {
    pub fn all() -> Self {
        Self {
            update_device: true,
            update_channels: true,
            update_sampling_rate: true,
        }
    }

    pub fn none() -> Self {
        Self {
            update_device: false,
            update_channels: false,
            update_sampling_rate: false,
        }
    }
}

pub(crate) struct BindSnapshot {
    name: String,
    channels: Vec<Channel>,
    rates: Vec<f64>,
}

pub(crate) struct DeviceState {
    name: String,
    description: String,
    kind: Arc<dyn DeviceKind>,
    channels: Vec<Channel>,
    data: Option<Array2<f64>>,
    setup: Weak<SetupCell>,
    receiver: Option<Box<dyn Receiver>>,
    transmitter: Option<BackgroundTransmitter>,
    sync: SyncOptions,
    load_data_kwargs: Map<String, Value>,
}

/// A recording device: an ordered list of channels plus a sample buffer.
///
/// The buffer is shaped `[n_samples, n_channels]`. A device that holds no
/// local buffer and belongs to a setup reads and writes its slot in the
/// setup's buffer list instead (see [`resolve_buffer`]).
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceCell>,
}

fn check_unique(channels: &[Channel]) -> Result<()> {
    for (i, channel) in channels.iter().enumerate() {
        if channels[..i].iter().any(|other| other.same_as(channel)) {
            return Err(Error::InvalidConfig(format!(
                "channel `{}` is listed twice",
                channel.name()
            )));
        }
    }
    Ok(())
}

impl Device {
    /// Generic device without channels
    pub fn new(name: impl Into<String>) -> Self {
        let kind: Arc<dyn DeviceKind> = Arc::new(GenericDevice);
        Self::bare(name.into(), kind)
    }

    pub fn with_channels(name: impl Into<String>, channels: Vec<Channel>) -> Result<Self> {
        let device = Self::new(name);
        device.set_channels(channels)?;
        Ok(device)
    }

    /// Device of a registered kind carrying the kind's default name and channels
    pub fn of_kind(kind: Arc<dyn DeviceKind>) -> Result<Self> {
        let channels = kind.default_channels()?;
        let device = Self::bare(kind.default_name().to_string(), kind);
        device.set_channels(channels)?;
        Ok(device)
    }

    /// Builds a device from its serialized description.
    ///
    /// The class is looked up in `registry`; without a channel list the kind's
    /// default channels are used.
    pub fn load(spec: &DeviceSpec, registry: &DeviceRegistry) -> Result<Self> {
        let kind = match &spec.class {
            Some(class) => registry.resolve(class, spec.location.as_deref())?,
            None => Arc::new(GenericDevice),
        };
        let channels = match &spec.channels {
            Some(specs) => specs.iter().map(Channel::load).collect::<Result<Vec<_>>>()?,
            None => kind.default_channels()?,
        };
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| kind.default_name().to_string());
        let sync = spec.sync_options(kind.default_sync());

        let device = Self::bare(name, kind);
        device.set_channels(channels)?;
        {
            let mut state = device.inner.lock();
            state.description = spec.description.clone();
            state.load_data_kwargs = spec.load_data_kwargs.clone();
            state.sync = sync;
        }
        Ok(device)
    }

    fn bare(name: String, kind: Arc<dyn DeviceKind>) -> Self {
        let sync = kind.default_sync();
        Self {
            inner: Arc::new(Mutex::new(DeviceState {
                name,
                description: String::new(),
                kind,
                channels: Vec::new(),
                data: None,
                setup: Weak::new(),
                receiver: None,
                transmitter: None,
                sync,
                load_data_kwargs: Map::new(),
            })),
        }
    }

    pub(crate) fn from_cell(inner: Arc<DeviceCell>) -> Self {
        Self { inner }
    }

    pub fn to_spec(&self) -> DeviceSpec {
        let state = self.inner.lock();
        DeviceSpec {
            class: Some(state.kind.class_name().to_string()),
            location: None,
            name: Some(state.name.clone()),
            channels: Some(state.channels.iter().map(Channel::to_spec).collect()),
            description: state.description.clone(),
            load_data_kwargs: state.load_data_kwargs.clone(),
            update_device: Some(state.sync.update_device),
            update_channels: Some(state.sync.update_channels),
            update_sampling_rate: Some(state.sync.update_sampling_rate),
        }
    }

    pub fn same_as(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.lock().name = name.into();
    }

    pub fn description(&self) -> String {
        self.inner.lock().description.clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.lock().description = description.into();
    }

    pub fn kind(&self) -> Arc<dyn DeviceKind> {
        self.inner.lock().kind.clone()
    }

    pub fn class_name(&self) -> &'static str {
        self.inner.lock().kind.class_name()
    }

    pub fn sync_options(&self) -> SyncOptions {
        self.inner.lock().sync
    }

    pub fn set_sync_options(&self, sync: SyncOptions) {
        self.inner.lock().sync = sync;
    }

    pub fn load_data_kwargs(&self) -> Map<String, Value> {
        self.inner.lock().load_data_kwargs.clone()
    }

    pub fn set_load_data_kwargs(&self, kwargs: Map<String, Value>) {
        self.inner.lock().load_data_kwargs = kwargs;
    }

    /// Channels in order. Reading re-stamps each channel's back-reference.
    pub fn channels(&self) -> Vec<Channel> {
        let channels = self.inner.lock().channels.clone();
        let weak = Arc::downgrade(&self.inner);
        for channel in &channels {
            channel.attach(weak.clone());
        }
        channels
    }

    /// Replaces the channel list in one step.
    ///
    /// Every new channel points back at this device; channels that were
    /// dropped from the list and still point here become detached.
    pub fn set_channels(&self, channels: Vec<Channel>) -> Result<()> {
        check_unique(&channels)?;
        let weak = Arc::downgrade(&self.inner);
        let previous = std::mem::replace(&mut self.inner.lock().channels, channels.clone());
        for old in previous {
            if !channels.iter().any(|channel| channel.same_as(&old)) {
                old.detach_from(&weak);
            }
        }
        for channel in &channels {
            channel.attach(weak.clone());
        }
        Ok(())
    }

    pub fn n_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn channel_index(&self, channel: &Channel) -> Option<usize> {
        self.inner
            .lock()
            .channels
            .iter()
            .position(|candidate| candidate.same_as(channel))
    }

    pub fn channel_at(&self, index: usize) -> Option<Channel> {
        self.inner.lock().channels.get(index).cloned()
    }

    pub fn channel_by_name(&self, name: &str) -> Option<Channel> {
        self.inner
            .lock()
            .channels
            .iter()
            .find(|channel| channel.name() == name)
            .cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.lock().channels.iter().map(Channel::name).collect()
    }

    pub fn sampling_rates(&self) -> Vec<f64> {
        self.inner
            .lock()
            .channels
            .iter()
            .map(Channel::sampling_rate)
            .collect()
    }

    /// Nominal rate of the device, taken from its first channel
    pub fn sampling_rate(&self) -> Option<f64> {
        self.inner.lock().channels.first().map(Channel::sampling_rate)
    }

    pub fn setup(&self) -> Option<Setup> {
        let weak = self.inner.lock().setup.clone();
        weak.upgrade().map(Setup::from_cell)
    }

    pub(crate) fn attach_setup(&self, setup: Weak<SetupCell>) {
        self.inner.lock().setup = setup;
    }

    pub(crate) fn detach_setup_from(&self, setup: &Weak<SetupCell>) {
        let mut state = self.inner.lock();
        if state.setup.ptr_eq(setup) {
            state.setup = Weak::new();
        }
    }

    pub fn sensor_to_channel_type(&self, label: Option<&str>) -> ChannelKind {
        sensor_to_channel_type(self.kind().sensor_table(), label)
    }

    // -- buffer ---------------------------------------------------------------

    pub fn has_local_data(&self) -> bool {
        self.inner.lock().data.is_some()
    }

    pub(crate) fn local_data(&self) -> Option<Array2<f64>> {
        self.inner.lock().data.clone()
    }

    pub(crate) fn set_local_data(&self, data: Option<Array2<f64>>) {
        self.inner.lock().data = data;
    }

    pub(crate) fn append_local_data(&self, chunk: ArrayView2<f64>) -> Result<()> {
        let mut state = self.inner.lock();
        state.data = Some(match state.data.take() {
            None => chunk.to_owned(),
            Some(existing) => {
                let joined = concatenate(Axis(0), &[existing.view(), chunk.view()]);
                match joined {
                    Ok(joined) => joined,
                    Err(err) => {
                        state.data = Some(existing);
                        return Err(err.into());
                    }
                }
            }
        });
        Ok(())
    }

    /// Samples of the device, wherever they currently live
    pub fn data(&self) -> Result<Option<Array2<f64>>> {
        Ok(resolve_buffer(self)?.get())
    }

    pub fn set_data(&self, data: Option<Array2<f64>>) -> Result<()> {
        resolve_buffer(self)?.set(data)
    }

    pub fn load_data(&self, data: Array2<f64>) -> Result<()> {
        self.set_data(Some(data))
    }

    /// Appends `[n_samples, n_channels]` rows to the active buffer
    pub fn append_data(&self, chunk: ArrayView2<f64>) -> Result<()> {
        resolve_buffer(self)?.append(chunk)
    }

    /// Takes the local buffer, handing storage back to the enclosing setup
    pub fn take_local_data(&self) -> Option<Array2<f64>> {
        self.inner.lock().data.take()
    }

    fn channel_position(&self, channel: &Channel) -> Result<usize> {
        self.channel_index(channel)
            .ok_or_else(|| Error::ChannelNotFound {
                channel: channel.name(),
                device: self.name(),
            })
    }

    pub(crate) fn channel_data(&self, channel: &Channel) -> Result<Option<Array1<f64>>> {
        let index = self.channel_position(channel)?;
        match self.data()? {
            None => Ok(None),
            Some(data) if index < data.ncols() => Ok(Some(data.column(index).to_owned())),
            Some(data) => Err(Error::Shape(format!(
                "buffer of `{}` has {} columns, channel index is {}",
                self.name(),
                data.ncols(),
                index
            ))),
        }
    }

    pub(crate) fn set_channel_data(&self, channel: &Channel, values: Array1<f64>) -> Result<()> {
        let index = self.channel_position(channel)?;
        let owner = resolve_buffer(self)?;
        let mut data = owner
            .get()
            .ok_or_else(|| Error::Shape(format!("device `{}` holds no data", self.name())))?;
        if index >= data.ncols() || values.len() != data.nrows() {
            return Err(Error::Shape(format!(
                "cannot write {} values into column {} of a {:?} buffer",
                values.len(),
                index,
                data.dim()
            )));
        }
        data.column_mut(index).assign(&values);
        owner.set(Some(data))
    }

    // -- file loading ---------------------------------------------------------

    /// Reads a recording with the kind's loader, without storing it.
    ///
    /// `kwargs` override the device's configured `load_data_kwargs`.
    pub fn read_data_file(&self, path: &Path, kwargs: &Map<String, Value>) -> Result<Array2<f64>> {
        let (kind, mut merged) = {
            let state = self.inner.lock();
            (state.kind.clone(), state.load_data_kwargs.clone())
        };
        merged.extend(kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
        kind.loader().load(path, &merged)
    }

    pub fn load_data_from(&self, path: &Path, kwargs: &Map<String, Value>) -> Result<()> {
        let data = self.read_data_file(path, kwargs)?;
        self.load_data(data)
    }

    // -- receiver -------------------------------------------------------------

    pub fn has_receiver(&self) -> bool {
        self.inner.lock().receiver.is_some()
    }

    /// Binds a receiver using the device's own sync options
    pub fn set_receiver(&self, receiver: Box<dyn Receiver>) -> Result<()> {
        let options = self.sync_options();
        self.set_receiver_with(receiver, options)
    }

    /// Binds a receiver and synchronizes the device with the live stream.
    ///
    /// Connects in the foreground to obtain the stream description, then
    /// applies the updates enabled in `options`. A device keeps at most one
    /// receiver; detach the current one first to rebind.
    pub fn set_receiver_with(&self, mut receiver: Box<dyn Receiver>, options: SyncOptions) -> Result<()> {
        if self.has_receiver() {
            return Err(Error::ReceiverAlreadyBound(self.name()));
        }
        let info = receiver.stream_info()?;
        self.apply_stream_info(&info, options)?;

        let mut state = self.inner.lock();
        if state.receiver.is_some() {
            return Err(Error::ReceiverAlreadyBound(state.name.clone()));
        }
        state.receiver = Some(receiver);
        Ok(())
    }

    /// Captures what binding a receiver may rewrite
    pub(crate) fn bind_snapshot(&self) -> BindSnapshot {
        let state = self.inner.lock();
        BindSnapshot {
            name: state.name.clone(),
            rates: state.channels.iter().map(Channel::sampling_rate).collect(),
            channels: state.channels.clone(),
        }
    }

    /// Detaches the receiver and puts back the captured name and channels
    pub(crate) fn unbind(&self, snapshot: BindSnapshot) -> Result<()> {
        self.detach_receiver();
        self.set_name(snapshot.name);
        for (channel, rate) in snapshot.channels.iter().zip(snapshot.rates) {
            channel.set_sampling_rate(rate)?;
        }
        self.set_channels(snapshot.channels)
    }

    pub fn detach_receiver(&self) -> Option<Box<dyn Receiver>> {
        self.inner.lock().receiver.take()
    }

    /// Runs `f` on the bound receiver while holding the device lock
    pub fn with_receiver<T>(&self, f: impl FnOnce(&mut dyn Receiver) -> T) -> Option<T> {
        let mut state = self.inner.lock();
        state.receiver.as_mut().map(|receiver| f(receiver.as_mut()))
    }

    pub(crate) fn spawn_receiver_worker(&self, capacity: usize) -> Result<ReceiverWorker> {
        let fresh = {
            let state = self.inner.lock();
            match &state.receiver {
                Some(receiver) => receiver.replicate(),
                None => return Err(Error::MissingReceiver(state.name.clone())),
            }
        };
        ReceiverWorker::spawn(fresh, capacity)
    }

    /// Applies live stream metadata to the device.
    ///
    /// With `update_channels` the channel list is rebuilt from the stream's
    /// channel entries: each label is mapped through the kind's sensor table
    /// and a matching default channel is cloned as prototype when one exists.
    pub fn apply_stream_info(&self, info: &StreamInfo, options: SyncOptions) -> Result<()> {
        let rate = info.nominal_srate();
        let rebuilt = if options.update_channels {
            Some(self.channels_from_stream(info)?)
        } else {
            None
        };

        if options.update_device {
            self.set_name(info.name());
        }
        if let Some(channels) = rebuilt {
            self.set_channels(channels)?;
        }
        if options.update_sampling_rate {
            if rate > 0.0 {
                for channel in self.channels() {
                    channel.set_sampling_rate(rate)?;
                }
            } else {
                log::warn!(
                    "Stream `{}` has an irregular rate, keeping sampling rates of `{}`",
                    info.name(),
                    self.name()
                );
            }
        }
        Ok(())
    }

    fn channels_from_stream(&self, info: &StreamInfo) -> Result<Vec<Channel>> {
        if info.channels.is_empty() {
            return Err(Error::EmptyChannelMetadata(info.name().to_string()));
        }
        let kind = self.kind();
        let table = kind.sensor_table();
        let prototypes = kind.default_channels()?;
        let rate = info.nominal_srate();

        let mut channels = Vec::with_capacity(info.channels.len());
        for (i, meta) in info.channels.iter().enumerate() {
            let label = if meta.label.is_empty() {
                format!("CH{}", i)
            } else {
                meta.label.clone()
            };
            let mut channel_kind = sensor_to_channel_type(table, Some(&label));
            if channel_kind == ChannelKind::Custom {
                channel_kind = sensor_to_channel_type(table, Some(&meta.kind));
            }

            let prototype = prototypes
                .iter()
                .find(|prototype| prototype.name() == label)
                .or_else(|| {
                    prototypes
                        .iter()
                        .find(|prototype| channel_kind != ChannelKind::Custom && prototype.kind() == channel_kind)
                });

            let channel = match prototype {
                Some(prototype) => {
                    let channel = prototype.duplicate();
                    channel.set_name(label);
                    channel.set_label(None);
                    if rate > 0.0 {
                        channel.set_sampling_rate(rate)?;
                    }
                    channel
                }
                None => Channel::of_kind(channel_kind, label, rate)?,
            };
            if !meta.unit.is_empty() {
                channel.set_unit(meta.unit.clone());
            }
            channels.push(channel);
        }
        Ok(channels)
    }

    // -- transmitter ----------------------------------------------------------

    /// Immutable snapshot of this device for a transmitter
    pub fn transmitter_config(&self, stream: Option<&str>) -> TransmitterConfig {
        TransmitterConfig::from_device(self, stream)
    }

    pub fn has_transmitter(&self) -> bool {
        self.inner.lock().transmitter.is_some()
    }

    pub fn set_transmitter(&self, transmitter: BackgroundTransmitter) -> Result<()> {
        let mut state = self.inner.lock();
        if state.transmitter.is_some() {
            return Err(Error::TransmitterAlreadyBound(state.name.clone()));
        }
        state.transmitter = Some(transmitter);
        Ok(())
    }

    pub fn detach_transmitter(&self) -> Option<BackgroundTransmitter> {
        self.inner.lock().transmitter.take()
    }

    /// Runs `f` on the bound transmitter while holding the device lock
    pub fn with_transmitter<T>(&self, f: impl FnOnce(&mut BackgroundTransmitter) -> T) -> Option<T> {
        let mut state = self.inner.lock();
        state.transmitter.as_mut().map(f)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        write!(f, "<{}: {}>", state.kind.class_name(), state.name)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Device")
            .field("class", &state.kind.class_name())
            .field("name", &state.name)
            .field("channels", &state.channels)
            .field("has_receiver", &state.receiver.is_some())
            .finish()
    }
}
