use ndarray::{Array2, ArrayView2};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

use super::buffer::{realign, resolve_in_setup, resolve_setup_slot, BufferList};
use super::device::{BindSnapshot, Device, SyncOptions};
use super::registry::DeviceRegistry;
use crate::config::SetupConfig;
use crate::error::{Error, Result};
use crate::pipeline::receiver::{Receiver, ReceiverConfig, ReceiverFromConfig, ReceiverWorker, DEFAULT_QUEUE_CAPACITY};
use crate::pipeline::types::Chunk;
use crate::session::sample::{Sample, SampleCell};

pub(crate) type SetupCell = Mutex<SetupState>;

pub(crate) struct SetupState {
    name: String,
    description: String,
    devices: Vec<Device>,
    buffers: Option<BufferList>,
    sample: Weak<SampleCell>,
    workers: Vec<(Device, ReceiverWorker)>,
    queue_capacity: usize,
}

/// An ordered group of devices recorded together.
///
/// The setup owns one buffer slot per device (unless it is embedded in a
/// [`Sample`], which then owns the list) and drives synchronized acquisition
/// through one background receiver per device.
#[derive(Clone)]
pub struct Setup {
    inner: Arc<SetupCell>,
}

fn check_unique(devices: &[Device]) -> Result<()> {
    for (i, device) in devices.iter().enumerate() {
        if devices[..i].iter().any(|other| other.same_as(device)) {
            return Err(Error::InvalidConfig(format!(
                "device `{}` is listed twice",
                device.name()
            )));
        }
    }
    Ok(())
}

impl Setup {
    pub fn new(name: impl Into<String>, devices: Vec<Device>) -> Result<Self> {
        let setup = Self {
            inner: Arc::new(Mutex::new(SetupState {
                name: name.into(),
                description: String::new(),
                devices: Vec::new(),
                buffers: None,
                sample: Weak::new(),
                workers: Vec::new(),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            })),
        };
        setup.set_devices(devices)?;
        Ok(setup)
    }

    pub fn load(config: &SetupConfig, registry: &DeviceRegistry) -> Result<Self> {
        let devices = config
            .devices
            .iter()
            .map(|spec| Device::load(spec, registry))
            .collect::<Result<Vec<_>>>()?;
        let setup = Self::new(config.name.clone(), devices)?;
        setup.set_description(config.description.clone());
        Ok(setup)
    }

    pub fn to_config(&self) -> SetupConfig {
        SetupConfig {
            name: self.name(),
            description: self.description(),
            devices: self.devices().iter().map(Device::to_spec).collect(),
        }
    }

    /// Builds a setup by probing live streams.
    ///
    /// For each stream identifier a receiver of type `R` is created from
    /// `template`, its metadata is read, and the best matching registered
    /// device class is chosen by the stream name. The receiver is then bound
    /// with every sync update enabled.
    pub fn from_streams<R, S>(
        name: impl Into<String>,
        streams: &[S],
        template: &ReceiverConfig,
        registry: &DeviceRegistry,
    ) -> Result<Self>
    where
        R: ReceiverFromConfig,
        S: AsRef<str>,
    {
        let mut devices = Vec::with_capacity(streams.len());
        for stream in streams {
            let mut config = template.clone();
            config.stream = stream.as_ref().to_string();
            let mut receiver = R::from_config(config);
            let info = receiver.stream_info()?;

            let device = match registry.best_match(info.name()) {
                Some(kind) => {
                    log::debug!("Stream `{}` matched device class `{}`", info.name(), kind.class_name());
                    Device::of_kind(kind)?
                }
                None => Device::new(info.name()),
            };
            device.set_receiver_with(Box::new(receiver), SyncOptions::all())?;
            devices.push(device);
        }
        Self::new(name, devices)
    }

    pub(crate) fn from_cell(inner: Arc<SetupCell>) -> Self {
        Self { inner }
    }

    pub fn same_as(&self, other: &Setup) -> bool {
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

    pub fn devices(&self) -> Vec<Device> {
        self.inner.lock().devices.clone()
    }

    pub fn n_devices(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn device_at(&self, index: usize) -> Option<Device> {
        self.inner.lock().devices.get(index).cloned()
    }

    pub fn device_by_name(&self, name: &str) -> Option<Device> {
        self.devices().into_iter().find(|device| device.name() == name)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices().iter().map(Device::name).collect()
    }

    pub fn position(&self, device: &Device) -> Option<usize> {
        self.inner
            .lock()
            .devices
            .iter()
            .position(|candidate| candidate.same_as(device))
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.position(device).is_some()
    }

    /// Replaces the device list.
    ///
    /// Slots of devices kept in the new list survive, dropped devices lose
    /// their back-reference. Any change to the list stops running receivers;
    /// the next acquisition round starts one worker per listed device again.
    pub fn set_devices(&self, devices: Vec<Device>) -> Result<()> {
        check_unique(&devices)?;
        let weak = Arc::downgrade(&self.inner);
        let (previous, sample, stale) = {
            let mut state = self.inner.lock();
            let previous = std::mem::replace(&mut state.devices, devices.clone());
            if let Some(slots) = state.buffers.take() {
                state.buffers = Some(realign(slots, &previous, &devices));
            }
            let unchanged =
                previous.len() == devices.len() && previous.iter().zip(&devices).all(|(old, new)| old.same_as(new));
            let stale = if unchanged {
                Vec::new()
            } else {
                std::mem::take(&mut state.workers)
            };
            (previous, state.sample.upgrade(), stale)
        };
        if !stale.is_empty() {
            log::info!(
                "Device list of setup `{}` changed, stopping {} receivers",
                self.name(),
                stale.len()
            );
            for (_, mut worker) in stale {
                worker.stop();
            }
        }
        if let Some(sample) = sample {
            let sample = Sample::from_cell(sample);
            sample.realign_slots(&previous, &devices);
        }
        for old in &previous {
            if !devices.iter().any(|device| device.same_as(old)) {
                old.detach_setup_from(&weak);
            }
        }
        for device in &devices {
            device.attach_setup(weak.clone());
        }
        Ok(())
    }

    pub fn push_device(&self, device: Device) -> Result<()> {
        if self.contains(&device) {
            return Err(Error::InvalidConfig(format!(
                "device `{}` is already part of setup `{}`",
                device.name(),
                self.name()
            )));
        }
        let mut devices = self.devices();
        devices.push(device);
        self.set_devices(devices)
    }

    /// Removes `device` from the setup and returns the contents of its slot.
    ///
    /// Afterwards the device falls back to its own, initially empty, buffer.
    pub fn detach_device(&self, device: &Device) -> Result<Option<Array2<f64>>> {
        let slot = self.position(device).ok_or_else(|| Error::DeviceNotFound {
            device: device.name(),
            setup: self.name(),
        })?;
        let former = self.slot_data(slot);
        let remaining: Vec<Device> = self
            .devices()
            .into_iter()
            .enumerate()
            .filter_map(|(i, d)| (i != slot).then_some(d))
            .collect();
        self.set_devices(remaining)?;
        Ok(former)
    }

    pub fn sample(&self) -> Option<Sample> {
        let weak = self.inner.lock().sample.clone();
        weak.upgrade().map(Sample::from_cell)
    }

    pub(crate) fn attach_sample(&self, sample: Weak<SampleCell>) {
        self.inner.lock().sample = sample;
    }

    /// Whether the setup currently keeps its own buffer list
    pub fn hosts_buffers(&self) -> bool {
        self.inner.lock().buffers.is_some()
    }

    pub(crate) fn take_buffers(&self) -> Option<BufferList> {
        self.inner.lock().buffers.take()
    }

    /// Runs `f` on the setup's own list, creating it with one empty slot per
    /// device if needed
    pub(crate) fn with_slots<T>(&self, f: impl FnOnce(&mut BufferList) -> T) -> T {
        let mut state = self.inner.lock();
        let n_devices = state.devices.len();
        let slots = state.buffers.get_or_insert_with(|| vec![None; n_devices]);
        f(slots)
    }

    /// Buffer list of the setup, one entry per device
    pub fn data(&self) -> BufferList {
        let n_devices = self.n_devices();
        if !self.hosts_buffers() {
            if let Some(sample) = self.sample() {
                let mut slots = sample.data();
                slots.resize(n_devices, None);
                return slots;
            }
        }
        let mut slots = self.inner.lock().buffers.clone().unwrap_or_default();
        slots.resize(n_devices, None);
        slots
    }

    pub fn set_data(&self, data: BufferList) -> Result<()> {
        let n_devices = self.n_devices();
        if data.len() != n_devices {
            return Err(Error::Shape(format!(
                "setup `{}` has {} devices, got {} buffers",
                self.name(),
                n_devices,
                data.len()
            )));
        }
        if !self.hosts_buffers() {
            if let Some(sample) = self.sample() {
                return sample.set_data(data);
            }
        }
        self.inner.lock().buffers = Some(data);
        Ok(())
    }

    pub fn get_device_data(&self, device: &Device) -> Result<Option<Array2<f64>>> {
        Ok(resolve_in_setup(self, device)?.get())
    }

    pub fn set_device_data(&self, device: &Device, data: Option<Array2<f64>>) -> Result<()> {
        resolve_in_setup(self, device)?.set(data)
    }

    /// Appends rows to `device`'s active buffer owner
    pub fn append_device_data(&self, device: &Device, chunk: ArrayView2<f64>) -> Result<()> {
        resolve_in_setup(self, device)?.append(chunk)
    }

    /// Slot `index` as seen from the setup, ignoring device-local buffers
    pub fn slot_data(&self, index: usize) -> Option<Array2<f64>> {
        if index >= self.n_devices() {
            return None;
        }
        resolve_setup_slot(self, index).get()
    }

    // -- acquisition ----------------------------------------------------------

    pub fn set_queue_capacity(&self, capacity: usize) {
        self.inner.lock().queue_capacity = capacity.max(1);
    }

    pub fn is_receiving(&self) -> bool {
        !self.inner.lock().workers.is_empty()
    }

    /// One synchronized acquisition round using the bound receivers
    pub fn receive_data(&self) -> Result<Vec<Chunk>> {
        self.receive_data_with(None, None)
    }

    /// One synchronized acquisition round.
    ///
    /// The first call binds `receivers` (one per device, in order) with
    /// `options` and starts one background worker per device. Every call
    /// then blocks until each worker delivered a chunk, in device order, and
    /// appends the samples to each device's active buffer. Later calls ignore
    /// `receivers`.
    ///
    /// If a worker fails, the chunks pulled before it are still appended
    /// and the error is returned.
    pub fn receive_data_with(
        &self,
        receivers: Option<Vec<Box<dyn Receiver>>>,
        options: Option<SyncOptions>,
    ) -> Result<Vec<Chunk>> {
        if !self.is_receiving() {
            self.start_receivers(receivers, options)?;
        } else if receivers.is_some() {
            log::debug!("Setup `{}` is already receiving, ignoring new receivers", self.name());
        }

        let workers = std::mem::take(&mut self.inner.lock().workers);
        let mut chunks = Vec::with_capacity(workers.len());
        let mut failure = None;
        for (_, worker) in &workers {
            match worker.pull_data() {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let targets: Vec<Device> = workers.iter().map(|(device, _)| device.clone()).collect();
        {
            let mut state = self.inner.lock();
            let mut restored = workers;
            restored.append(&mut state.workers);
            state.workers = restored;
        }

        for (device, chunk) in targets.iter().zip(&chunks) {
            self.append_device_data(device, chunk.samples.view())?;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(chunks),
        }
    }

    fn start_receivers(
        &self,
        receivers: Option<Vec<Box<dyn Receiver>>>,
        options: Option<SyncOptions>,
    ) -> Result<()> {
        let devices = self.devices();
        let mut bound = Vec::new();
        if let Some(receivers) = receivers {
            if receivers.len() != devices.len() {
                return Err(Error::InvalidConfig(format!(
                    "setup `{}` has {} devices, got {} receivers",
                    self.name(),
                    devices.len(),
                    receivers.len()
                )));
            }
            if let Some(taken) = devices.iter().find(|device| device.has_receiver()) {
                return Err(Error::ReceiverAlreadyBound(taken.name()));
            }
            for (device, receiver) in devices.iter().zip(receivers) {
                let options = options.unwrap_or_else(|| device.sync_options());
                // Snapshot first: a failing bind may already have renamed the device.
                bound.push((device.clone(), device.bind_snapshot()));
                if let Err(err) = device.set_receiver_with(receiver, options) {
                    unbind_all(bound);
                    return Err(err);
                }
            }
        }

        let capacity = self.inner.lock().queue_capacity;
        let mut workers = Vec::with_capacity(devices.len());
        for device in &devices {
            match device.spawn_receiver_worker(capacity) {
                Ok(worker) => workers.push((device.clone(), worker)),
                Err(err) => {
                    // Dropping the already started workers stops them.
                    drop(workers);
                    unbind_all(bound);
                    return Err(err);
                }
            }
        }
        log::info!("Setup `{}` started {} receivers", self.name(), workers.len());
        self.inner.lock().workers = workers;
        Ok(())
    }

    /// Stops all background receivers
    pub fn stop(&self) {
        let workers = std::mem::take(&mut self.inner.lock().workers);
        for (_, mut worker) in workers {
            worker.stop();
        }
    }
}

/// Undoes the receiver bindings made by a failed acquisition start
fn unbind_all(bound: Vec<(Device, BindSnapshot)>) {
    for (device, snapshot) in bound.into_iter().rev() {
        if let Err(err) = device.unbind(snapshot) {
            log::warn!("Could not restore device `{}`: {}", device.name(), err);
        }
    }
}

impl fmt::Display for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Setup: {}>", self.inner.lock().name)
    }
}

impl fmt::Debug for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Setup")
            .field("name", &state.name)
            .field("devices", &state.devices)
            .field("hosts_buffers", &state.buffers.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::channel::Channel;
    use ndarray::array;

    fn device(name: &str) -> Device {
        Device::with_channels(name, vec![Channel::new("CH1", 10.0).unwrap()]).unwrap()
    }

    #[test]
    fn test_device_data_lives_in_setup_slot() {
        let a = device("a");
        let b = device("b");
        let setup = Setup::new("s", vec![a.clone(), b.clone()]).unwrap();

        a.append_data(array![[1.0]].view()).unwrap();
        assert!(!a.has_local_data());
        assert!(setup.hosts_buffers());
        assert_eq!(setup.data(), vec![Some(array![[1.0]]), None]);
        assert_eq!(setup.get_device_data(&a).unwrap(), a.data().unwrap());
    }

    #[test]
    fn test_foreign_device_is_rejected() {
        let setup = Setup::new("s", vec![device("a")]).unwrap();
        let stranger = device("x");
        let result = setup.append_device_data(&stranger, array![[1.0]].view());
        assert!(matches!(result, Err(Error::DeviceNotFound { .. })));
    }

    #[test]
    fn test_set_data_checks_length() {
        let setup = Setup::new("s", vec![device("a")]).unwrap();
        assert!(matches!(setup.set_data(vec![None, None]), Err(Error::Shape(_))));
    }

    #[test]
    fn test_receive_without_receivers_fails() {
        let setup = Setup::new("s", vec![device("a")]).unwrap();
        assert!(matches!(setup.receive_data(), Err(Error::MissingReceiver(_))));
        assert!(!setup.is_receiving());
    }
}
