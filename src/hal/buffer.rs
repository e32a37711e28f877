//! Buffer delegation along the `Sample -> Setup -> Device -> Channel` chain.
//!
//! Exactly one level holds the authoritative samples of a device. The
//! resolution order is: the device's local buffer, then the device's slot in
//! the setup's list, then the slot in the sample's list. A setup without a
//! sample that has never stored anything lazily creates its own list.

use ndarray::{concatenate, Array2, ArrayView2, Axis};

use super::device::Device;
use super::setup::Setup;
use crate::error::{Error, Result};
use crate::session::sample::Sample;

/// One slot per device, `None` until something is stored
pub type BufferList = Vec<Option<Array2<f64>>>;

/// The level that currently owns a device's samples
#[derive(Debug, Clone)]
pub enum BufferOwner {
    Device(Device),
    Setup { setup: Setup, slot: usize },
    Sample { sample: Sample, slot: usize },
}

/// Locates the owner of `device`'s buffer.
///
/// Fails with [`Error::DeviceNotFound`] when the device points at a setup
/// that does not list it.
pub fn resolve_buffer(device: &Device) -> Result<BufferOwner> {
    if device.has_local_data() {
        return Ok(BufferOwner::Device(device.clone()));
    }
    match device.setup() {
        Some(setup) => resolve_in_setup(&setup, device),
        None => Ok(BufferOwner::Device(device.clone())),
    }
}

/// Like [`resolve_buffer`] but against an explicit setup
pub(crate) fn resolve_in_setup(setup: &Setup, device: &Device) -> Result<BufferOwner> {
    let slot = setup.position(device).ok_or_else(|| Error::DeviceNotFound {
        device: device.name(),
        setup: setup.name(),
    })?;
    if device.has_local_data() {
        return Ok(BufferOwner::Device(device.clone()));
    }
    Ok(resolve_setup_slot(setup, slot))
}

pub(crate) fn resolve_setup_slot(setup: &Setup, slot: usize) -> BufferOwner {
    if !setup.hosts_buffers() {
        if let Some(sample) = setup.sample() {
            return BufferOwner::Sample { sample, slot };
        }
    }
    BufferOwner::Setup {
        setup: setup.clone(),
        slot,
    }
}

pub(crate) fn append_rows(existing: Option<Array2<f64>>, chunk: ArrayView2<f64>) -> Result<Array2<f64>> {
    match existing {
        None => Ok(chunk.to_owned()),
        Some(existing) => Ok(concatenate(Axis(0), &[existing.view(), chunk.view()])?),
    }
}

fn slot_mut(slots: &mut BufferList, slot: usize) -> &mut Option<Array2<f64>> {
    if slots.len() <= slot {
        slots.resize(slot + 1, None);
    }
    &mut slots[slot]
}

pub(crate) fn append_to_slot(slots: &mut BufferList, slot: usize, chunk: ArrayView2<f64>) -> Result<()> {
    let entry = slot_mut(slots, slot);
    let joined = append_rows(entry.clone(), chunk)?;
    *entry = Some(joined);
    Ok(())
}

pub(crate) fn store_slot(slots: &mut BufferList, slot: usize, data: Option<Array2<f64>>) {
    *slot_mut(slots, slot) = data;
}

/// Rebuilds a slot list after the device list changed, keeping the slots of
/// devices present in both lists
pub(crate) fn realign(slots: BufferList, previous: &[Device], current: &[Device]) -> BufferList {
    current
        .iter()
        .map(|device| {
            previous
                .iter()
                .position(|old| old.same_as(device))
                .and_then(|i| slots.get(i).cloned().flatten())
        })
        .collect()
}

impl BufferOwner {
    pub fn get(&self) -> Option<Array2<f64>> {
        match self {
            BufferOwner::Device(device) => device.local_data(),
            BufferOwner::Setup { setup, slot } => setup.with_slots(|slots| slots.get(*slot).cloned().flatten()),
            BufferOwner::Sample { sample, slot } => sample.with_slots(|slots| slots.get(*slot).cloned().flatten()),
        }
    }

    pub fn set(&self, data: Option<Array2<f64>>) -> Result<()> {
        match self {
            BufferOwner::Device(device) => device.set_local_data(data),
            BufferOwner::Setup { setup, slot } => setup.with_slots(|slots| store_slot(slots, *slot, data)),
            BufferOwner::Sample { sample, slot } => sample.with_slots(|slots| store_slot(slots, *slot, data)),
        }
        Ok(())
    }

    /// Initializes the buffer with `chunk` or concatenates it along the sample axis
    pub fn append(&self, chunk: ArrayView2<f64>) -> Result<()> {
        match self {
            BufferOwner::Device(device) => device.append_local_data(chunk),
            BufferOwner::Setup { setup, slot } => setup.with_slots(|slots| append_to_slot(slots, *slot, chunk)),
            BufferOwner::Sample { sample, slot } => sample.with_slots(|slots| append_to_slot(slots, *slot, chunk)),
        }
    }

    pub fn level(&self) -> &'static str {
        match self {
            BufferOwner::Device(_) => "device",
            BufferOwner::Setup { .. } => "setup",
            BufferOwner::Sample { .. } => "sample",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_append_to_slot_grows_list() {
        let mut slots: BufferList = Vec::new();
        append_to_slot(&mut slots, 2, array![[1.0]].view()).unwrap();
        append_to_slot(&mut slots, 2, array![[2.0]].view()).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[2], Some(array![[1.0], [2.0]]));
        assert!(slots[0].is_none());
    }

    #[test]
    fn test_failed_append_keeps_slot() {
        let mut slots: BufferList = vec![Some(array![[1.0, 2.0]])];
        assert!(append_to_slot(&mut slots, 0, array![[1.0]].view()).is_err());
        assert_eq!(slots[0], Some(array![[1.0, 2.0]]));
    }

    #[test]
    fn test_realign_keeps_surviving_slots() {
        let a = Device::new("a");
        let b = Device::new("b");
        let c = Device::new("c");
        let slots = vec![Some(array![[1.0]]), Some(array![[2.0]])];
        let realigned = realign(slots, &[a.clone(), b.clone()], &[b, c]);
        assert_eq!(realigned, vec![Some(array![[2.0]]), None]);
    }
}
