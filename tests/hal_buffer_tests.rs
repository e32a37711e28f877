use biosync::hal::{resolve_buffer, BufferOwner, Channel, Device, Setup};
use biosync::session::{Sample, Subject};
use biosync::Error;
use ndarray::{array, s, Array2};

fn device(name: &str, n_channels: usize) -> Device {
    let channels = (0..n_channels)
        .map(|i| Channel::new(format!("CH{}", i), 100.0).unwrap())
        .collect();
    Device::with_channels(name, channels).unwrap()
}

fn session(devices: Vec<Device>) -> (Setup, Sample) {
    let setup = Setup::new("lab", devices).unwrap();
    let sample = Sample::new(setup.clone(), Subject::new("S01"));
    (setup, sample)
}

#[test]
fn test_standalone_device_owns_its_buffer() {
    let amp = device("amp", 2);
    assert!(matches!(resolve_buffer(&amp).unwrap(), BufferOwner::Device(_)));
    assert_eq!(amp.data().unwrap(), None);

    amp.append_data(array![[1.0, 2.0]].view()).unwrap();
    assert!(amp.has_local_data());
    assert_eq!(amp.data().unwrap(), Some(array![[1.0, 2.0]]));
}

#[test]
fn test_sample_slot_and_device_are_one_buffer() {
    let a = device("a", 2);
    let b = device("b", 1);
    let (setup, sample) = session(vec![a.clone(), b.clone()]);

    assert!(matches!(resolve_buffer(&a).unwrap(), BufferOwner::Sample { slot: 0, .. }));
    assert!(matches!(resolve_buffer(&b).unwrap(), BufferOwner::Sample { slot: 1, .. }));

    // Writing the sample slot is visible through the device
    sample
        .set_data(vec![Some(array![[1.0, 2.0], [3.0, 4.0]]), None])
        .unwrap();
    assert_eq!(a.data().unwrap(), Some(array![[1.0, 2.0], [3.0, 4.0]]));
    assert_eq!(setup.get_device_data(&a).unwrap(), a.data().unwrap());

    // And writing the device is visible through the sample
    b.set_data(Some(array![[9.0]])).unwrap();
    assert_eq!(sample.data()[1], Some(array![[9.0]]));
    assert_eq!(setup.data(), sample.data());
    assert!(!a.has_local_data());
    assert!(!b.has_local_data());
}

#[test]
fn test_channel_view_follows_device_slot() {
    let a = device("a", 2);
    let (_setup, sample) = session(vec![a.clone()]);
    sample.set_data(vec![Some(array![[1.0, 10.0], [2.0, 20.0]])]).unwrap();

    let second = a.channel_at(1).unwrap();
    assert_eq!(second.data().unwrap(), Some(array![10.0, 20.0]));

    second.set_data(array![11.0, 21.0]).unwrap();
    assert_eq!(sample.data()[0], Some(array![[1.0, 11.0], [2.0, 21.0]]));
}

#[test]
fn test_setup_buffers_move_into_sample() {
    let a = device("a", 1);
    let setup = Setup::new("lab", vec![a.clone()]).unwrap();
    a.append_data(array![[5.0]].view()).unwrap();
    assert!(setup.hosts_buffers());

    let sample = Sample::new(setup.clone(), Subject::new("7"));
    assert!(!setup.hosts_buffers());
    assert_eq!(sample.data(), vec![Some(array![[5.0]])]);
    assert!(setup.sample().unwrap().same_as(&sample));
}

#[test]
fn test_detached_device_falls_back_to_empty_local_buffer() {
    let a = device("a", 1);
    let b = device("b", 1);
    let (setup, sample) = session(vec![a.clone(), b.clone()]);
    sample
        .set_data(vec![Some(array![[1.0], [2.0]]), Some(array![[3.0]])])
        .unwrap();

    let former = setup.detach_device(&a).unwrap();
    assert_eq!(former, Some(array![[1.0], [2.0]]));
    assert!(a.setup().is_none());
    assert_eq!(a.data().unwrap(), None);

    a.append_data(array![[42.0]].view()).unwrap();
    assert_eq!(a.data().unwrap(), Some(array![[42.0]]));
    assert_eq!(sample.data(), vec![Some(array![[3.0]])]);
    assert_eq!(b.data().unwrap(), Some(array![[3.0]]));
}

#[test]
fn test_detaching_a_stranger_fails() {
    let (setup, _sample) = session(vec![device("a", 1)]);
    let stranger = device("x", 1);
    assert!(matches!(
        setup.detach_device(&stranger),
        Err(Error::DeviceNotFound { .. })
    ));
}

#[test]
fn test_append_keeps_prefix_for_every_owner() {
    let first: Array2<f64> = array![[0.25, -1.0], [3.5, 1e-9]];
    let second: Array2<f64> = array![[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]];

    let local = device("local", 2);
    let delegated = device("delegated", 2);
    let in_setup = device("in_setup", 2);
    let (_setup, _sample) = session(vec![delegated.clone()]);
    let _bare = Setup::new("bare", vec![in_setup.clone()]).unwrap();

    for device in [&local, &delegated, &in_setup] {
        device.append_data(first.view()).unwrap();
        device.append_data(second.view()).unwrap();

        let data = device.data().unwrap().unwrap();
        assert_eq!(data.nrows(), first.nrows() + second.nrows(), "{}", device.name());
        assert_eq!(data.slice(s![..first.nrows(), ..]), first);
        assert_eq!(data.slice(s![first.nrows().., ..]), second);
    }
}

#[test]
fn test_append_rejects_mismatched_width() {
    let a = device("a", 2);
    a.append_data(array![[1.0, 2.0]].view()).unwrap();
    let result = a.append_data(array![[1.0, 2.0, 3.0]].view());
    assert!(matches!(result, Err(Error::Shape(_))));
    assert_eq!(a.data().unwrap().unwrap().nrows(), 1);
}

#[test]
fn test_reordering_devices_keeps_slots() {
    let a = device("a", 1);
    let b = device("b", 1);
    let (setup, sample) = session(vec![a.clone(), b.clone()]);
    a.append_data(array![[1.0]].view()).unwrap();
    b.append_data(array![[2.0]].view()).unwrap();

    setup.set_devices(vec![b.clone(), a.clone()]).unwrap();
    assert_eq!(sample.data(), vec![Some(array![[2.0]]), Some(array![[1.0]])]);
    assert_eq!(a.data().unwrap(), Some(array![[1.0]]));
}
