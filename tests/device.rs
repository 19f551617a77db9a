//! End-to-end exercises of the device facade over the in-process peer.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use swemu_shim::container::{ContainerBuilder, SectionKind};
use swemu_shim::session::{LoopbackTransport, SimPeer};
use swemu_shim::{Config, Device, LoadState, MemoryBank, ShimError};

const TEST_PACKET: u64 = 4096;

fn open_device(dir: &tempfile::TempDir, index: u32) -> (Device, Arc<Mutex<SimPeer>>) {
    let (transport, peer) = LoopbackTransport::new();
    let config = Config {
        packet_size: TEST_PACKET,
        ..Config::default()
    };
    let device = Device::open_with_transport(
        index,
        &[MemoryBank::new(0, 1024 * 4096)],
        Box::new(transport),
        dir.path().join(format!("device_{index}")),
        config,
    );
    (device, peer)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn transfers_round_trip_across_chunk_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _peer) = open_device(&dir, 0);
    let packet = TEST_PACKET as usize;

    for len in [0, 1, packet - 1, packet, packet + 1, 3 * packet + 5] {
        let handle = device.create_bo(4 * TEST_PACKET, 0, false).unwrap();
        let data = pattern(len);
        let offset = 3;

        let written = device.write_bo(handle, &data, offset).unwrap();
        assert_eq!(written, len as u64);

        let mut back = vec![0u8; len];
        let read = device.read_bo(handle, &mut back, offset).unwrap();
        assert_eq!(read, len as u64);
        assert_eq!(back, data, "length {len} mismatched");

        device.free_bo(handle).unwrap();
    }
}

#[test]
fn out_of_range_transfer_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _peer) = open_device(&dir, 0);

    let handle = device.create_bo(4096, 0, false).unwrap();
    let err = device.write_bo(handle, &[0u8; 16], 4090).unwrap_err();
    assert!(matches!(
        err,
        ShimError::ShortTransfer { completed: 0, .. }
    ));
}

#[test]
fn export_then_import_sees_the_same_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (exporter, _peer_a) = open_device(&dir, 0);
    let (importer, _peer_b) = open_device(&dir, 1);

    let handle = exporter.create_bo(8192, 0, false).unwrap();
    let data = pattern(8192);
    exporter.write_bo(handle, &data, 0).unwrap();

    let token = exporter.export_bo(handle).unwrap();
    assert_eq!(token.size, 8192);
    assert!(token.path.exists());

    let imported = importer.import_bo(&token).unwrap();
    assert_eq!(importer.bo_size(imported).unwrap(), 8192);

    let mut back = vec![0u8; 8192];
    importer.read_bo(imported, &mut back, 0).unwrap();
    assert_eq!(back, data);
}

#[test]
fn exporting_twice_returns_the_same_token() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _peer) = open_device(&dir, 0);

    let handle = device.create_bo(4096, 0, false).unwrap();
    let first = device.export_bo(handle).unwrap();
    let second = device.export_bo(handle).unwrap();
    assert_eq!(first.path, second.path);
}

#[test]
fn poll_returns_ready_completions_and_respects_the_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (device, peer) = open_device(&dir, 0);
    let queue = device.create_stream(true).unwrap();

    // Two submissions complete immediately, three stay pending.
    device
        .stream_write_async(queue, &[b"one".as_slice()], false, 1)
        .unwrap();
    device
        .stream_write_async(queue, &[b"two".as_slice()], false, 2)
        .unwrap();
    peer.lock().unwrap().hold_completions(true);
    for ctx in 3..=5 {
        device
            .stream_write_async(queue, &[b"pending".as_slice()], false, ctx)
            .unwrap();
    }

    let start = Instant::now();
    let done = device
        .poll_completions(2, 4, Duration::from_secs(10))
        .unwrap();
    assert_eq!(done.len(), 2);
    assert!(start.elapsed() < Duration::from_secs(5));
    let contexts: Vec<u64> = done.iter().map(|c| c.context).collect();
    assert!(contexts.contains(&1) && contexts.contains(&2));

    // Nothing further completes: the poll must give up at its deadline
    // and hand back the empty result rather than hang.
    let start = Instant::now();
    let none = device
        .poll_completions(1, 4, Duration::from_millis(100))
        .unwrap();
    assert!(none.is_empty());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn stream_data_round_trips_between_queues() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _peer) = open_device(&dir, 0);

    let queue = device.create_stream(true).unwrap();
    let sent = device
        .stream_write(queue, &[b"stream payload".as_slice()], true)
        .unwrap();
    assert_eq!(sent, 14);

    let mut buf = [0u8; 14];
    let got = device.stream_read(queue, &mut [&mut buf[..]], true).unwrap();
    assert_eq!(got, 14);
    assert_eq!(&buf, b"stream payload");

    device.destroy_stream(queue).unwrap();
}

#[test]
fn gathered_stream_write_scatters_back_across_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _peer) = open_device(&dir, 0);

    let queue = device.create_stream(true).unwrap();
    let sent = device
        .stream_write(queue, &[b"head ".as_slice(), b"tail".as_slice()], true)
        .unwrap();
    assert_eq!(sent, 9);

    let mut first = [0u8; 5];
    let mut second = [0u8; 4];
    let got = device
        .stream_read(queue, &mut [&mut first[..], &mut second[..]], true)
        .unwrap();
    assert_eq!(got, 9);
    assert_eq!(&first, b"head ");
    assert_eq!(&second, b"tail");

    device.destroy_stream(queue).unwrap();
}

#[test]
fn gathered_async_write_reports_one_completion_for_all_spans() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _peer) = open_device(&dir, 0);

    let queue = device.create_stream(true).unwrap();
    device
        .stream_write_async(queue, &[b"ab".as_slice(), b"cdef".as_slice()], true, 9)
        .unwrap();

    let done = device
        .poll_completions(1, 4, Duration::from_secs(10))
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].context, 9);
    assert_eq!(done[0].nbytes, 6);
}

#[test]
fn valid_binary_walks_the_load_state_machine() {
    let dir = tempfile::tempdir().unwrap();
    let (device, peer) = open_device(&dir, 0);

    let image = ContainerBuilder::new()
        .section(SectionKind::Bitstream, b"BITSTREAM".to_vec())
        .section(SectionKind::Metadata, b"<platform/>".to_vec())
        .build();
    device.load_binary(&image).unwrap();

    assert_eq!(device.load_state(), LoadState::Loaded);
    assert_eq!(peer.lock().unwrap().bitstream_loads, 1);
    // The numbered run directory holds the dumped metadata.
    assert!(dir.path().join("device_0/binary_0/metadata.bin").exists());
}

#[test]
fn rejected_container_has_no_session_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let (device, peer) = open_device(&dir, 0);

    let err = device.load_binary(b"swbin0\0\0rest").unwrap_err();
    assert!(matches!(err, ShimError::InvalidContainer(_)));
    assert_eq!(device.load_state(), LoadState::Unloaded);
    assert!(!device.has_session());
    assert_eq!(peer.lock().unwrap().bitstream_loads, 0);

    // The device stays usable afterwards.
    let image = ContainerBuilder::new()
        .section(SectionKind::Bitstream, b"BITS".to_vec())
        .build();
    device.load_binary(&image).unwrap();
    assert_eq!(device.load_state(), LoadState::Loaded);
}

#[test]
fn close_tears_down_peer_and_run_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (device, peer) = open_device(&dir, 0);

    let handle = device.create_bo(4096, 0, false).unwrap();
    device.write_bo(handle, b"data", 0).unwrap();
    let device_dir = dir.path().join("device_0");
    assert!(device_dir.exists());

    device.close().unwrap();
    assert!(peer.lock().unwrap().closed);
    assert!(!device_dir.exists());
}
