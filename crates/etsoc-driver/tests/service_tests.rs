//! Service request tests
//!
//! Every scenario runs against the in-process simulated device through the
//! emulated transport, so no hardware or external emulator is needed.

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use etsoc_chip::mgmt::{self, id};
use etsoc_chip::wire::CommonHeader;
use etsoc_driver::{
    DeviceManagement, InstanceConfig, Reply, SimConfig, SoftDevice, SysEmuConfig, SysEmuTransport,
};

fn emulated(config: SimConfig) -> (SoftDevice, DeviceManagement) {
    let device = SoftDevice::start(config).expect("simulated device");
    let transport = SysEmuTransport::start(Arc::new(device.clone()), SysEmuConfig::default())
        .expect("emulated transport");
    let service = DeviceManagement::new(Arc::new(transport), InstanceConfig::default())
        .expect("device management");
    (device, service)
}

fn get(service: &DeviceManagement, msg_id: u16, out: &mut [u8], timeout: Duration) -> i32 {
    service
        .service_request(0, u32::from(msg_id), None, Some(out), timeout)
        .status
}

#[test]
fn test_get_round_trip() {
    let (device, service) = emulated(SimConfig::default());
    device.set_reply(
        id::GET_MODULE_CURRENT_TEMPERATURE,
        Reply::with_payload(vec![47, 0, 0, 0]),
    );

    let mut out = [0u8; 4];
    let outcome = service.service_request(
        0,
        u32::from(id::GET_MODULE_CURRENT_TEMPERATURE),
        None,
        Some(&mut out[..]),
        Duration::from_secs(2),
    );
    assert!(outcome.is_success(), "status {}", outcome.status);
    assert_eq!(out, [47, 0, 0, 0]);
    assert!(outcome.host_latency >= outcome.device_latency);
}

#[test]
fn test_output_truncated_to_buffer() {
    let (_device, service) = emulated(SimConfig::default());
    let mut out = [0u8; 2];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );
    // Default GET payload is the message id as a little-endian u64.
    assert_eq!(out, [id::GET_MODULE_UPTIME as u8, 0]);
}

#[test]
fn test_reported_device_latency() {
    let (device, service) = emulated(SimConfig::default());
    device.set_reply(
        id::GET_MODULE_POWER,
        Reply::with_payload(vec![1; 8]).after(Duration::from_millis(30)),
    );
    let mut out = [0u8; 8];
    let outcome = service.service_request(
        0,
        u32::from(id::GET_MODULE_POWER),
        None,
        Some(&mut out[..]),
        Duration::from_secs(2),
    );
    assert!(outcome.is_success());
    assert!(outcome.device_latency >= Duration::from_millis(30));
    assert!(outcome.host_latency >= Duration::from_millis(30));
}

#[test]
fn test_concurrent_access() {
    let (device, service) = emulated(SimConfig::default());
    let service = Arc::new(service);
    device.set_reply(
        id::GET_MODULE_CURRENT_TEMPERATURE,
        Reply::with_payload(vec![42, 0, 0, 0]).after(Duration::from_millis(400)),
    );

    let first = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let mut out = [0u8; 4];
            let status = get(
                &service,
                id::GET_MODULE_CURRENT_TEMPERATURE,
                &mut out,
                Duration::from_millis(1000),
            );
            (status, out)
        })
    };
    // Let the first caller take the channel.
    thread::sleep(Duration::from_millis(100));

    let mut out = [0u8; 4];
    let second = service.service_request(
        0,
        u32::from(id::GET_MODULE_CURRENT_TEMPERATURE),
        None,
        Some(&mut out[..]),
        Duration::ZERO,
    );

    let third = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let mut out = [0u8; 4];
            let status = get(
                &service,
                id::GET_MODULE_CURRENT_TEMPERATURE,
                &mut out,
                Duration::from_millis(70_000),
            );
            (status, out)
        })
    };

    let (status, out) = first.join().unwrap();
    assert_eq!(status, 0);
    assert_eq!(out[0], 42);

    assert_eq!(second.status, -libc::EAGAIN);
    assert!(second.host_latency < Duration::from_millis(100));

    let (status, out) = third.join().unwrap();
    assert_eq!(status, 0);
    assert_eq!(out[0], 42);

    // The zero-timeout caller never reached the device.
    let sent = device
        .received()
        .iter()
        .filter(|h| h.msg_id == id::GET_MODULE_CURRENT_TEMPERATURE)
        .count();
    assert_eq!(sent, 2);
}

#[test]
fn test_timeout_fidelity() {
    let (device, service) = emulated(SimConfig::default());
    device.set_reply(
        id::GET_MODULE_VOLTAGE,
        Reply::with_payload(vec![9; 8]).after(Duration::from_millis(300)),
    );

    let mut out = [0u8; 8];
    let outcome = service.service_request(
        0,
        u32::from(id::GET_MODULE_VOLTAGE),
        None,
        Some(&mut out[..]),
        Duration::from_millis(50),
    );
    assert_eq!(outcome.status, -libc::EAGAIN);
    assert!(outcome.host_latency < Duration::from_millis(300));
    assert_eq!(out, [0; 8]);

    // The late response is dropped; the channel keeps working.
    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );
    assert_eq!(out, u64::from(id::GET_MODULE_UPTIME).to_le_bytes());
}

#[test]
fn test_unanswered_command_times_out() {
    let (device, service) = emulated(SimConfig::default());
    device.set_reply(id::GET_MODULE_POWER_STATE, Reply::silent());
    let mut out = [0u8; 1];
    assert_eq!(
        get(&service, id::GET_MODULE_POWER_STATE, &mut out, Duration::from_millis(100)),
        -libc::EAGAIN
    );
}

#[test]
fn test_event_never_resolves_a_command() {
    let (device, service) = emulated(SimConfig::default());
    // The event carries the command's tag and arrives first.
    device.set_reply(
        id::GET_MODULE_UPTIME,
        Reply {
            payload: Some(vec![7; 8]),
            event_before: Some(mgmt::EVENT_SP_TRACE_BUFFER_FULL),
            ..Reply::default()
        },
    );

    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );
    assert_eq!(out, [7; 8]);

    let events = service.events(0).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].msg_id(), mgmt::EVENT_SP_TRACE_BUFFER_FULL);
    assert!(service.events(0).unwrap().is_empty());
}

#[test]
fn test_injected_events_are_queued() {
    let (device, service) = emulated(SimConfig::default());
    device.inject_event(300, &[1, 2, 3]).unwrap();
    device.inject_event(513, &[]).unwrap();

    // Injected frames reach the completion queue before this response.
    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );

    let events = service.events(0).unwrap();
    let ids: Vec<u16> = events.iter().map(|e| e.msg_id()).collect();
    assert_eq!(ids, vec![300, 513]);
    assert_eq!(&events[0].payload[..], &[1, 2, 3]);
}

#[test]
fn test_stray_and_duplicate_responses() {
    let (device, service) = emulated(SimConfig::default());
    device
        .inject_response(0x7FFF, id::GET_MODULE_UPTIME, 0, &[0xEE; 8])
        .unwrap();
    device.set_reply(
        id::GET_MODULE_POWER,
        Reply {
            payload: Some(vec![3; 8]),
            duplicate: true,
            ..Reply::default()
        },
    );

    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_POWER, &mut out, Duration::from_secs(2)),
        0
    );
    assert_eq!(out, [3; 8]);

    // The duplicate of the first response must not satisfy this one.
    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );
    assert_eq!(out, u64::from(id::GET_MODULE_UPTIME).to_le_bytes());
}

#[test]
fn test_tags_unique_across_callers() {
    let (device, service) = emulated(SimConfig::default());
    let service = Arc::new(service);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for _ in 0..5 {
                    let mut out = [0u8; 8];
                    let status = get(
                        &service,
                        id::GET_MODULE_UPTIME,
                        &mut out,
                        Duration::from_secs(10),
                    );
                    assert_eq!(status, 0);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut tags: Vec<u16> = device.received().iter().map(|h| h.tag_id).collect();
    assert_eq!(tags.len(), 20);
    tags.sort_unstable();
    tags.dedup();
    assert_eq!(tags.len(), 20);
}

#[test]
fn test_device_status_maps_to_eio() {
    let (device, service) = emulated(SimConfig::default());
    device.set_reply(
        id::SET_MODULE_STATIC_TDP_LEVEL,
        Reply::failing(3),
    );
    let outcome = service.service_request(
        0,
        u32::from(id::SET_MODULE_STATIC_TDP_LEVEL),
        Some(&[10][..]),
        None,
        Duration::from_secs(2),
    );
    assert_eq!(outcome.status, -libc::EIO);
}

#[test]
fn test_invalid_requests_never_reach_device() {
    let (device, service) = emulated(SimConfig::default());
    let timeout = Duration::from_secs(1);
    let mut out = [0u8; 8];

    let cases: Vec<(usize, u32, Option<&[u8]>, bool)> = vec![
        // Unknown command ids
        (0, 74, None, true),
        (0, 100_000, None, true),
        // Device index out of range
        (3, u32::from(id::GET_MODULE_UPTIME), None, true),
        // GET without an output buffer
        (0, u32::from(id::GET_MODULE_UPTIME), None, false),
        // SET without input
        (0, u32::from(id::SET_MODULE_TEMPERATURE_THRESHOLDS), None, false),
        // Temperature below the accepted range
        (0, u32::from(id::SET_MODULE_TEMPERATURE_THRESHOLDS), Some(&[19, 0][..]), false),
        // Not one of the PCIe reset types
        (0, u32::from(id::SET_PCIE_RESET), Some(&[3][..]), false),
        // Direct input larger than a management payload
        (0, u32::from(id::SET_FRU), Some(&[0u8; 129][..]), false),
    ];
    for (dev, command, input, with_output) in cases {
        let output = if with_output { Some(&mut out[..]) } else { None };
        let outcome = service.service_request(dev, command, input, output, timeout);
        assert_eq!(
            outcome.status,
            -libc::EINVAL,
            "device {dev} command {command} was accepted"
        );
    }
    assert!(device.received().is_empty());
}

#[test]
fn test_firmware_update_stages_image() {
    let (device, service) = emulated(SimConfig::default());
    let image: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    let path = file.path().to_str().unwrap().as_bytes().to_vec();

    let outcome = service.service_request(
        0,
        u32::from(id::SET_FIRMWARE_UPDATE),
        Some(path.as_slice()),
        None,
        Duration::from_secs(2),
    );
    assert!(outcome.is_success(), "status {}", outcome.status);
    assert_eq!(device.scratch_contents(image.len()).unwrap(), image);
    assert_eq!(
        device.received().last().map(|h| h.msg_id),
        Some(id::SET_FIRMWARE_UPDATE)
    );
}

#[test]
fn test_firmware_update_missing_image() {
    let (device, service) = emulated(SimConfig::default());
    let outcome = service.service_request(
        0,
        u32::from(id::SET_FIRMWARE_UPDATE),
        Some(&b"/nonexistent/firmware.bin\0"[..]),
        None,
        Duration::from_secs(1),
    );
    assert_eq!(outcome.status, -libc::EINVAL);
    assert!(device.received().is_empty());
}

#[test]
fn test_root_certificate_hash() {
    let (device, service) = emulated(SimConfig::default());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}  sp_root.pem", "a5".repeat(64)).unwrap();
    let path = file.path().to_str().unwrap().as_bytes().to_vec();

    let outcome = service.service_request(
        0,
        u32::from(id::SET_SP_BOOT_ROOT_CERT),
        Some(path.as_slice()),
        None,
        Duration::from_secs(2),
    );
    assert!(outcome.is_success(), "status {}", outcome.status);
    let header = *device.received().last().unwrap();
    assert_eq!(header.msg_id, id::SET_SP_BOOT_ROOT_CERT);
    assert_eq!(usize::from(header.size), mgmt::HASH_LEN);

    let mut short = tempfile::NamedTempFile::new().unwrap();
    write!(short, "abcd").unwrap();
    let path = short.path().to_str().unwrap().as_bytes().to_vec();
    let outcome = service.service_request(
        0,
        u32::from(id::SET_SW_BOOT_ROOT_CERT),
        Some(path.as_slice()),
        None,
        Duration::from_secs(1),
    );
    assert_eq!(outcome.status, -libc::EINVAL);
}

#[test]
fn test_reset_recreates_instance() {
    let (device, service) = emulated(SimConfig::default());
    let before = service.instance(0).unwrap();

    let outcome = service.service_request(
        0,
        u32::from(id::RESET_ETSOC),
        None,
        None,
        Duration::from_secs(10),
    );
    assert!(outcome.is_success(), "status {}", outcome.status);
    assert_eq!(device.reset_count(), 1);

    let after = service.instance(0).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));

    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );
    assert_eq!(out, u64::from(id::GET_MODULE_UPTIME).to_le_bytes());
}

#[test]
fn test_timed_out_request_releases_slot() {
    let (device, service) = emulated(SimConfig::default());
    device.set_reply(id::GET_MODULE_PART_NUMBER, Reply::silent());

    let mut out = [0u8; 8];
    for _ in 0..5 {
        assert_eq!(
            get(&service, id::GET_MODULE_PART_NUMBER, &mut out, Duration::from_millis(30)),
            -libc::EAGAIN
        );
    }
    assert_eq!(service.instance(0).unwrap().pending_count(), 0);
}

#[test]
fn test_truncated_completion_is_dropped() {
    let (device, service) = emulated(SimConfig::default());
    // Header promising 200 body bytes that never follow.
    let truncated = CommonHeader {
        size: 200,
        tag_id: 0,
        msg_id: id::GET_MODULE_UPTIME,
        flags: 0,
    };
    device.inject_frame(Bytes::copy_from_slice(&truncated.encode()));
    thread::sleep(Duration::from_millis(200));

    let mut out = [0u8; 8];
    assert_eq!(
        get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(2)),
        0
    );
    assert_eq!(out, u64::from(id::GET_MODULE_UPTIME).to_le_bytes());

    // Teardown joins the receiver thread.
    drop(service);
}

#[test]
fn test_request_queued_behind_reset() {
    let (device, service) = emulated(SimConfig {
        reset_delay: Duration::from_millis(300),
        ..SimConfig::default()
    });
    let service = Arc::new(service);

    let reset = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            service
                .service_request(0, u32::from(id::RESET_ETSOC), None, None, Duration::from_secs(10))
                .status
        })
    };
    // Arrive while the reset holds the channel.
    thread::sleep(Duration::from_millis(50));

    let mut out = [0u8; 8];
    let status = get(&service, id::GET_MODULE_UPTIME, &mut out, Duration::from_secs(10));
    assert_eq!(reset.join().unwrap(), 0);
    assert_eq!(status, 0);
    assert_eq!(out, u64::from(id::GET_MODULE_UPTIME).to_le_bytes());
    assert_eq!(device.reset_count(), 1);
}
