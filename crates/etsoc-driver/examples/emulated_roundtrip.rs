//! Management requests against the in-process simulated device
//!
//! Runs without hardware: starts the simulator, brings up the emulated
//! transport and issues a few service requests, including one that times
//! out and one that the device answers with an event first.

use std::sync::Arc;
use std::time::Duration;

use etsoc_chip::mgmt::{self, id};
use etsoc_driver::{
    DeviceManagement, InstanceConfig, Reply, SimConfig, SoftDevice, SysEmuConfig, SysEmuTransport,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etsoc_driver=info")),
        )
        .init();

    let device = SoftDevice::start(SimConfig::default())?;
    device.set_reply(
        id::GET_MODULE_CURRENT_TEMPERATURE,
        Reply::with_payload(vec![46, 0, 0, 0]).after(Duration::from_millis(5)),
    );
    device.set_reply(
        id::GET_MODULE_VOLTAGE,
        Reply::with_payload(vec![0; 8]).after(Duration::from_millis(200)),
    );
    device.set_reply(
        id::GET_MODULE_UPTIME,
        Reply {
            event_before: Some(mgmt::EVENT_SP_TRACE_BUFFER_FULL),
            ..Reply::default()
        },
    );

    let transport = SysEmuTransport::start(Arc::new(device.clone()), SysEmuConfig::default())?;
    let service = DeviceManagement::new(Arc::new(transport), InstanceConfig::default())?;

    let requests = [
        (id::GET_MODULE_CURRENT_TEMPERATURE, Duration::from_secs(1)),
        (id::GET_MODULE_VOLTAGE, Duration::from_millis(20)),
        (id::GET_MODULE_UPTIME, Duration::from_secs(1)),
    ];
    for (msg_id, timeout) in requests {
        let mut out = [0u8; 8];
        let outcome =
            service.service_request(0, u32::from(msg_id), None, Some(&mut out[..]), timeout);
        println!(
            "{:<36} status {:>3}  device {:>8?}  host {:>10?}  {:02x?}",
            mgmt::name(msg_id).unwrap_or("?"),
            outcome.status,
            outcome.device_latency,
            outcome.host_latency,
            out
        );
    }

    for event in service.events(0)? {
        println!("event {} ({} payload bytes)", event.msg_id(), event.payload.len());
    }
    println!("{} command(s) reached the device", device.received().len());

    Ok(())
}
