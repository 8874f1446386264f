//! Enumerate all ET-SoC-1 devices on the system
//!
//! Scans `/dev` for management/compute node pairs and prints the
//! configuration snapshot each device reports.

use anyhow::Context;
use etsoc_driver::{Channel, DeviceManager, PcieTransport, QueueTransport};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etsoc_driver=info")),
        )
        .init();

    println!("ET-SoC-1 Device Enumeration\n");

    let manager = DeviceManager::discover().context("device discovery")?;
    println!("Found {} device(s)", manager.device_count());
    for &index in manager.recovery_devices() {
        println!("  et{index}: management node only (recovery mode)");
    }
    println!();

    let transport = PcieTransport::from_manager(&manager).context("opening device nodes")?;
    for (device, info) in manager.devices().iter().enumerate() {
        let cfg = transport.device_config(device)?;
        let dma = transport.dma_info(device)?;

        println!("Device et{}:", info.index);
        println!("   Management: {}", info.mgmt_path.display());
        println!("   Compute:    {}", info.ops_path.display());
        println!("   Form:       {:?}, {} W TDP", cfg.form_factor, cfg.tdp_watts);
        println!(
            "   Minions:    {} shires @ {} MHz (mask {:#010x})",
            cfg.active_shires(),
            cfg.boot_freq_mhz,
            cfg.shire_mask
        );
        println!(
            "   Caches:     L2 {} MB, L3 {} MB, scratchpad {} MB",
            cfg.l2_mb, cfg.l3_mb, cfg.scratchpad_mb
        );
        println!(
            "   DRAM:       {} MiB at {:#x}",
            dma.dram_size >> 20,
            dma.dram_base
        );
        println!(
            "   Queues:     {} compute SQ(s) of {} bytes, mgmt SQ of {} bytes",
            transport.sq_count(device, Channel::Compute)?,
            transport.sq_capacity(device, Channel::Compute)?,
            transport.sq_capacity(device, Channel::Management)?
        );
        println!(
            "   State:      {:?}",
            transport.device_state(device, Channel::Management)?
        );
        println!();
    }

    Ok(())
}
