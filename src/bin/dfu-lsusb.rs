use anyhow::Result;
use clap::Parser;

use dfu_host::device::{MatchSpec, probe_devices};

#[derive(Parser, Debug)]
#[command(
    name = "dfu-lsusb",
    version,
    about = "List USB devices, marking DFU capable interfaces"
)]
struct Opt {
    /// Only show DFU capable interfaces
    #[arg(short = 'd', long)]
    dfu_only: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DFU_HOST_LOG", "warn")
            .write_style("DFU_HOST_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    let dfu_interfaces = probe_devices(&MatchSpec::default())?;

    if !opt.dfu_only {
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            let product = device.open().ok().and_then(|h| {
                desc.product_string_index()
                    .and_then(|idx| h.read_string_descriptor_ascii(idx).ok())
            });
            println!(
                "Bus {:03} Device {:03}: ID {:04x}:{:04x} {}",
                device.bus_number(),
                device.address(),
                desc.vendor_id(),
                desc.product_id(),
                product.as_deref().unwrap_or(""),
            );
        }
    }

    for dfu_if in &dfu_interfaces {
        println!("{}", dfu_if.describe());
    }
    Ok(())
}
