use clap::Parser;
use log::{error, info, warn};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use dfu_host::device::{
    DfuIf, MatchSpec, OpenDfuIf, detach_to_dfu_mode, ensure_unambiguous, probe_devices,
    resolve_transfer_size,
};
use dfu_host::dfu_file::{DfuFile, OptionalId, PrefixReq, SuffixReq};
use dfu_host::dfuse::{DfuseDevice, DfuseOptions};
use dfu_host::error::{Error, Result};
use dfu_host::progress::Progress;
use dfu_host::{protocol, transfer};

#[derive(Parser, Debug)]
#[command(
    name = "dfu-host",
    version,
    about = "USB Device Firmware Upgrade (DFU 1.1 / DfuSe) host tool"
)]
struct Opt {
    /// Print verbose debug statements
    #[arg(short = 'v', long)]
    verbose: bool,

    /// List the currently attached DFU capable USB devices
    #[arg(short = 'l', long)]
    list: bool,

    /// Detach the currently attached DFU capable USB devices
    #[arg(short = 'e', long)]
    detach: bool,

    /// Time to wait before reopening a device after detach
    #[arg(short = 'E', long, value_name = "seconds", default_value_t = 5)]
    detach_delay: u64,

    /// Specify run-time (and optionally DFU-mode) vendor/product IDs, in hex
    #[arg(short = 'd', long, value_name = "vid:pid[,vid_dfu:pid_dfu]")]
    device: Option<String>,

    /// Match given device number (devnum from --list)
    #[arg(short = 'n', long, value_name = "dnum")]
    devnum: Option<u8>,

    /// Specify path to DFU device
    #[arg(short = 'p', long, value_name = "bus-port.[port...]")]
    path: Option<String>,

    /// Specify the configuration of the DFU device
    #[arg(short = 'c', long = "cfg", value_name = "config_nr")]
    cfg: Option<u8>,

    /// Specify the DFU interface number
    #[arg(short = 'i', long = "intf", value_name = "intf_nr")]
    intf: Option<u8>,

    /// Specify the serial string of the DFU device, per mode
    #[arg(short = 'S', long, value_name = "serial[,serial_dfu]")]
    serial: Option<String>,

    /// Specify the altsetting of the DFU interface, by number or name
    #[arg(short = 'a', long, value_name = "alt")]
    alt: Option<String>,

    /// Specify the number of bytes per USB transfer
    #[arg(short = 't', long, value_name = "size")]
    transfer_size: Option<usize>,

    /// Read firmware from device into <file>
    #[arg(short = 'U', long, value_name = "file", conflicts_with = "download")]
    upload: Option<PathBuf>,

    /// Specify the expected upload size, in bytes
    #[arg(short = 'Z', long, value_name = "bytes")]
    upload_size: Option<u64>,

    /// Write firmware from <file> into device
    #[arg(short = 'D', long, value_name = "file")]
    download: Option<PathBuf>,

    /// Issue USB reset signalling once we are finished
    #[arg(short = 'R', long)]
    reset: bool,

    /// Wait for the device to appear
    #[arg(short = 'w', long)]
    wait: bool,

    /// DfuSe mode: target address plus colon-separated modifiers
    /// (leave, mass-erase, unprotect, will-reset, force, <length>)
    #[arg(short = 's', long = "dfuse-address", value_name = "address[:opt...]")]
    dfuse: Option<String>,

    /// Say yes to all prompts
    #[arg(short = 'y', long = "yes")]
    yes: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Action {
    List,
    Detach,
    Upload,
    Download,
}

/// Parse `vid:pid`, either part optionally empty, hex with or without 0x.
fn parse_vid_pid(s: &str) -> Result<(Option<u16>, Option<u16>)> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| Error::Usage(format!("expected <vid>:<pid>, got \"{s}\"")))?;
    let parse = |part: &str| -> Result<Option<u16>> {
        if part.is_empty() {
            return Ok(None);
        }
        let digits = part.strip_prefix("0x").unwrap_or(part);
        u16::from_str_radix(digits, 16)
            .map(Some)
            .map_err(|_| Error::Usage(format!("invalid hex ID \"{part}\"")))
    };
    Ok((parse(vid)?, parse(pid)?))
}

fn build_match_spec(opt: &Opt) -> Result<MatchSpec> {
    let mut spec = MatchSpec {
        path: opt.path.clone(),
        // "-c 0" means an unconfigured device; treat as don't-care.
        config: opt.cfg.filter(|&c| c != 0),
        interface: opt.intf,
        devnum: opt.devnum,
        ..Default::default()
    };

    if let Some(ref ids) = opt.device {
        let (runtime, dfu) = match ids.split_once(',') {
            Some((runtime, dfu)) => (runtime, Some(dfu)),
            None => (ids.as_str(), None),
        };
        (spec.vendor, spec.product) = parse_vid_pid(runtime)?;
        if let Some(dfu) = dfu {
            (spec.vendor_dfu, spec.product_dfu) = parse_vid_pid(dfu)?;
        }
    }

    if let Some(ref serial) = opt.serial {
        match serial.split_once(',') {
            Some((runtime, dfu)) => {
                spec.serial = Some(runtime.to_string()).filter(|s| !s.is_empty());
                spec.serial_dfu = Some(dfu.to_string()).filter(|s| !s.is_empty());
            }
            None => {
                spec.serial = Some(serial.clone());
                spec.serial_dfu = Some(serial.clone());
            }
        }
    }

    if let Some(ref alt) = opt.alt {
        match alt.parse::<u8>() {
            Ok(index) => spec.alt_index = Some(index),
            Err(_) => spec.alt_name = Some(alt.clone()),
        }
    }

    Ok(spec)
}

/// Progress rendering for interactive transfers.
#[derive(Default)]
struct BarProgress {
    bar: Option<indicatif::ProgressBar>,
}

impl Progress for BarProgress {
    fn start_task(&mut self, total: Option<u64>) {
        let bar = match total {
            Some(total) => indicatif::ProgressBar::new(total),
            None => indicatif::ProgressBar::new_spinner(),
        };
        self.bar = Some(bar);
    }

    fn advance(&mut self, n: u64) {
        if let Some(ref bar) = self.bar {
            bar.inc(n);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

fn confirm_overwrite(path: &PathBuf, yes: bool) -> Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    if metadata.len() == 0 {
        return Ok(());
    }
    if yes {
        return Ok(());
    }
    print!("{}: file exists, overwrite? (y/N) ", path.display());
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Ok(()),
        _ => Err(Error::Usage(format!(
            "{}: file exists, not overwriting",
            path.display()
        ))),
    }
}

fn probe_with_wait(spec: &MatchSpec, wait: bool) -> Result<Vec<DfuIf>> {
    loop {
        let found = probe_devices(spec)?;
        if !found.is_empty() || !wait {
            return Ok(found);
        }
        sleep(Duration::from_millis(500));
    }
}

fn run() -> Result<()> {
    let opt = Opt::parse();

    let default_level = if opt.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DFU_HOST_LOG", default_level)
            .write_style("DFU_HOST_LOG_STYLE"),
    )
    .init();

    let dfuse_opts = opt.dfuse.as_deref().map(DfuseOptions::parse).transpose()?;

    let action = if opt.list {
        Action::List
    } else if opt.detach {
        Action::Detach
    } else if opt.upload.is_some() {
        Action::Upload
    } else if opt.download.is_some() {
        Action::Download
    } else if dfuse_opts
        .as_ref()
        .is_some_and(|o| o.mass_erase || o.unprotect || o.leave)
    {
        // Special commands need no file.
        Action::Download
    } else {
        return Err(Error::Usage(
            "you need to specify one of -l, -e, -U or -D".into(),
        ));
    };

    let mut spec = build_match_spec(&opt)?;

    // Load and validate the download file up front, before touching any
    // device.
    let mut file = DfuFile::new(
        opt.download
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    if action == Action::Download && !file.name.is_empty() {
        file.load(SuffixReq::MaybeSuffix, PrefixReq::MaybePrefix)?;
        if file.size.suffix > 0 && !matches!(file.bcd_dfu, 0x0100 | 0x011a) {
            return Err(Error::Data(format!(
                "unsupported DFU file revision 0x{:04x}",
                file.bcd_dfu
            )));
        }
        // Use IDs from the file suffix for matching when the user gave none.
        if spec.vendor.is_none() {
            if let OptionalId(Some(vendor)) = file.id_vendor {
                info!("Match vendor ID from file: {vendor:04x}");
                spec.vendor = Some(vendor);
            }
        }
        if spec.product.is_none() {
            if let OptionalId(Some(product)) = file.id_product {
                info!("Match product ID from file: {product:04x}");
                spec.product = Some(product);
            }
        }
    }

    let interfaces = probe_with_wait(&spec, opt.wait)?;

    if action == Action::List {
        for dfu_if in &interfaces {
            println!("{}", dfu_if.describe());
        }
        return Ok(());
    }

    ensure_unambiguous(&interfaces)?;
    let first = interfaces[0].clone();
    info!(
        "Opening DFU capable USB device [{:04x}:{:04x}]",
        first.vendor, first.product
    );

    let (runtime_vendor, runtime_product);
    let candidates = if !first.is_dfu_mode() {
        runtime_vendor = first.vendor;
        runtime_product = first.product;
        info!(
            "Run-time device DFU version 0x{:04x}",
            first.func_dfu.bcd_dfu_version
        );

        detach_to_dfu_mode(&first)?;
        if action == Action::Detach {
            return Ok(());
        }

        sleep(Duration::from_secs(opt.detach_delay));

        // Only the DFU-mode incarnation may match from here on.
        spec.dfu_mode_only = true;
        let interfaces = probe_with_wait(&spec, opt.wait)?;
        if interfaces.is_empty() {
            return Err(Error::Io("lost device after detach and reset".into()));
        }
        ensure_unambiguous(&interfaces)?;
        interfaces
    } else {
        runtime_vendor = spec.vendor.unwrap_or(first.vendor);
        runtime_product = spec.product.unwrap_or(first.product);

        if action == Action::Detach {
            let mut open = OpenDfuIf::open(&first, false)?;
            protocol::detach(&mut open, 1000)?;
            return Ok(());
        }
        interfaces
    };

    let selected = match candidates.len() {
        1 => candidates.into_iter().next().unwrap(),
        n => {
            for dfu_if in &candidates {
                eprintln!("{}", dfu_if.describe());
            }
            return Err(Error::Usage(format!(
                "{n} DFU interfaces/altsettings match; specify one with --intf / --alt"
            )));
        }
    };
    println!("{}", selected.describe());
    info!(
        "DFU mode device DFU version 0x{:04x}",
        selected.func_dfu.bcd_dfu_version
    );

    let dfuse_mode = selected.func_dfu.bcd_dfu_version == 0x011a || dfuse_opts.is_some();
    if dfuse_opts.is_some() && selected.func_dfu.bcd_dfu_version != 0x011a {
        warn!("DfuSe options used on a non-DfuSe device");
    }

    let xfer_size = resolve_transfer_size(
        &selected.func_dfu,
        opt.transfer_size,
        selected.max_packet_size0,
    )?;

    let mut open = OpenDfuIf::open(&selected, true)?;
    let status = protocol::ensure_idle(&mut open)?;
    log::debug!(
        "state = {:?}, status = {:?}, continuing",
        status.state,
        status.status
    );

    let mut progress = BarProgress::default();

    match action {
        Action::Upload => {
            if !selected.func_dfu.can_upload() {
                warn!("Device does not report upload capability");
            }
            let path = opt.upload.as_ref().unwrap();
            confirm_overwrite(path, opt.yes)?;
            let out = std::fs::File::create(path)?;
            let mut sink = BufWriter::new(out);

            let total = if dfuse_mode {
                let alt_name = selected.alt_name.clone();
                let mut dfuse = DfuseDevice::new(&mut open, alt_name.as_deref());
                let dfuse_opts = dfuse_opts.unwrap_or_default();
                dfuse.do_upload(xfer_size, &mut sink, &dfuse_opts, &mut progress)?
            } else {
                transfer::do_upload(
                    &mut open,
                    xfer_size,
                    &mut sink,
                    opt.upload_size,
                    &mut progress,
                )?
            };
            sink.flush()?;
            info!("Upload of {total} bytes finished");
        }
        Action::Download => {
            if !selected.func_dfu.can_download() {
                warn!("Device does not report download capability");
            }
            // Non-fatal ID cross-check between file suffix and device.
            if !file.id_vendor.matches(runtime_vendor) && !file.id_vendor.matches(selected.vendor)
            {
                warn!(
                    "file vendor ID {:04x} does not match device",
                    file.id_vendor
                );
            }
            if !file.id_product.matches(runtime_product)
                && !file.id_product.matches(selected.product)
            {
                warn!(
                    "file product ID {:04x} does not match device",
                    file.id_product
                );
            }

            if dfuse_mode || file.bcd_dfu == 0x011a {
                let alt_name = selected.alt_name.clone();
                let mut dfuse = DfuseDevice::new(&mut open, alt_name.as_deref());
                let dfuse_opts = dfuse_opts.unwrap_or_default();
                if file.name.is_empty() {
                    // Special commands only.
                    if dfuse_opts.unprotect {
                        dfuse.special_command(dfu_host::dfuse::Command::ReadUnprotect)?;
                    } else if dfuse_opts.mass_erase {
                        info!("Performing mass erase");
                        dfuse.special_command(dfu_host::dfuse::Command::MassErase)?;
                    }
                    if dfuse_opts.leave {
                        dfuse.leave(
                            dfuse_opts.address.unwrap_or(0),
                            dfuse_opts.will_reset,
                        )?;
                    }
                } else {
                    let total = dfuse.do_dnload(
                        xfer_size,
                        &file,
                        selected.altsetting,
                        &dfuse_opts,
                        &mut progress,
                    )?;
                    info!("Download of {total} bytes finished");
                }
            } else {
                let total =
                    transfer::do_download(&mut open, xfer_size, file.payload(), &mut progress)?;
                info!("Download of {total} bytes finished");
            }
        }
        Action::List | Action::Detach => unreachable!(),
    }

    if opt.reset {
        if let Err(e) = protocol::detach(&mut open, 1000) {
            warn!("unable to detach before reset: {e}");
        }
        info!("Resetting USB to switch back to run-time mode");
        open.reset()?;
    }

    open.release();
    Ok(())
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            error!("{e}");
            if let Error::Usb { source, .. } = &e {
                error!("USB error detail: {source}");
            }
            std::process::exit(e.exit_code());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vid_pid_pairs() {
        assert_eq!(
            parse_vid_pid("1fc9:000c").unwrap(),
            (Some(0x1fc9), Some(0x000c))
        );
        assert_eq!(parse_vid_pid(":df11").unwrap(), (None, Some(0xdf11)));
        assert_eq!(parse_vid_pid("0x0483:").unwrap(), (Some(0x0483), None));
        assert!(parse_vid_pid("0483").is_err());
        assert!(parse_vid_pid("xyzzy:1").is_err());
    }

    #[test]
    fn alt_flag_number_or_name() {
        let opt = Opt::parse_from(["dfu-host", "-l", "-a", "1"]);
        let spec = build_match_spec(&opt).unwrap();
        assert_eq!(spec.alt_index, Some(1));
        assert_eq!(spec.alt_name, None);

        let opt = Opt::parse_from(["dfu-host", "-l", "-a", "Internal Flash"]);
        let spec = build_match_spec(&opt).unwrap();
        assert_eq!(spec.alt_index, None);
        assert_eq!(spec.alt_name.as_deref(), Some("Internal Flash"));
    }

    #[test]
    fn serial_splits_runtime_and_dfu() {
        let opt = Opt::parse_from(["dfu-host", "-l", "-S", "abc,def"]);
        let spec = build_match_spec(&opt).unwrap();
        assert_eq!(spec.serial.as_deref(), Some("abc"));
        assert_eq!(spec.serial_dfu.as_deref(), Some("def"));

        let opt = Opt::parse_from(["dfu-host", "-l", "-S", "abc"]);
        let spec = build_match_spec(&opt).unwrap();
        assert_eq!(spec.serial.as_deref(), Some("abc"));
        assert_eq!(spec.serial_dfu.as_deref(), Some("abc"));
    }

    #[test]
    fn config_zero_is_dont_care() {
        let opt = Opt::parse_from(["dfu-host", "-l", "-c", "0"]);
        let spec = build_match_spec(&opt).unwrap();
        assert_eq!(spec.config, None);
    }

    #[test]
    fn device_filter_with_dfu_pair() {
        let opt = Opt::parse_from(["dfu-host", "-l", "-d", "1fc9:000c,1fc9:0021"]);
        let spec = build_match_spec(&opt).unwrap();
        assert_eq!(spec.vendor, Some(0x1fc9));
        assert_eq!(spec.product, Some(0x000c));
        assert_eq!(spec.vendor_dfu, Some(0x1fc9));
        assert_eq!(spec.product_dfu, Some(0x0021));
    }
}
