use clap::Parser;
use log::{error, info};

use dfu_host::dfu_file::{DfuFile, PrefixReq, SuffixReq};
use dfu_host::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "dfu-suffix",
    version,
    about = "Add, check or remove the DFU suffix of a firmware file"
)]
struct Opt {
    /// Check DFU suffix of <file>
    #[arg(short = 'c', long, group = "mode")]
    check: bool,

    /// Add DFU suffix to <file>
    #[arg(short = 'a', long, group = "mode")]
    add: bool,

    /// Delete DFU suffix from <file>
    #[arg(short = 'D', long, group = "mode")]
    delete: bool,

    /// Add product ID into DFU suffix (hex)
    #[arg(short = 'p', long, value_name = "productID")]
    pid: Option<String>,

    /// Add vendor ID into DFU suffix (hex)
    #[arg(short = 'v', long, value_name = "vendorID")]
    vid: Option<String>,

    /// Add device version into DFU suffix (hex)
    #[arg(short = 'd', long, value_name = "deviceID")]
    did: Option<String>,

    /// DFU specification number for the suffix (hex, 0x0100 or 0x011a)
    #[arg(short = 'S', long, value_name = "specID", default_value = "0x0100")]
    spec: String,

    /// Target filename
    file: String,
}

fn parse_hex16(s: &str) -> Result<u16> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(digits, 16)
        .map_err(|_| Error::Usage(format!("invalid hex value \"{s}\"")))
}

fn run() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DFU_HOST_LOG", "info")
            .write_style("DFU_HOST_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();
    let mut file = DfuFile::new(&opt.file);

    if opt.add {
        let bcd_dfu = parse_hex16(&opt.spec)?;
        if !matches!(bcd_dfu, 0x0100 | 0x011a) {
            return Err(Error::Usage(format!(
                "only DFU specification numbers 0x0100 and 0x011a are supported, got {:#06x}",
                bcd_dfu
            )));
        }

        file.load(SuffixReq::NoSuffix, PrefixReq::MaybePrefix)?;
        file.bcd_dfu = bcd_dfu;
        if let Some(ref vid) = opt.vid {
            file.id_vendor = parse_hex16(vid)?.into();
        }
        if let Some(ref pid) = opt.pid {
            file.id_product = parse_hex16(pid)?.into();
        }
        if let Some(ref did) = opt.did {
            file.bcd_device = parse_hex16(did)?.into();
        }

        info!("Adding DFU suffix to {}", file.name);
        file.store(true, file.size.prefix != 0)?;
    } else if opt.check {
        file.load(SuffixReq::NeedsSuffix, PrefixReq::MaybePrefix)?;
        print!("{}", file.describe());
    } else if opt.delete {
        file.load(SuffixReq::NeedsSuffix, PrefixReq::MaybePrefix)?;
        info!("Removing DFU suffix from {}", file.name);
        file.store(false, file.size.prefix != 0)?;
    } else {
        return Err(Error::Usage("specify one of -a, -c or -D".into()));
    }
    Ok(())
}

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}
