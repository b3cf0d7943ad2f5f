use clap::Parser;
use log::{error, info};

use dfu_host::dfu_file::{DfuFile, PrefixReq, PrefixType, SuffixReq};
use dfu_host::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "dfu-prefix",
    version,
    about = "Add, check or remove TI Stellaris and NXP LPC prefixes of a firmware file"
)]
struct Opt {
    /// Check prefix of <file>
    #[arg(short = 'c', long, group = "mode")]
    check: bool,

    /// Add prefix to <file>
    #[arg(short = 'a', long, group = "mode")]
    add: bool,

    /// Delete prefix from <file>
    #[arg(short = 'D', long, group = "mode")]
    delete: bool,

    /// TI Stellaris flash address for the prefix (hex), together with -a
    #[arg(short = 's', long = "stellaris-address", value_name = "address")]
    stellaris_address: Option<String>,

    /// Act on a TI Stellaris prefix
    #[arg(short = 'T', long, group = "kind")]
    stellaris: bool,

    /// Act on an NXP LPC unencrypted prefix
    #[arg(short = 'L', long = "lpc-prefix", group = "kind")]
    lpc: bool,

    /// Target filename
    file: String,
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

    let requested = if opt.stellaris {
        PrefixType::Stellaris
    } else if opt.lpc {
        PrefixType::LpcUnencrypted
    } else {
        PrefixType::None
    };

    if opt.add {
        if requested == PrefixType::None {
            return Err(Error::Usage("prefix type must be specified (-T or -L)".into()));
        }
        let address = match opt.stellaris_address {
            Some(ref s) => {
                let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
                u32::from_str_radix(digits, 16).map_err(|_| {
                    Error::Usage("--stellaris-address must be a hex address".into())
                })?
            }
            None => 0,
        };

        file.load(SuffixReq::MaybeSuffix, PrefixReq::NoPrefix)?;
        file.prefix_type = requested;
        file.stellaris_address = address;
        info!("Adding prefix to {}", file.name);
        file.store(file.size.suffix != 0, true)?;
    } else if opt.check {
        file.load(SuffixReq::MaybeSuffix, PrefixReq::MaybePrefix)?;
        print!("{}", file.describe());
        if requested != PrefixType::None && file.prefix_type != requested {
            return Err(Error::Data("no prefix of the requested type".into()));
        }
    } else if opt.delete {
        file.load(SuffixReq::MaybeSuffix, PrefixReq::NeedsPrefix)?;
        if requested != PrefixType::None && file.prefix_type != requested {
            return Err(Error::Data("no prefix of the requested type".into()));
        }
        info!("Removing prefix from {}", file.name);
        // A suffix, if present, is rewritten over the new payload.
        file.store(file.size.suffix != 0, false)?;
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
