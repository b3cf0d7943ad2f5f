use byteorder::{ByteOrder, LE};
use log::{debug, info, warn};
use std::io::Write;

use crate::error::{Error, Result};
use crate::memory::{MemLayout, parse_memory_layout};
use crate::progress::Progress;
use crate::protocol::{self, ControlIo, DfuState, DfuStatus};

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;
const CMD_READ_UNPROTECT: u8 = 0x92;

/// DfuSe container signatures.
const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";

const DFUSE_PREFIX_LEN: usize = 11;
const TARGET_PREFIX_LEN: usize = 274;
const ELEMENT_HEADER_LEN: usize = 8;

/// First transaction number usable for data chunks; 0 and 1 are reserved
/// for special commands.
const FIRST_DATA_TRANSACTION: u16 = 2;

const MAX_POLL_ATTEMPTS: usize = 64;

/// Options given after the DfuSe address, colon-delimited.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DfuseOptions {
    pub address: Option<u32>,
    pub force: bool,
    pub leave: bool,
    pub mass_erase: bool,
    pub unprotect: bool,
    pub will_reset: bool,
    /// Upload length in bytes.
    pub length: Option<u32>,
}

impl DfuseOptions {
    /// Parse `<address>[:leave][:mass-erase][:unprotect][:will-reset]
    /// [:force][:<length>]`. The address may be empty, e.g.
    /// `:mass-erase:force`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut opts = DfuseOptions::default();
        let mut tokens = s.split(':');

        let first = tokens.next().unwrap_or("");
        if !first.is_empty() {
            opts.address = Some(parse_number(first).ok_or_else(|| {
                Error::Usage(format!("invalid DfuSe address: {first}"))
            })?);
        }

        for token in tokens {
            match token {
                "leave" => opts.leave = true,
                "mass-erase" => opts.mass_erase = true,
                "unprotect" => opts.unprotect = true,
                "will-reset" => opts.will_reset = true,
                "force" => opts.force = true,
                "" => {}
                other => {
                    opts.length = Some(parse_number(other).ok_or_else(|| {
                        Error::Usage(format!("invalid DfuSe modifier: {other}"))
                    })?);
                }
            }
        }

        if (opts.mass_erase || opts.unprotect) && !opts.force {
            return Err(Error::Usage(
                "mass-erase and unprotect require the force option".into(),
            ));
        }
        Ok(opts)
    }
}

fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// DfuSe special commands carried over DNLOAD with wValue 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetAddress(u32),
    ErasePage(u32),
    MassErase,
    ReadUnprotect,
}

/// One DfuSe session on an interface already at dfuIDLE. Owns the parsed
/// memory layout and the erase bookkeeping.
pub struct DfuseDevice<'a, T: ControlIo> {
    io: &'a mut T,
    layout: Option<MemLayout>,
    last_erased: Option<u32>,
    mass_erase_done: bool,
}

impl<'a, T: ControlIo> DfuseDevice<'a, T> {
    /// `alt_name` is the altsetting name string carrying the memory layout;
    /// operations that need the layout fail if it was absent or unparsable.
    pub fn new(io: &'a mut T, alt_name: Option<&str>) -> Self {
        let layout = alt_name.and_then(|name| match parse_memory_layout(name) {
            Ok(layout) => Some(layout),
            Err(e) => {
                warn!("could not parse memory layout: {e}");
                None
            }
        });
        Self {
            io,
            layout,
            last_erased: None,
            mass_erase_done: false,
        }
    }

    fn layout(&self) -> Result<&MemLayout> {
        self.layout.as_ref().ok_or_else(|| {
            Error::Data("device did not advertise a DfuSe memory layout".into())
        })
    }

    /// Execute one special command and return the interface to dfuIDLE.
    /// READ_UNPROTECT triggers a mass erase plus reset and returns right
    /// after the poll delay, without the confirmation round.
    pub fn special_command(&mut self, command: Command) -> Result<()> {
        let mut buf = [0u8; 5];
        let payload: &[u8] = match command {
            Command::SetAddress(address) => {
                debug!("setting address pointer to 0x{address:08x}");
                buf[0] = CMD_SET_ADDRESS;
                LE::write_u32(&mut buf[1..5], address);
                &buf[..5]
            }
            Command::ErasePage(address) => {
                let segment = self
                    .layout()?
                    .find_segment(address)
                    .filter(|s| s.erasable())
                    .ok_or_else(|| {
                        Error::Io(format!("page at 0x{address:08x} cannot be erased"))
                    })?;
                let page = address & !(segment.page_size - 1);
                debug!(
                    "erasing page of {} bytes at 0x{page:08x}",
                    segment.page_size
                );
                buf[0] = CMD_ERASE;
                LE::write_u32(&mut buf[1..5], address);
                self.last_erased = Some(address);
                &buf[..5]
            }
            Command::MassErase => {
                buf[0] = CMD_ERASE;
                &buf[..1]
            }
            Command::ReadUnprotect => {
                buf[0] = CMD_READ_UNPROTECT;
                &buf[..1]
            }
        };

        protocol::dnload(self.io, 0, payload)?;

        let status = match protocol::get_status(self.io) {
            Ok(status) => status,
            Err(e) if command == Command::ReadUnprotect => {
                // The device mass-erases and resets while this request is in
                // flight; a stalled pipe here is expected.
                warn!("device dropped off during read-unprotect ({e}); assuming success");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if status.state != DfuState::dfuDNBUSY {
            return Err(Error::Protocol(format!(
                "wrong state {:?} after special command download",
                status.state
            )));
        }
        protocol::wait_poll_timeout(&status, self.io.quirks());

        if command == Command::ReadUnprotect {
            return Ok(());
        }

        let status = protocol::get_status_polled(self.io)?;
        if status.status != DfuStatus::OK {
            return Err(Error::Protocol(format!(
                "special command not correctly executed: {:?} ({})",
                status.status,
                status.status.error_str()
            )));
        }

        protocol::abort(self.io)?;
        let status = protocol::get_status_polled(self.io)?;
        status.ensure_state(DfuState::dfuIDLE)?;
        Ok(())
    }

    /// Ensure every page intersecting `[address, address + length)` has been
    /// erased, skipping pages already covered by a previous erase or a mass
    /// erase.
    fn erase_range(&mut self, address: u32, length: u32) -> Result<()> {
        if self.mass_erase_done || length == 0 {
            return Ok(());
        }
        let end = address
            .checked_add(length - 1)
            .ok_or_else(|| Error::Data("element wraps the address space".into()))?;

        let mut at = address;
        loop {
            let segment = self
                .layout()?
                .find_segment(at)
                .filter(|s| s.erasable())
                .ok_or_else(|| Error::Io(format!("page at 0x{at:08x} cannot be erased")))?;
            let page_size = segment.page_size;
            let page = at & !(page_size - 1);

            if self.last_erased.map(|e| e & !(page_size - 1)) != Some(page) {
                self.special_command(Command::ErasePage(page))?;
            }

            match page.checked_add(page_size) {
                Some(next) if next <= end => at = next,
                _ => break,
            }
        }
        Ok(())
    }

    /// Erase the target range, set the address pointer, and stream `data`
    /// in `xfer_size` chunks with rolling transaction numbers.
    fn dnload_element(
        &mut self,
        address: u32,
        data: &[u8],
        xfer_size: usize,
        progress: &mut impl Progress,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = address
            .checked_add(data.len() as u32 - 1)
            .ok_or_else(|| Error::Data("element wraps the address space".into()))?;

        // Refuse before the first erase or write touches the device.
        for probe in [address, end] {
            self.layout()?
                .find_segment(probe)
                .filter(|s| s.writeable())
                .ok_or_else(|| {
                    Error::Io(format!("segment at 0x{probe:08x} is not writeable"))
                })?;
        }

        info!(
            "Downloading element to address 0x{address:08x}, size {}",
            data.len()
        );
        self.erase_range(address, data.len() as u32)?;
        self.special_command(Command::SetAddress(address))?;

        let mut transaction = FIRST_DATA_TRANSACTION;
        for (i, chunk) in data.chunks(xfer_size).enumerate() {
            let chunk_addr = address + (i * xfer_size) as u32;
            self.layout()?
                .find_segment(chunk_addr)
                .filter(|s| s.writeable())
                .ok_or_else(|| {
                    Error::Io(format!("segment at 0x{chunk_addr:08x} is not writeable"))
                })?;

            self.dnload_chunk(chunk, transaction)?;
            progress.advance(chunk.len() as u64);
            transaction = transaction.checked_add(1).ok_or_else(|| {
                Error::Protocol("element overflowed the 16-bit transaction number".into())
            })?;
        }
        Ok(())
    }

    /// Send one data chunk and poll it through dfuDNBUSY.
    fn dnload_chunk(&mut self, data: &[u8], transaction: u16) -> Result<usize> {
        let sent = protocol::dnload(self.io, transaction, data)?;

        let mut status;
        let mut attempts = 0;
        loop {
            status = protocol::get_status_polled(self.io)?;
            if status.state != DfuState::dfuDNBUSY {
                break;
            }
            attempts += 1;
            if attempts >= MAX_POLL_ATTEMPTS {
                return Err(Error::Protocol("device stayed busy after chunk".into()));
            }
        }
        status.ensure_ok()?;
        Ok(sent)
    }

    /// Raw binary download of the whole payload to `address`.
    pub fn do_bin_dnload(
        &mut self,
        xfer_size: usize,
        data: &[u8],
        address: u32,
        progress: &mut impl Progress,
    ) -> Result<u64> {
        progress.start_task(Some(data.len() as u64));
        self.dnload_element(address, data, xfer_size, progress)?;
        progress.finish();
        Ok(data.len() as u64)
    }

    /// Download a DfuSe container: verify the prefix, walk its targets, and
    /// write every element of targets matching `altsetting`.
    pub fn do_dfuse_dnload(
        &mut self,
        xfer_size: usize,
        image: &[u8],
        altsetting: u8,
        progress: &mut impl Progress,
    ) -> Result<u64> {
        if image.len() < DFUSE_PREFIX_LEN || &image[..5] != DFUSE_SIGNATURE {
            return Err(Error::Data("no valid DfuSe signature".into()));
        }
        if image[5] != 0x01 {
            return Err(Error::Data(format!(
                "unsupported DfuSe file version 0x{:02x}",
                image[5]
            )));
        }
        let targets = image[10];
        debug!("DfuSe container: image size {}, {} targets", LE::read_u32(&image[6..10]), targets);

        progress.start_task(Some(image.len() as u64));

        let mut at = DFUSE_PREFIX_LEN;
        let mut written: u64 = 0;
        for _ in 0..targets {
            let prefix = image
                .get(at..at + TARGET_PREFIX_LEN)
                .ok_or_else(|| Error::Data("truncated DfuSe target prefix".into()))?;
            if &prefix[..6] != TARGET_SIGNATURE {
                return Err(Error::Data("no valid target signature".into()));
            }
            let target_alt = prefix[6];
            let named = LE::read_u32(&prefix[7..11]);
            let target_size = LE::read_u32(&prefix[266..270]) as usize;
            let elements = LE::read_u32(&prefix[270..274]);
            at += TARGET_PREFIX_LEN;

            let name = if named != 0 {
                let raw = &prefix[11..266];
                let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                String::from_utf8_lossy(&raw[..len]).into_owned()
            } else {
                String::new()
            };

            let matches = named == 0 || target_alt == altsetting;
            if !matches {
                info!("Skipping target \"{name}\" (altsetting {target_alt})");
                at = at
                    .checked_add(target_size)
                    .filter(|&end| end <= image.len())
                    .ok_or_else(|| Error::Data("truncated DfuSe target".into()))?;
                continue;
            }
            info!("Downloading target \"{name}\" ({elements} elements, altsetting {target_alt})");

            let target_end = at
                .checked_add(target_size)
                .filter(|&end| end <= image.len())
                .ok_or_else(|| Error::Data("truncated DfuSe target".into()))?;

            for _ in 0..elements {
                let header = image
                    .get(at..at + ELEMENT_HEADER_LEN)
                    .filter(|_| at + ELEMENT_HEADER_LEN <= target_end)
                    .ok_or_else(|| Error::Data("truncated DfuSe element header".into()))?;
                let address = LE::read_u32(&header[0..4]);
                let size = LE::read_u32(&header[4..8]) as usize;
                at += ELEMENT_HEADER_LEN;

                let data = image
                    .get(at..at + size)
                    .filter(|_| at + size <= target_end)
                    .ok_or_else(|| Error::Data("truncated DfuSe element payload".into()))?;
                at += size;

                self.dnload_element(address, data, xfer_size, progress)?;
                written += size as u64;
            }
            at = target_end;
        }

        progress.finish();
        Ok(written)
    }

    /// Route a DfuSe download per the user's options: unprotect and
    /// mass-erase short-circuit, a raw address takes the binary path, and
    /// anything else must be a DfuSe container.
    pub fn do_dnload(
        &mut self,
        xfer_size: usize,
        file: &crate::dfu_file::DfuFile,
        altsetting: u8,
        opts: &DfuseOptions,
        progress: &mut impl Progress,
    ) -> Result<u64> {
        if opts.unprotect {
            self.special_command(Command::ReadUnprotect)?;
            info!("Read unprotect command sent; device resets and erases itself");
            return Ok(0);
        }
        if opts.mass_erase {
            info!("Performing mass erase, this can take a moment");
            self.special_command(Command::MassErase)?;
            self.mass_erase_done = true;
        }

        let written = if let Some(address) = opts.address {
            self.do_bin_dnload(xfer_size, file.payload(), address, progress)?
        } else {
            if file.bcd_dfu != 0x011a {
                return Err(Error::Data(format!(
                    "only DfuSe file version 1.1a is supported for container downloads \
                     (file is 0x{:04x})",
                    file.bcd_dfu
                )));
            }
            self.do_dfuse_dnload(xfer_size, file.payload(), altsetting, progress)?
        };

        if opts.leave {
            let address = opts.address.unwrap_or(0);
            self.leave(address, opts.will_reset)?;
        }
        Ok(written)
    }

    /// Jump the device to the application: set the address pointer, then a
    /// zero-length download followed by the manifestation poll.
    pub fn leave(&mut self, address: u32, will_reset: bool) -> Result<()> {
        self.special_command(Command::SetAddress(address))?;
        protocol::dnload(self.io, FIRST_DATA_TRANSACTION, &[])?;

        match protocol::get_status_polled(self.io) {
            Ok(status) => {
                debug!("leave: state {:?}", status.state);
                match status.state {
                    DfuState::dfuMANIFEST
                    | DfuState::dfuMANIFEST_SYNC
                    | DfuState::dfuMANIFEST_WAIT_RESET
                    | DfuState::dfuIDLE
                    | DfuState::dfuDNLOAD_IDLE => Ok(()),
                    other => Err(Error::Protocol(format!(
                        "unexpected state {other:?} while leaving DFU mode"
                    ))),
                }
            }
            Err(e) if will_reset => {
                info!("device reset while leaving DFU mode ({e})");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Upload device memory to `sink`. With an address, the window starts
    /// there; `length` bounds it (otherwise the device ends the stream with
    /// a short block).
    pub fn do_upload(
        &mut self,
        xfer_size: usize,
        sink: &mut impl Write,
        opts: &DfuseOptions,
        progress: &mut impl Progress,
    ) -> Result<u64> {
        if xfer_size == 0 {
            return Err(Error::Usage("transfer size must be specified".into()));
        }

        if let Some(address) = opts.address {
            if !opts.force {
                self.layout()?
                    .find_segment(address)
                    .filter(|s| s.readable())
                    .ok_or_else(|| {
                        Error::Io(format!("segment at 0x{address:08x} is not readable"))
                    })?;
            }
            self.special_command(Command::SetAddress(address))?;
        }

        progress.start_task(opts.length.map(u64::from));

        let mut buf = vec![0u8; xfer_size];
        let mut transaction = FIRST_DATA_TRANSACTION;
        let mut total: u64 = 0;

        loop {
            let request = match opts.length {
                Some(limit) => {
                    let remaining = limit as u64 - total;
                    if remaining == 0 {
                        break;
                    }
                    (remaining as usize).min(xfer_size)
                }
                None => xfer_size,
            };

            let len = protocol::upload(self.io, transaction, &mut buf[..request])?;
            sink.write_all(&buf[..len])?;
            total += len as u64;
            progress.advance(len as u64);

            if len < request {
                break;
            }
            transaction = transaction.checked_add(1).ok_or_else(|| {
                Error::Protocol("upload overflowed the 16-bit transaction number".into())
            })?;
        }

        progress.finish();
        info!("Received a total of {total} bytes");

        // Return to idle so the session can keep using the interface.
        protocol::abort(self.io)?;
        let status = protocol::get_status_polled(self.io)?;
        status.ensure_state(DfuState::dfuIDLE)?;
        Ok(total)
    }
}
