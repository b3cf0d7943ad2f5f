use log::{debug, info, warn};
use std::fmt::Display;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{self, ControlIo, DfuRequest, DfuState};
use crate::quirks::Quirks;

/// DFU interfaces advertise class 0xFE, subclass 0x01; the protocol byte
/// separates run-time (1) from DFU mode (2).
const USB_CLASS_APP_SPECIFIC: u8 = 0xfe;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

/// DFU functional descriptor type (DFU 1.1 table 4.2).
pub const USB_DT_DFU: u8 = 0x21;
const USB_DT_DFU_SIZE: usize = 9;

const GET_DESCRIPTOR: u8 = 0x06;

/// bmAttributes bits of the functional descriptor.
pub const ATTR_CAN_DOWNLOAD: u8 = 1 << 0;
pub const ATTR_CAN_UPLOAD: u8 = 1 << 1;
pub const ATTR_MANIFEST_TOLERANT: u8 = 1 << 2;
pub const ATTR_WILL_DETACH: u8 = 1 << 3;

/// Run-time or DFU (bootloader) incarnation of an interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Runtime,
    Dfu,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Mode::Runtime => write!(f, "Runtime"),
            Mode::Dfu => write!(f, "DFU"),
        }
    }
}

/// Which of the user's filters an interface satisfied, plus the DFU-mode
/// bit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IfFlags(u16);

impl IfFlags {
    pub const DFU: IfFlags = IfFlags(0x0001);
    pub const VENDOR: IfFlags = IfFlags(0x0100);
    pub const PRODUCT: IfFlags = IfFlags(0x0200);
    pub const CONFIG: IfFlags = IfFlags(0x0400);
    pub const IFACE: IfFlags = IfFlags(0x0800);
    pub const ALT: IfFlags = IfFlags(0x1000);
    pub const DEVNUM: IfFlags = IfFlags(0x2000);
    pub const PATH: IfFlags = IfFlags(0x4000);
    pub const SERIAL: IfFlags = IfFlags(0x8000);

    pub fn set(&mut self, other: IfFlags) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: IfFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Parsed DFU functional descriptor.
#[derive(Copy, Clone, Debug, Default)]
pub struct FuncDescriptor {
    pub b_length: u8,
    pub bm_attributes: u8,
    pub w_detach_timeout: u16,
    pub w_transfer_size: u16,
    pub bcd_dfu_version: u16,
}

impl FuncDescriptor {
    /// Parse from raw descriptor bytes. A 7-byte descriptor predates the
    /// bcdDFUVersion field and is taken as DFU 1.0.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 7 || raw[1] != USB_DT_DFU {
            return None;
        }
        let mut func = FuncDescriptor {
            b_length: raw[0],
            bm_attributes: raw[2],
            w_detach_timeout: u16::from_le_bytes([raw[3], raw[4]]),
            w_transfer_size: u16::from_le_bytes([raw[5], raw[6]]),
            bcd_dfu_version: 0x0100,
        };
        if raw.len() >= USB_DT_DFU_SIZE && func.b_length >= USB_DT_DFU_SIZE as u8 {
            func.bcd_dfu_version = u16::from_le_bytes([raw[7], raw[8]]);
        } else {
            info!("deducing DFU version 1.0 from descriptor length");
        }
        Some(func)
    }

    pub fn will_detach(&self) -> bool {
        self.bm_attributes & ATTR_WILL_DETACH != 0
    }

    pub fn manifest_tolerant(&self) -> bool {
        self.bm_attributes & ATTR_MANIFEST_TOLERANT != 0
    }

    pub fn can_upload(&self) -> bool {
        self.bm_attributes & ATTR_CAN_UPLOAD != 0
    }

    pub fn can_download(&self) -> bool {
        self.bm_attributes & ATTR_CAN_DOWNLOAD != 0
    }
}

/// User-supplied selection filters. All present filters must match; the
/// `*_dfu` variants apply to interfaces already in DFU mode.
#[derive(Clone, Debug, Default)]
pub struct MatchSpec {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub vendor_dfu: Option<u16>,
    pub product_dfu: Option<u16>,
    pub path: Option<String>,
    pub config: Option<u8>,
    pub interface: Option<u8>,
    pub alt_index: Option<u8>,
    pub alt_name: Option<String>,
    pub serial: Option<String>,
    pub serial_dfu: Option<String>,
    pub devnum: Option<u8>,
    /// Set after a detach so only the DFU-mode incarnation can match.
    pub dfu_mode_only: bool,
}

impl MatchSpec {
    fn ids_for(&self, mode: Mode) -> (Option<u16>, Option<u16>) {
        match mode {
            Mode::Dfu if self.vendor_dfu.is_some() || self.product_dfu.is_some() => {
                (self.vendor_dfu, self.product_dfu)
            }
            _ => (self.vendor, self.product),
        }
    }

    fn serial_for(&self, mode: Mode) -> Option<&String> {
        match mode {
            Mode::Dfu => self.serial_dfu.as_ref().or(self.serial.as_ref()),
            Mode::Runtime => self.serial.as_ref(),
        }
    }
}

/// One DFU-capable interface/altsetting found by enumeration. Plain data;
/// the USB handle is re-resolved by bus and device address when the
/// interface is opened.
#[derive(Clone, Debug)]
pub struct DfuIf {
    pub vendor: u16,
    pub product: u16,
    pub bcd_device: u16,
    pub configuration: u8,
    pub interface: u8,
    pub altsetting: u8,
    pub alt_name: Option<String>,
    pub serial: Option<String>,
    pub bus: u8,
    pub devnum: u8,
    pub path: String,
    pub mode: Mode,
    pub flags: IfFlags,
    pub quirks: Quirks,
    pub func_dfu: FuncDescriptor,
    pub max_packet_size0: u8,
}

impl DfuIf {
    pub fn is_dfu_mode(&self) -> bool {
        self.mode == Mode::Dfu
    }

    /// The `--list` line for this interface.
    pub fn describe(&self) -> String {
        format!(
            "Found {}: [{:04x}:{:04x}] ver={:04x}, devnum={}, cfg={}, intf={}, path=\"{}\", \
             alt={}, name=\"{}\", serial=\"{}\"",
            self.mode,
            self.vendor,
            self.product,
            self.bcd_device,
            self.devnum,
            self.configuration,
            self.interface,
            self.path,
            self.altsetting,
            self.alt_name.as_deref().unwrap_or("UNKNOWN"),
            self.serial.as_deref().unwrap_or("UNKNOWN"),
        )
    }
}

/// Look for a descriptor of `desc_type` in a concatenated descriptor list.
fn find_descriptor(desc_list: &[u8], desc_type: u8) -> Option<&[u8]> {
    let mut p = 0;
    while p + 1 < desc_list.len() {
        let len = desc_list[p] as usize;
        if len == 0 {
            warn!("invalid descriptor list");
            return None;
        }
        if desc_list[p + 1] == desc_type {
            let end = (p + len).min(desc_list.len());
            return Some(&desc_list[p..end]);
        }
        p += len;
    }
    None
}

fn bcd(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8) | ((version.minor() as u16) << 4) | version.sub_minor() as u16
}

fn device_path<T: rusb::UsbContext>(device: &rusb::Device<T>) -> String {
    let mut path = format!("{}", device.bus_number());
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let mut sep = '-';
            for port in ports {
                path.push(sep);
                path.push_str(&port.to_string());
                sep = '.';
            }
        }
        _ => {
            path.push('-');
            path.push_str(&device.address().to_string());
        }
    }
    path
}

/// Walk the USB tree and collect every DFU-capable interface/altsetting
/// passing the filters in `spec`.
pub fn probe_devices(spec: &MatchSpec) -> Result<Vec<DfuIf>> {
    let devices = rusb::devices().map_err(|e| Error::usb(e, "enumerating USB devices"))?;
    let mut found = Vec::new();

    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        let path = device_path(&device);

        if let Some(ref want) = spec.path {
            if &path != want {
                continue;
            }
        }
        if let Some(devnum) = spec.devnum {
            if device.address() != devnum {
                continue;
            }
        }

        // Strings need an open handle; devices we cannot open are still
        // listed, just without names.
        let handle = device.open().ok();
        let serial = handle.as_ref().and_then(|h| {
            desc.serial_number_string_index()
                .and_then(|idx| h.read_string_descriptor_ascii(idx).ok())
        });

        for cfg_index in 0..desc.num_configurations() {
            let config = match device.config_descriptor(cfg_index) {
                Ok(config) => config,
                Err(_) => continue,
            };
            if let Some(want) = spec.config {
                if config.number() != want {
                    continue;
                }
            }

            for interface in config.interfaces() {
                for alt in interface.descriptors() {
                    if alt.class_code() != USB_CLASS_APP_SPECIFIC
                        || alt.sub_class_code() != USB_SUBCLASS_DFU
                    {
                        continue;
                    }
                    let mode = if alt.protocol_code() == USB_PROTOCOL_DFU_MODE {
                        Mode::Dfu
                    } else {
                        Mode::Runtime
                    };
                    if spec.dfu_mode_only && mode != Mode::Dfu {
                        continue;
                    }

                    let mut flags = IfFlags::default();
                    if mode == Mode::Dfu {
                        flags.set(IfFlags::DFU);
                    }
                    if spec.path.is_some() {
                        flags.set(IfFlags::PATH);
                    }
                    if spec.devnum.is_some() {
                        flags.set(IfFlags::DEVNUM);
                    }
                    if spec.config.is_some() {
                        flags.set(IfFlags::CONFIG);
                    }

                    let (want_vendor, want_product) = spec.ids_for(mode);
                    if let Some(vendor) = want_vendor {
                        if desc.vendor_id() != vendor {
                            continue;
                        }
                        flags.set(IfFlags::VENDOR);
                    }
                    if let Some(product) = want_product {
                        if desc.product_id() != product {
                            continue;
                        }
                        flags.set(IfFlags::PRODUCT);
                    }
                    if let Some(want) = spec.interface {
                        if alt.interface_number() != want {
                            continue;
                        }
                        flags.set(IfFlags::IFACE);
                    }

                    let alt_name = handle.as_ref().and_then(|h| {
                        alt.description_string_index()
                            .and_then(|idx| h.read_string_descriptor_ascii(idx).ok())
                    });

                    if let Some(want) = spec.alt_index {
                        if alt.setting_number() != want {
                            continue;
                        }
                        flags.set(IfFlags::ALT);
                    }
                    if let Some(ref want) = spec.alt_name {
                        if alt_name.as_deref() != Some(want.as_str()) {
                            continue;
                        }
                        flags.set(IfFlags::ALT);
                    }
                    if let Some(want) = spec.serial_for(mode) {
                        if serial.as_ref() != Some(want) {
                            continue;
                        }
                        flags.set(IfFlags::SERIAL);
                    }

                    let mut func_dfu = discover_func_descriptor(&alt, &config, handle.as_ref());
                    let bcd_device = bcd(desc.device_version());
                    let quirks = Quirks::detect(desc.vendor_id(), desc.product_id(), bcd_device);
                    if quirks.contains(Quirks::FORCE_DFU11) {
                        func_dfu.bcd_dfu_version = 0x0110;
                    }

                    found.push(DfuIf {
                        vendor: desc.vendor_id(),
                        product: desc.product_id(),
                        bcd_device,
                        configuration: config.number(),
                        interface: alt.interface_number(),
                        altsetting: alt.setting_number(),
                        alt_name,
                        serial: serial.clone(),
                        bus: device.bus_number(),
                        devnum: device.address(),
                        path: path.clone(),
                        mode,
                        flags,
                        quirks,
                        func_dfu,
                        max_packet_size0: desc.max_packet_size(),
                    });
                }
            }
        }
    }
    Ok(found)
}

/// Take the functional descriptor from the altsetting's cached extra bytes,
/// falling back to the configuration's, and finally to a direct
/// GET_DESCRIPTOR request. Some devices carry none at all; those get a
/// DFU 1.0 default with unknown transfer size.
fn discover_func_descriptor<T: rusb::UsbContext>(
    alt: &rusb::InterfaceDescriptor,
    config: &rusb::ConfigDescriptor,
    handle: Option<&rusb::DeviceHandle<T>>,
) -> FuncDescriptor {
    if let Some(func) = find_descriptor(alt.extra(), USB_DT_DFU).and_then(FuncDescriptor::from_bytes)
    {
        return func;
    }
    if let Some(func) =
        find_descriptor(config.extra(), USB_DT_DFU).and_then(FuncDescriptor::from_bytes)
    {
        debug!("found DFU functional descriptor in configuration descriptor");
        return func;
    }

    if let Some(handle) = handle {
        let mut raw = [0u8; USB_DT_DFU_SIZE];
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Standard,
            rusb::Recipient::Device,
        );
        if let Ok(len) = handle.read_control(
            request_type,
            GET_DESCRIPTOR,
            (USB_DT_DFU as u16) << 8,
            0,
            &mut raw,
            protocol::DFU_TIMEOUT,
        ) {
            if let Some(func) = FuncDescriptor::from_bytes(&raw[..len]) {
                debug!("read DFU functional descriptor directly from device");
                return func;
            }
        }
    }

    warn!("no DFU functional descriptor found, assuming DFU 1.0");
    warn!("transfer size can not be detected");
    FuncDescriptor {
        b_length: 7,
        bcd_dfu_version: 0x0100,
        ..Default::default()
    }
}

/// Group check used before anything touches the bus: more than one physical
/// device with matching DFU interfaces cannot be supported, since the bus
/// reset during detach renumbers devices.
pub fn ensure_unambiguous(interfaces: &[DfuIf]) -> Result<()> {
    let mut devices: Vec<(u8, u8)> = interfaces.iter().map(|i| (i.bus, i.devnum)).collect();
    devices.sort_unstable();
    devices.dedup();
    match devices.len() {
        0 => Err(Error::Io("no DFU capable USB device available".into())),
        1 => Ok(()),
        n => Err(Error::Compatibility(format!(
            "more than one DFU capable USB device found ({n} devices); \
             try `--list' and specify the serial number, or disconnect all but one device",
        ))),
    }
}

/// An opened, claimed DFU interface: the [ControlIo] endpoint everything
/// above the transport speaks to.
pub struct OpenDfuIf {
    desc: DfuIf,
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    timeout: Duration,
    claimed: bool,
}

impl OpenDfuIf {
    /// Re-resolve the enumerated record to a live handle and claim the
    /// interface. `select_alt` also selects the record's altsetting.
    pub fn open(desc: &DfuIf, select_alt: bool) -> Result<Self> {
        let devices = rusb::devices().map_err(|e| Error::usb(e, "enumerating USB devices"))?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == desc.bus && d.address() == desc.devnum)
            .ok_or_else(|| Error::Io("cannot re-open device: it is gone".into()))?;
        let mut handle = device
            .open()
            .map_err(|e| Error::usb(e, "opening device"))?;

        // Best effort; unsupported on most non-Linux platforms.
        let _ = handle.set_auto_detach_kernel_driver(true);

        info!("Claiming USB DFU interface {}", desc.interface);
        handle
            .claim_interface(desc.interface)
            .map_err(|e| Error::usb(e, "claiming interface"))?;

        let mut open = OpenDfuIf {
            desc: desc.clone(),
            handle,
            timeout: protocol::DFU_TIMEOUT,
            claimed: true,
        };
        if select_alt {
            open.set_altsetting(desc.altsetting)?;
        }
        Ok(open)
    }

    pub fn desc(&self) -> &DfuIf {
        &self.desc
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_altsetting(&mut self, altsetting: u8) -> Result<()> {
        debug!("setting altsetting {altsetting} on interface {}", self.desc.interface);
        self.handle
            .set_alternate_setting(self.desc.interface, altsetting)
            .map_err(|e| Error::usb(e, "selecting altsetting"))
    }

    /// Issue a USB bus reset, e.g. after DETACH for devices that do not
    /// detach themselves, or to return to run-time mode after an operation.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting USB device");
        match self.handle.reset() {
            Ok(()) | Err(rusb::Error::NotFound) => Ok(()),
            Err(e) => Err(Error::usb(e, "resetting device")),
        }
    }

    pub fn release(&mut self) {
        if self.claimed {
            if let Err(e) = self.handle.release_interface(self.desc.interface) {
                debug!("releasing interface: {e}");
            }
            self.claimed = false;
        }
    }
}

impl Drop for OpenDfuIf {
    fn drop(&mut self) {
        self.release();
    }
}

impl ControlIo for OpenDfuIf {
    fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        );
        self.handle
            .read_control(
                request_type,
                request as u8,
                value,
                self.desc.interface as u16,
                buf,
                self.timeout,
            )
            .map_err(|e| Error::usb(e, "during class IN request"))
    }

    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Class,
            rusb::Recipient::Interface,
        );
        self.handle
            .write_control(
                request_type,
                request as u8,
                value,
                self.desc.interface as u16,
                data,
                self.timeout,
            )
            .map_err(|e| Error::usb(e, "during class OUT request"))
    }

    fn quirks(&self) -> Quirks {
        self.desc.quirks
    }
}

/// Kick a run-time interface into DFU mode: altsetting zero, status check,
/// DETACH, and a bus reset for devices that do not detach on their own.
/// The handle is released on return; the caller re-probes after
/// `detach_delay`.
pub fn detach_to_dfu_mode(desc: &DfuIf) -> Result<()> {
    let mut open = OpenDfuIf::open(desc, false)?;
    open.set_altsetting(0)?;

    info!("Determining device status");
    let status = protocol::get_status_polled(&mut open)?;
    info!(
        "state = {:?}, status = {:?}",
        status.state, status.status
    );

    match status.state {
        DfuState::appIDLE | DfuState::appDETACH => {
            info!("Device really in run-time mode, sending DFU detach request");
            protocol::detach(&mut open, 1000)?;

            if desc.func_dfu.will_detach() {
                info!("Device will detach and reattach on its own");
            } else {
                open.reset()?;
            }
        }
        DfuState::dfuERROR => {
            info!("dfuERROR, clearing status");
            protocol::clear_status(&mut open)?;
        }
        other => {
            warn!("run-time device already in DFU state {other:?}?");
        }
    }

    open.release();
    Ok(())
}

/// Pick the transfer size for a session: the user's override wins, then the
/// device's advertisement; neither is a usage error. The result is clamped
/// to the platform limit and raised to the control endpoint's packet size.
pub fn resolve_transfer_size(
    func: &FuncDescriptor,
    user_override: Option<usize>,
    max_packet_size0: u8,
) -> Result<usize> {
    let mut size = match user_override {
        Some(size) => {
            if func.w_transfer_size != 0 && func.w_transfer_size as usize != size {
                warn!(
                    "overriding device-reported transfer size {} with {size}",
                    func.w_transfer_size
                );
            }
            size
        }
        None => {
            let advertised = func.w_transfer_size as usize;
            if advertised == 0 {
                return Err(Error::Usage(
                    "transfer size must be specified with -t when the device does not \
                     advertise one"
                        .into(),
                ));
            }
            info!("Device returned transfer size {advertised}");
            advertised
        }
    };

    // usbdevio limits one control transfer to a page.
    if cfg!(target_os = "linux") && size > 4096 {
        size = 4096;
        info!("Limited transfer size to {size}");
    }
    if size < max_packet_size0 as usize {
        size = max_packet_size0 as usize;
        info!("Adjusted transfer size to {size}");
    }
    Ok(size)
}
