use byteorder::{LE, ReadBytesExt};
use log::{info, warn};
use num_enum::TryFromPrimitive;
use std::convert::TryFrom;
use std::thread::sleep;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::quirks::{DEFAULT_POLL_TIMEOUT_MS, Quirks};

/// Default timeout for a single control transfer, distinct from the
/// device-reported poll timeout honored between requests.
pub const DFU_TIMEOUT: Duration = Duration::from_millis(5000);

/// Iteration bound for the idle-entry loop, so a misbehaving device cannot
/// keep the host spinning.
const MAX_IDLE_ATTEMPTS: usize = 16;

/// DFU class requests, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[allow(non_camel_case_types)] // Names from DFU spec
#[derive(Copy, Clone, Debug)]
pub enum DfuRequest {
    DFU_DETACH = 0,
    DFU_DNLOAD = 1,
    DFU_UPLOAD = 2,
    DFU_GETSTATUS = 3,
    DFU_CLRSTATUS = 4,
    DFU_GETSTATE = 5,
    DFU_ABORT = 6,
}

/// The one seam between the DFU engine and the USB stack: class control
/// transfers addressed to the selected interface. Implemented over a real
/// device handle by [DfuIf](crate::device::DfuIf) and by scripted fakes in
/// tests.
pub trait ControlIo {
    /// Class IN transfer; returns the number of bytes the device produced.
    fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize>;

    /// Class OUT transfer; returns the number of bytes accepted.
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<usize>;

    /// Deviations detected for this device, consulted for poll timing.
    fn quirks(&self) -> Quirks {
        Quirks::NONE
    }
}

/// Status codes a DFU device can return, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuStatus {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
}

impl DfuStatus {
    pub fn error_str(&self) -> &'static str {
        use DfuStatus::*;
        match self {
            OK => "No error condition is present.",
            errTARGET => "File is not targeted for use by this device.",
            errFILE => "File is for this device but fails some vendor-specific verification test.",
            errWRITE => "Device is unable to write memory.",
            errERASE => "Memory erase function failed.",
            errCHECK_ERASED => "Memory erase check failed.",
            errPROG => "Program memory function failed.",
            errVERIFY => "Programmed memory failed verification.",
            errADDRESS => "Cannot program memory due to received address that is out of range.",
            errNOTDONE => {
                "Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
            }
            errFIRMWARE => {
                "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations."
            }
            errVENDOR => "iString indicates a vendor-specific error.",
            errUSBR => "Device detected unexpected USB reset signaling.",
            errPOR => "Device detected unexpected power on reset.",
            errUNKNOWN => "Something went wrong, but the device does not know what it was.",
            errSTALLEDPKT => "Device stalled an unexpected request.",
        }
    }
}

/// States a DFU device can be in, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuState {
    appIDLE = 0,
    appDETACH = 1,
    dfuIDLE = 2,
    dfuDNLOAD_SYNC = 3,
    dfuDNBUSY = 4,
    dfuDNLOAD_IDLE = 5,
    dfuMANIFEST_SYNC = 6,
    dfuMANIFEST = 7,
    dfuMANIFEST_WAIT_RESET = 8,
    dfuUPLOAD_IDLE = 9,
    dfuERROR = 10,
}

/// Parsed 6-byte response to DFU_GETSTATUS.
#[derive(Copy, Clone, Debug)]
pub struct DfuStatusResult {
    pub status: DfuStatus,
    /// Device-mandated delay before the next GET_STATUS, in milliseconds.
    /// 24 bits on the wire.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatusResult {
    pub fn from_bytes(raw: &[u8; 6]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(raw);
        let status = cursor.read_u8().unwrap();
        let status = DfuStatus::try_from(status)
            .map_err(|e| Error::Protocol(format!("device reported unknown status {}", e.number)))?;
        let poll_timeout = cursor.read_u24::<LE>().unwrap();
        let state = cursor.read_u8().unwrap();
        let state = DfuState::try_from(state)
            .map_err(|e| Error::Protocol(format!("device reported unknown state {}", e.number)))?;
        let string_index = cursor.read_u8().unwrap();
        Ok(Self {
            status,
            poll_timeout,
            state,
            string_index,
        })
    }

    pub fn ensure_ok(&self) -> Result<()> {
        if self.status != DfuStatus::OK {
            Err(Error::Protocol(format!(
                "device reported an error: {:?} ({})",
                self.status,
                self.status.error_str()
            )))
        } else {
            Ok(())
        }
    }

    pub fn ensure_state(&self, expected: DfuState) -> Result<()> {
        if self.state != expected {
            Err(Error::Protocol(format!(
                "device entered unexpected state: expected {:?}, got {:?}",
                expected, self.state
            )))
        } else {
            Ok(())
        }
    }
}

/// Ask the device to leave run-time mode within `timeout_ms` milliseconds.
pub fn detach(io: &mut impl ControlIo, timeout_ms: u16) -> Result<()> {
    io.control_out(DfuRequest::DFU_DETACH, timeout_ms, &[])?;
    Ok(())
}

/// Send one firmware block. An empty `data` is the terminal block that
/// triggers manifestation.
pub fn dnload(io: &mut impl ControlIo, block_num: u16, data: &[u8]) -> Result<usize> {
    io.control_out(DfuRequest::DFU_DNLOAD, block_num, data)
}

/// Read one firmware block into `buf`; the device signals the last block by
/// returning fewer bytes than requested.
pub fn upload(io: &mut impl ControlIo, block_num: u16, buf: &mut [u8]) -> Result<usize> {
    io.control_in(DfuRequest::DFU_UPLOAD, block_num, buf)
}

pub fn get_status(io: &mut impl ControlIo) -> Result<DfuStatusResult> {
    let mut raw = [0u8; 6];
    let len = io.control_in(DfuRequest::DFU_GETSTATUS, 0, &mut raw)?;
    if len < 6 {
        return Err(Error::Protocol(format!(
            "short GET_STATUS response: {len} bytes"
        )));
    }
    DfuStatusResult::from_bytes(&raw)
}

pub fn clear_status(io: &mut impl ControlIo) -> Result<()> {
    io.control_out(DfuRequest::DFU_CLRSTATUS, 0, &[])?;
    Ok(())
}

pub fn get_state(io: &mut impl ControlIo) -> Result<DfuState> {
    let mut raw = [0u8; 1];
    let len = io.control_in(DfuRequest::DFU_GETSTATE, 0, &mut raw)?;
    if len < 1 {
        return Err(Error::Protocol("empty GET_STATE response".into()));
    }
    DfuState::try_from(raw[0])
        .map_err(|e| Error::Protocol(format!("device reported unknown state {}", e.number)))
}

pub fn abort(io: &mut impl ControlIo) -> Result<()> {
    io.control_out(DfuRequest::DFU_ABORT, 0, &[])?;
    Ok(())
}

/// Honor the device-mandated delay before the next status-generating
/// request. Devices with the POLL_TIMEOUT quirk report garbage, so a small
/// fixed delay is used instead.
pub fn wait_poll_timeout(status: &DfuStatusResult, quirks: Quirks) {
    let ms = if quirks.contains(Quirks::POLL_TIMEOUT) {
        DEFAULT_POLL_TIMEOUT_MS
    } else {
        status.poll_timeout
    };
    if ms > 0 {
        sleep(Duration::from_millis(ms as u64));
    }
}

/// GET_STATUS followed by the mandated inter-poll delay.
pub fn get_status_polled(io: &mut impl ControlIo) -> Result<DfuStatusResult> {
    let status = get_status(io)?;
    wait_poll_timeout(&status, io.quirks());
    Ok(status)
}

/// Bring the interface to [dfuIDLE](DfuState::dfuIDLE), recovering error and
/// stale-transfer states on the way. States that are part of an active
/// download flow (dfuDNBUSY, the manifest states) are returned as-is so
/// callers can use them for flow control.
pub fn ensure_idle(io: &mut impl ControlIo) -> Result<DfuStatusResult> {
    use DfuState::*;

    let mut status;
    let mut attempts = 0;
    loop {
        if attempts >= MAX_IDLE_ATTEMPTS {
            return Err(Error::Protocol(
                "device did not reach dfuIDLE after repeated recovery attempts".into(),
            ));
        }
        attempts += 1;

        status = get_status_polled(io)?;
        match status.state {
            appIDLE | appDETACH => {
                return Err(Error::Protocol("device still in run-time mode".into()));
            }
            dfuERROR => {
                info!(
                    "device in error state, status = {:?} ({}); clearing",
                    status.status,
                    status.status.error_str()
                );
                clear_status(io)?;
                continue;
            }
            dfuDNLOAD_IDLE | dfuUPLOAD_IDLE => {
                warn!(
                    "aborting previous incomplete transfer, state = {:?}",
                    status.state
                );
                abort(io)?;
                continue;
            }
            dfuIDLE => break,
            _ => break,
        }
    }

    if status.status != DfuStatus::OK {
        warn!("DFU status not OK after reaching idle: {:?}", status.status);
        clear_status(io)?;
        status = get_status_polled(io)?;
        status.ensure_ok()?;
    }

    Ok(status)
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted device for exercising the protocol layers without USB.

    use super::*;

    #[derive(Debug, PartialEq)]
    pub enum Call {
        In {
            request: u8,
            value: u16,
            len: usize,
        },
        Out {
            request: u8,
            value: u16,
            data: Vec<u8>,
        },
    }

    /// Canned response to one scripted request.
    pub enum Reply {
        Status(DfuStatus, DfuState, u32),
        State(DfuState),
        Bytes(Vec<u8>),
        Accept,
        Fail,
    }

    #[derive(Default)]
    pub struct FakeDfu {
        pub calls: Vec<Call>,
        pub replies: std::collections::VecDeque<Reply>,
        pub quirks: Quirks,
    }

    impl FakeDfu {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self {
                calls: Vec::new(),
                replies: replies.into(),
                quirks: Quirks::NONE,
            }
        }

        fn next_reply(&mut self) -> Reply {
            self.replies
                .pop_front()
                .expect("fake device script exhausted")
        }

        /// Count of recorded calls with the given request code.
        pub fn count(&self, request: DfuRequest) -> usize {
            let code = request as u8;
            self.calls
                .iter()
                .filter(|c| match c {
                    Call::In { request, .. } | Call::Out { request, .. } => *request == code,
                })
                .count()
        }
    }

    impl ControlIo for FakeDfu {
        fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize> {
            self.calls.push(Call::In {
                request: request as u8,
                value,
                len: buf.len(),
            });
            match self.next_reply() {
                Reply::Status(status, state, poll) => {
                    buf[0] = status as u8;
                    buf[1] = (poll & 0xff) as u8;
                    buf[2] = ((poll >> 8) & 0xff) as u8;
                    buf[3] = ((poll >> 16) & 0xff) as u8;
                    buf[4] = state as u8;
                    buf[5] = 0;
                    Ok(6)
                }
                Reply::State(state) => {
                    buf[0] = state as u8;
                    Ok(1)
                }
                Reply::Bytes(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Reply::Accept => Ok(0),
                Reply::Fail => Err(Error::Io("scripted transport failure".into())),
            }
        }

        fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<usize> {
            self.calls.push(Call::Out {
                request: request as u8,
                value,
                data: data.to_vec(),
            });
            match self.next_reply() {
                Reply::Accept => Ok(data.len()),
                Reply::Fail => Err(Error::Io("scripted transport failure".into())),
                _ => panic!("scripted an IN reply for an OUT request"),
            }
        }

        fn quirks(&self) -> Quirks {
            self.quirks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{Call, FakeDfu, Reply};
    use super::*;

    #[test]
    fn status_record_parses_24_bit_poll_timeout() {
        let raw = [0x00, 0xe8, 0x03, 0x01, 0x05, 0x00];
        let status = DfuStatusResult::from_bytes(&raw).unwrap();
        assert_eq!(status.status, DfuStatus::OK);
        assert_eq!(status.poll_timeout, 0x0103e8);
        assert_eq!(status.state, DfuState::dfuDNLOAD_IDLE);
    }

    #[test]
    fn unknown_state_is_protocol_error() {
        let raw = [0x00, 0x00, 0x00, 0x00, 0x20, 0x00];
        assert!(matches!(
            DfuStatusResult::from_bytes(&raw),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn get_state_reads_one_byte() {
        let mut dev = FakeDfu::new(vec![Reply::State(DfuState::dfuUPLOAD_IDLE)]);
        assert_eq!(get_state(&mut dev).unwrap(), DfuState::dfuUPLOAD_IDLE);
    }

    #[test]
    fn detach_carries_timeout_in_value() {
        let mut dev = FakeDfu::new(vec![Reply::Accept]);
        detach(&mut dev, 1000).unwrap();
        assert_eq!(
            dev.calls[0],
            Call::Out {
                request: DfuRequest::DFU_DETACH as u8,
                value: 1000,
                data: vec![],
            }
        );
    }

    #[test]
    fn already_idle_needs_one_status_poll() {
        let mut dev = FakeDfu::new(vec![Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0)]);
        let status = ensure_idle(&mut dev).unwrap();
        assert_eq!(status.state, DfuState::dfuIDLE);
        assert_eq!(dev.count(DfuRequest::DFU_GETSTATUS), 1);
        assert_eq!(dev.count(DfuRequest::DFU_CLRSTATUS), 0);
    }

    #[test]
    fn error_state_recovers_with_one_clear() {
        // Device starts in dfuERROR with a vendor error; expect exactly two
        // GET_STATUS and one CLR_STATUS, ending idle.
        let mut dev = FakeDfu::new(vec![
            Reply::Status(DfuStatus::errVENDOR, DfuState::dfuERROR, 0),
            Reply::Accept, // CLR_STATUS
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        let status = ensure_idle(&mut dev).unwrap();
        assert_eq!(status.state, DfuState::dfuIDLE);
        assert_eq!(dev.count(DfuRequest::DFU_GETSTATUS), 2);
        assert_eq!(dev.count(DfuRequest::DFU_CLRSTATUS), 1);
    }

    #[test]
    fn stale_download_idle_gets_aborted() {
        let mut dev = FakeDfu::new(vec![
            Reply::Status(DfuStatus::OK, DfuState::dfuDNLOAD_IDLE, 0),
            Reply::Accept, // ABORT
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        ensure_idle(&mut dev).unwrap();
        assert_eq!(dev.count(DfuRequest::DFU_ABORT), 1);
        assert_eq!(dev.count(DfuRequest::DFU_CLRSTATUS), 0);
    }

    #[test]
    fn runtime_state_is_fatal() {
        let mut dev = FakeDfu::new(vec![Reply::Status(DfuStatus::OK, DfuState::appIDLE, 0)]);
        assert!(matches!(ensure_idle(&mut dev), Err(Error::Protocol(_))));
    }

    #[test]
    fn error_loop_is_bounded() {
        // A device stuck in dfuERROR forever must not spin the host.
        let mut replies = Vec::new();
        for _ in 0..64 {
            replies.push(Reply::Status(DfuStatus::errUNKNOWN, DfuState::dfuERROR, 0));
            replies.push(Reply::Accept);
        }
        let mut dev = FakeDfu::new(replies);
        assert!(matches!(ensure_idle(&mut dev), Err(Error::Protocol(_))));
    }

    #[test]
    fn busy_state_returned_for_flow_control() {
        let mut dev = FakeDfu::new(vec![Reply::Status(DfuStatus::OK, DfuState::dfuDNBUSY, 0)]);
        let status = ensure_idle(&mut dev).unwrap();
        assert_eq!(status.state, DfuState::dfuDNBUSY);
    }

    #[test]
    fn bad_status_at_idle_cleared_once() {
        let mut dev = FakeDfu::new(vec![
            Reply::Status(DfuStatus::errVERIFY, DfuState::dfuIDLE, 0),
            Reply::Accept, // CLR_STATUS
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        let status = ensure_idle(&mut dev).unwrap();
        assert_eq!(status.status, DfuStatus::OK);
        assert_eq!(dev.count(DfuRequest::DFU_CLRSTATUS), 1);
    }
}
