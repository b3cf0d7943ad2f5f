use log::{debug, info, warn};
use std::io::Write;

use crate::error::{Error, Result};
use crate::progress::Progress;
use crate::protocol::{self, ControlIo, DfuState, DfuStatus};

/// Iteration bound for the per-block busy poll and the manifestation poll.
const MAX_POLL_ATTEMPTS: usize = 64;

/// Read firmware out of the device in `xfer_size` blocks, writing each to
/// `sink`. The device ends the stream with a block shorter than
/// `xfer_size`; `expected_size` optionally bounds the transfer from our
/// side. Returns the total byte count.
pub fn do_upload(
    io: &mut impl ControlIo,
    xfer_size: usize,
    sink: &mut impl Write,
    expected_size: Option<u64>,
    progress: &mut impl Progress,
) -> Result<u64> {
    if xfer_size == 0 {
        return Err(Error::Usage("transfer size must be specified".into()));
    }

    info!("Copying data from DFU device to host");
    progress.start_task(expected_size);

    let mut buf = vec![0u8; xfer_size];
    let mut block_num = 0u16;
    let mut total: u64 = 0;
    let mut short_block = false;

    loop {
        let request = match expected_size {
            Some(expected) => {
                let remaining = expected - total;
                if remaining == 0 {
                    break;
                }
                (remaining as usize).min(xfer_size)
            }
            None => xfer_size,
        };

        let len = protocol::upload(io, block_num, &mut buf[..request])?;
        sink.write_all(&buf[..len])?;
        total += len as u64;
        progress.advance(len as u64);
        debug!("uploaded block {block_num:#06x} ({len} bytes)");

        if len < request {
            short_block = true;
            break;
        }

        block_num = match block_num.checked_add(1) {
            Some(i) => i,
            None => {
                return Err(Error::Protocol(
                    "upload overflowed the 16-bit block number".into(),
                ));
            }
        };
    }

    progress.finish();
    info!("Received a total of {total} bytes");

    if let Some(expected) = expected_size {
        if short_block && total < expected {
            warn!("short upload: expected {expected} bytes, got {total}");
        }
    }

    // The device should be back at dfuIDLE after the short block; if we cut
    // the transfer off ourselves it is still in dfuUPLOAD_IDLE and needs an
    // abort.
    let status = protocol::get_status_polled(io)?;
    if status.state != DfuState::dfuIDLE {
        debug!("upload ended in {:?}, sending DFU_ABORT", status.state);
        protocol::abort(io)?;
    }

    Ok(total)
}

/// Write `data` (the firmware payload, prefix and suffix already stripped)
/// into the device in `xfer_size` blocks, then drive manifestation.
pub fn do_download(
    io: &mut impl ControlIo,
    xfer_size: usize,
    data: &[u8],
    progress: &mut impl Progress,
) -> Result<u64> {
    if xfer_size == 0 {
        return Err(Error::Usage("transfer size must be specified".into()));
    }

    info!("Copying data from host to DFU device");
    progress.start_task(Some(data.len() as u64));

    let mut block_num = 0u16;
    for chunk in data.chunks(xfer_size) {
        send_block(io, block_num, chunk)?;
        progress.advance(chunk.len() as u64);
        block_num = next_block(block_num)?;
    }

    // Terminal zero-length block starts manifestation.
    protocol::dnload(io, block_num, &[])?;
    debug!("sent terminal zero-length block {block_num:#06x}");

    progress.finish();
    manifest(io)?;
    Ok(data.len() as u64)
}

fn next_block(block_num: u16) -> Result<u16> {
    block_num.checked_add(1).ok_or_else(|| {
        Error::Protocol("download overflowed the 16-bit block number".into())
    })
}

/// DNLOAD one block and poll until the device is ready for the next.
fn send_block(io: &mut impl ControlIo, block_num: u16, chunk: &[u8]) -> Result<()> {
    protocol::dnload(io, block_num, chunk)?;
    debug!("sent block {block_num:#06x} ({} bytes)", chunk.len());

    for _ in 0..MAX_POLL_ATTEMPTS {
        let status = protocol::get_status_polled(io)?;
        status.ensure_ok()?;
        match status.state {
            DfuState::dfuDNLOAD_IDLE => return Ok(()),
            DfuState::dfuDNBUSY | DfuState::dfuDNLOAD_SYNC => continue,
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected state {other:?} after block {block_num}"
                )));
            }
        }
    }
    Err(Error::Protocol(format!(
        "device stayed busy after block {block_num}"
    )))
}

/// Poll the device through the manifestation phase. Manifest-tolerant
/// devices come back to dfuIDLE; others park in dfuMANIFEST_WAIT_RESET and
/// expect a USB reset from the caller.
fn manifest(io: &mut impl ControlIo) -> Result<()> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        let status = protocol::get_status_polled(io)?;
        if status.status != DfuStatus::OK {
            return Err(Error::Protocol(format!(
                "manifestation failed: {:?} ({})",
                status.status,
                status.status.error_str()
            )));
        }
        match status.state {
            DfuState::dfuMANIFEST_SYNC | DfuState::dfuMANIFEST => continue,
            DfuState::dfuIDLE => {
                info!("Download done, device manifested new firmware");
                return Ok(());
            }
            DfuState::dfuMANIFEST_WAIT_RESET => {
                info!("Device expects a USB reset to finish manifestation");
                return Ok(());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected state {other:?} during manifestation"
                )));
            }
        }
    }
    Err(Error::Protocol("device never left manifestation".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CountingProgress;
    use crate::protocol::fake::{Call, FakeDfu, Reply};
    use crate::protocol::DfuRequest;

    fn dnload_idle() -> Reply {
        Reply::Status(DfuStatus::OK, DfuState::dfuDNLOAD_IDLE, 0)
    }

    #[test]
    fn download_block_sequence_matches_file_size() {
        // 4100 bytes at xfer 2048: blocks (0, 2048), (1, 2048), (2, 4),
        // then the terminal (3, 0), then manifestation.
        let data = vec![0xabu8; 4100];
        let mut dev = FakeDfu::new(vec![
            Reply::Accept,
            dnload_idle(),
            Reply::Accept,
            dnload_idle(),
            Reply::Accept,
            dnload_idle(),
            Reply::Accept, // terminal ZLP
            Reply::Status(DfuStatus::OK, DfuState::dfuMANIFEST, 0),
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        let mut progress = CountingProgress::new();

        let total = do_download(&mut dev, 2048, &data, &mut progress).unwrap();
        assert_eq!(total, 4100);
        assert_eq!(progress.advanced, 4100);
        assert!(progress.finished);

        let dnloads: Vec<(u16, usize)> = dev
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Out {
                    request,
                    value,
                    data,
                } if *request == DfuRequest::DFU_DNLOAD as u8 => Some((*value, data.len())),
                _ => None,
            })
            .collect();
        assert_eq!(dnloads, vec![(0, 2048), (1, 2048), (2, 4), (3, 0)]);
        // ceil(4100 / 2048) + 1 requests total.
        assert_eq!(dnloads.len(), 4100usize.div_ceil(2048) + 1);
    }

    #[test]
    fn download_tolerates_busy_before_idle() {
        let data = vec![0u8; 16];
        let mut dev = FakeDfu::new(vec![
            Reply::Accept,
            Reply::Status(DfuStatus::OK, DfuState::dfuDNBUSY, 0),
            Reply::Status(DfuStatus::OK, DfuState::dfuDNBUSY, 0),
            dnload_idle(),
            Reply::Accept, // ZLP
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        do_download(&mut dev, 64, &data, &mut CountingProgress::new()).unwrap();
    }

    #[test]
    fn download_error_status_aborts_transfer() {
        let data = vec![0u8; 16];
        let mut dev = FakeDfu::new(vec![
            Reply::Accept,
            Reply::Status(DfuStatus::errPROG, DfuState::dfuERROR, 0),
        ]);
        assert!(matches!(
            do_download(&mut dev, 64, &data, &mut CountingProgress::new()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn download_waits_out_manifest_wait_reset() {
        let data = vec![0u8; 4];
        let mut dev = FakeDfu::new(vec![
            Reply::Accept,
            dnload_idle(),
            Reply::Accept, // ZLP
            Reply::Status(DfuStatus::OK, DfuState::dfuMANIFEST, 0),
            Reply::Status(DfuStatus::OK, DfuState::dfuMANIFEST_WAIT_RESET, 0),
        ]);
        do_download(&mut dev, 64, &data, &mut CountingProgress::new()).unwrap();
    }

    #[test]
    fn zero_transfer_size_is_usage_error() {
        let mut dev = FakeDfu::new(vec![]);
        assert!(matches!(
            do_download(&mut dev, 0, &[], &mut CountingProgress::new()),
            Err(Error::Usage(_))
        ));
        assert!(matches!(
            do_upload(
                &mut dev,
                0,
                &mut Vec::new(),
                None,
                &mut CountingProgress::new()
            ),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn upload_totals_sum_of_chunks() {
        let mut dev = FakeDfu::new(vec![
            Reply::Bytes(vec![0x11; 8]),
            Reply::Bytes(vec![0x22; 8]),
            Reply::Bytes(vec![0x33; 3]), // short block ends the stream
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        let mut out = Vec::new();
        let total = do_upload(&mut dev, 8, &mut out, None, &mut CountingProgress::new()).unwrap();
        assert_eq!(total, 19);
        assert_eq!(out.len(), 19);
        assert_eq!(&out[16..], &[0x33; 3]);
        assert_eq!(dev.count(DfuRequest::DFU_ABORT), 0);

        let blocks: Vec<u16> = dev
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::In { request, value, .. }
                    if *request == DfuRequest::DFU_UPLOAD as u8 =>
                {
                    Some(*value)
                }
                _ => None,
            })
            .collect();
        assert_eq!(blocks, vec![0, 1, 2]);
    }

    #[test]
    fn upload_zero_length_first_block_is_empty_file() {
        let mut dev = FakeDfu::new(vec![
            Reply::Bytes(vec![]),
            Reply::Status(DfuStatus::OK, DfuState::dfuIDLE, 0),
        ]);
        let mut out = Vec::new();
        let total = do_upload(&mut dev, 8, &mut out, None, &mut CountingProgress::new()).unwrap();
        assert_eq!(total, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn upload_stops_at_expected_size_and_aborts() {
        // Device would keep streaming, but the caller asked for 12 bytes.
        let mut dev = FakeDfu::new(vec![
            Reply::Bytes(vec![0u8; 8]),
            Reply::Bytes(vec![0u8; 4]),
            Reply::Status(DfuStatus::OK, DfuState::dfuUPLOAD_IDLE, 0),
            Reply::Accept, // ABORT
        ]);
        let mut out = Vec::new();
        let total =
            do_upload(&mut dev, 8, &mut out, Some(12), &mut CountingProgress::new()).unwrap();
        assert_eq!(total, 12);
        assert_eq!(dev.count(DfuRequest::DFU_ABORT), 1);
    }
}
