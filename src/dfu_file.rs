use byteorder::{ByteOrder, LE};
use log::{debug, info, warn};
use std::fmt::{Display, LowerHex, Write as _};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::crc::DfuCrc;

pub const SUFFIX_LENGTH: usize = 16;
pub const STELLARIS_PREFIX_LENGTH: usize = 8;
pub const LPC_PREFIX_LENGTH: usize = 16;

const STDIN_CHUNK_SIZE: usize = 65536;

/// A 16-bit ID that may be the 0xFFFF wildcard. Has functions for
/// pretty-printing and wildcard matching.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionalId(pub Option<u16>);

impl OptionalId {
    pub const ANY: OptionalId = OptionalId(None);

    pub fn matches(&self, cmp: u16) -> bool {
        match self.0 {
            None => true,
            Some(id) => id == cmp,
        }
    }

    /// The on-wire representation, with 0xFFFF standing in for "unset".
    pub fn to_wire(self) -> u16 {
        self.0.unwrap_or(0xffff)
    }

    fn fmt_helper<F>(&self, f: &mut std::fmt::Formatter, delegate: F) -> std::fmt::Result
    where
        F: FnOnce(&u16, &mut std::fmt::Formatter) -> std::fmt::Result,
    {
        match self.0 {
            Some(id) => delegate(&id, f),
            None => {
                for _ in 0..f.width().unwrap_or(4) {
                    f.write_char('?')?
                }
                Ok(())
            }
        }
    }
}

impl Display for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, Display::fmt)
    }
}

impl LowerHex for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, LowerHex::fmt)
    }
}

/// Convert from an ID field in a DFU suffix.
impl From<u16> for OptionalId {
    fn from(val: u16) -> Self {
        OptionalId(match val {
            0xffff => None,
            i => Some(i),
        })
    }
}

/// Whether a suffix must, may, or must not be present when loading.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SuffixReq {
    NoSuffix,
    NeedsSuffix,
    MaybeSuffix,
}

/// Whether a vendor prefix must, may, or must not be present when loading.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrefixReq {
    NoPrefix,
    NeedsPrefix,
    MaybePrefix,
}

/// Vendor prefix discriminator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PrefixType {
    #[default]
    None,
    /// TI Stellaris 8-byte prefix carrying a flash load address.
    Stellaris,
    /// NXP LPC 16-byte unencrypted prefix.
    LpcUnencrypted,
}

/// Size decomposition of a loaded firmware file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeParts {
    pub total: usize,
    pub prefix: usize,
    pub suffix: usize,
}

impl SizeParts {
    /// Bytes of actual firmware payload, excluding prefix and suffix.
    pub fn payload(&self) -> usize {
        self.total - self.prefix - self.suffix
    }
}

/// Parse errors for the DFU suffix and vendor prefixes.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FileFormatError {
    #[error("no DFU suffix signature; are you sure this is a DFU file?")]
    BadSignature,

    #[error("file is shorter than a DFU suffix: need at least {minimum} bytes")]
    FileTooShort { minimum: usize },

    #[error("unsupported DFU suffix length {actual}, expected at least {minimum}")]
    SuffixTooShort { minimum: usize, actual: usize },

    #[error("DFU suffix length {suffix_len} exceeds file length {file_len}")]
    SuffixTooLong { suffix_len: usize, file_len: usize },

    #[error("bad suffix CRC32: expected {expected:#010x}, computed {actual:#010x}")]
    BadCrc { expected: u32, actual: u32 },

    #[error("a valid DFU suffix is required")]
    SuffixRequired,

    #[error("a DFU suffix already exists, please delete it first")]
    SuffixPresent,

    #[error("a valid prefix of the requested type is required")]
    PrefixRequired,

    #[error("a prefix already exists, please delete it first")]
    PrefixPresent,
}

/// Firmware image loaded from (or destined for) a file, together with the
/// parsed suffix and prefix metadata.
#[derive(Debug, Default)]
pub struct DfuFile {
    pub name: String,
    pub firmware: Vec<u8>,
    pub size: SizeParts,
    pub prefix_type: PrefixType,
    /// Flash load address from a Stellaris prefix.
    pub stellaris_address: u32,
    pub suffix_crc: u32,
    pub bcd_dfu: u16,
    pub id_vendor: OptionalId,
    pub id_product: OptionalId,
    pub bcd_device: OptionalId,
}

impl DfuFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_vendor: OptionalId::ANY,
            id_product: OptionalId::ANY,
            bcd_device: OptionalId::ANY,
            ..Default::default()
        }
    }

    /// The firmware payload with any prefix and suffix stripped.
    pub fn payload(&self) -> &[u8] {
        &self.firmware[self.size.prefix..self.size.total - self.size.suffix]
    }

    /// Read the file (or stdin when the name is "-") and validate the suffix
    /// and prefix against the caller's requirements.
    pub fn load(
        &mut self,
        check_suffix: SuffixReq,
        check_prefix: PrefixReq,
    ) -> crate::error::Result<()> {
        let mut check_suffix = check_suffix;
        if self.name == "-" {
            let mut firmware = Vec::new();
            let stdin = std::io::stdin();
            let mut lock = stdin.lock();
            let mut chunk = vec![0u8; STDIN_CHUNK_SIZE];
            loop {
                let n = lock.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                firmware.extend_from_slice(&chunk[..n]);
            }
            debug!("Read {} bytes from stdin", firmware.len());
            self.firmware = firmware;
            check_suffix = SuffixReq::MaybeSuffix;
        } else {
            self.firmware = match std::fs::read(&self.name) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(crate::error::Error::NoInput(format!(
                        "could not open file {} for reading",
                        self.name
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(crate::error::Error::Io(format!(
                        "permission denied: {}",
                        self.name
                    )));
                }
                Err(e) => return Err(e.into()),
            };
        }
        self.size.total = self.firmware.len();
        self.parse(check_suffix, check_prefix)
    }

    /// Validate the suffix and prefix of the already-populated firmware
    /// buffer. Split out from [load](Self::load) so in-memory images can be
    /// checked the same way.
    pub fn parse(
        &mut self,
        check_suffix: SuffixReq,
        check_prefix: PrefixReq,
    ) -> crate::error::Result<()> {
        self.size.prefix = 0;
        self.size.suffix = 0;
        self.bcd_dfu = 0;
        self.id_vendor = OptionalId::ANY;
        self.id_product = OptionalId::ANY;
        self.bcd_device = OptionalId::ANY;
        self.stellaris_address = 0;
        self.prefix_type = PrefixType::None;
        self.size.total = self.firmware.len();

        match self.probe_suffix() {
            Ok(()) => {
                if check_suffix == SuffixReq::NoSuffix {
                    return Err(crate::error::Error::Data(
                        FileFormatError::SuffixPresent.to_string(),
                    ));
                }
            }
            Err(reason) => match check_suffix {
                SuffixReq::NeedsSuffix => {
                    return Err(crate::error::Error::Data(format!(
                        "{reason}; {}",
                        FileFormatError::SuffixRequired
                    )));
                }
                SuffixReq::MaybeSuffix => warn!("{reason}"),
                SuffixReq::NoSuffix => {}
            },
        }

        self.probe_prefix();
        match check_prefix {
            PrefixReq::NeedsPrefix if self.size.prefix == 0 => {
                return Err(crate::error::Error::Data(
                    FileFormatError::PrefixRequired.to_string(),
                ));
            }
            PrefixReq::NoPrefix if self.size.prefix != 0 => {
                return Err(crate::error::Error::Data(
                    FileFormatError::PrefixPresent.to_string(),
                ));
            }
            _ => {}
        }

        match self.prefix_type {
            PrefixType::Stellaris => {
                debug!(
                    "TI Stellaris prefix: address 0x{:08x}, payload length {}",
                    self.stellaris_address,
                    LE::read_u32(&self.firmware[4..8])
                );
            }
            PrefixType::LpcUnencrypted => {
                info!(
                    "unencrypted NXP LPC prefix: payload {} kiB",
                    LE::read_u16(&self.firmware[2..4]) >> 1
                );
            }
            PrefixType::None => {}
        }
        Ok(())
    }

    /// Check for a DFU suffix at the end of the buffer, filling in the
    /// suffix fields on success. Returns the reason when none is found.
    fn probe_suffix(&mut self) -> Result<(), FileFormatError> {
        if self.size.total < SUFFIX_LENGTH {
            return Err(FileFormatError::FileTooShort {
                minimum: SUFFIX_LENGTH,
            });
        }
        let suffix = &self.firmware[self.size.total - SUFFIX_LENGTH..];

        // Signature reads 'U','F','D' in the little-endian layout.
        if &suffix[8..11] != b"UFD" {
            return Err(FileFormatError::BadSignature);
        }

        let expected = LE::read_u32(&suffix[12..16]);
        let actual = crate::crc::crc32(&self.firmware[..self.size.total - 4]);
        if expected != actual {
            return Err(FileFormatError::BadCrc { expected, actual });
        }

        let suffix_len = suffix[11] as usize;
        if suffix_len < SUFFIX_LENGTH {
            return Err(FileFormatError::SuffixTooShort {
                minimum: SUFFIX_LENGTH,
                actual: suffix_len,
            });
        }
        if suffix_len > self.size.total {
            return Err(FileFormatError::SuffixTooLong {
                suffix_len,
                file_len: self.size.total,
            });
        }

        self.bcd_dfu = LE::read_u16(&suffix[6..8]);
        debug!("DFU suffix version 0x{:04x}", self.bcd_dfu);
        self.size.suffix = suffix_len;
        self.suffix_crc = expected;
        self.id_vendor = LE::read_u16(&suffix[4..6]).into();
        self.id_product = LE::read_u16(&suffix[2..4]).into();
        self.bcd_device = LE::read_u16(&suffix[0..2]).into();
        Ok(())
    }

    /// Detect a TI Stellaris or NXP LPC prefix at the start of the buffer.
    fn probe_prefix(&mut self) {
        let prefix = &self.firmware;
        if self.size.total < STELLARIS_PREFIX_LENGTH {
            return;
        }
        if prefix[0] == 0x01 && prefix[1] == 0x00 {
            let payload_len = LE::read_u32(&prefix[4..8]) as usize;
            let expected = self.size.total - STELLARIS_PREFIX_LENGTH - self.size.suffix;
            if payload_len != expected {
                return;
            }
            self.prefix_type = PrefixType::Stellaris;
            self.size.prefix = STELLARIS_PREFIX_LENGTH;
            self.stellaris_address = 1024 * LE::read_u16(&prefix[2..4]) as u32;
        } else if (prefix[0] & 0x3f) == 0x1a && (prefix[1] & 0x3f) == 0x3f {
            if self.size.total < LPC_PREFIX_LENGTH + self.size.suffix {
                return;
            }
            self.prefix_type = PrefixType::LpcUnencrypted;
            self.size.prefix = LPC_PREFIX_LENGTH;
        }
    }

    /// Write the image to its file: optional prefix, payload, then optional
    /// suffix with the CRC computed across everything written before it.
    pub fn store(&self, write_suffix: bool, write_prefix: bool) -> crate::error::Result<()> {
        let mut out = match std::fs::File::create(Path::new(&self.name)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(crate::error::Error::Io(format!(
                    "permission denied: {}",
                    self.name
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let mut crc = DfuCrc::new();

        if write_prefix {
            match self.prefix_type {
                PrefixType::Stellaris => {
                    let mut prefix = [0u8; STELLARIS_PREFIX_LENGTH];
                    prefix[0] = 0x01; // STELLARIS_DFU_PROG
                    LE::write_u16(&mut prefix[2..4], (self.stellaris_address / 1024) as u16);
                    LE::write_u32(&mut prefix[4..8], self.size.payload() as u32);
                    write_with_crc(&mut out, &mut crc, &prefix)?;
                }
                PrefixType::LpcUnencrypted => {
                    let payload_units = (self.size.total - self.size.suffix).div_ceil(512);
                    let mut prefix = [0u8; LPC_PREFIX_LENGTH];
                    prefix[0] = 0x1a; // unencrypted
                    prefix[1] = 0x3f; // reserved
                    LE::write_u16(&mut prefix[2..4], payload_units as u16);
                    prefix[12..16].fill(0xff);
                    write_with_crc(&mut out, &mut crc, &prefix)?;
                }
                PrefixType::None => {}
            }
        }

        write_with_crc(&mut out, &mut crc, self.payload())?;

        if write_suffix {
            let mut suffix = [0u8; SUFFIX_LENGTH];
            LE::write_u16(&mut suffix[0..2], self.bcd_device.to_wire());
            LE::write_u16(&mut suffix[2..4], self.id_product.to_wire());
            LE::write_u16(&mut suffix[4..6], self.id_vendor.to_wire());
            LE::write_u16(&mut suffix[6..8], self.bcd_dfu);
            suffix[8..11].copy_from_slice(b"UFD");
            suffix[11] = SUFFIX_LENGTH as u8;

            crc.update(&suffix[..12]);
            out.write_all(&suffix[..12])?;

            let crc = crc.finalize();
            LE::write_u32(&mut suffix[12..16], crc);
            out.write_all(&suffix[12..16])?;
        }
        Ok(())
    }

    /// Build the bytes [store](Self::store) would write, without touching the
    /// filesystem. Used by upload paths that assemble the image in memory.
    pub fn to_bytes(&self, write_suffix: bool) -> Vec<u8> {
        let mut crc = DfuCrc::new();
        let mut out = Vec::with_capacity(self.size.total);
        out.extend_from_slice(self.payload());
        crc.update(self.payload());

        if write_suffix {
            let mut suffix = [0u8; SUFFIX_LENGTH];
            LE::write_u16(&mut suffix[0..2], self.bcd_device.to_wire());
            LE::write_u16(&mut suffix[2..4], self.id_product.to_wire());
            LE::write_u16(&mut suffix[4..6], self.id_vendor.to_wire());
            LE::write_u16(&mut suffix[6..8], self.bcd_dfu);
            suffix[8..11].copy_from_slice(b"UFD");
            suffix[11] = SUFFIX_LENGTH as u8;
            crc.update(&suffix[..12]);
            LE::write_u32(&mut suffix[12..16], crc.finalize());
            out.extend_from_slice(&suffix);
        }
        out
    }

    /// Human-readable description of the suffix and prefix, for the file
    /// manipulation tools' check mode.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        match self.prefix_type {
            PrefixType::Stellaris => {
                let _ = writeln!(
                    s,
                    "The file {} contains a TI Stellaris DFU prefix:",
                    self.name
                );
                let _ = writeln!(s, "  Address:     0x{:08x}", self.stellaris_address);
            }
            PrefixType::LpcUnencrypted => {
                let kib = LE::read_u16(&self.firmware[2..4]) >> 1;
                let _ = writeln!(
                    s,
                    "The file {} contains an unencrypted NXP LPC DFU prefix:",
                    self.name
                );
                let _ = writeln!(s, "  Size:        {kib} kiB");
            }
            PrefixType::None => {}
        }
        if self.size.suffix > 0 {
            let _ = writeln!(s, "The file {} contains a DFU suffix:", self.name);
            let _ = writeln!(s, "  BCD device:  0x{:04x}", self.bcd_device.to_wire());
            let _ = writeln!(s, "  Product ID:  0x{:04x}", self.id_product.to_wire());
            let _ = writeln!(s, "  Vendor ID:   0x{:04x}", self.id_vendor.to_wire());
            let _ = writeln!(s, "  BCD DFU:     0x{:04x}", self.bcd_dfu);
            let _ = writeln!(s, "  Length:      {}", self.size.suffix);
            let _ = writeln!(s, "  CRC:         0x{:08x}", self.suffix_crc);
        }
        s
    }
}

fn write_with_crc(
    out: &mut impl Write,
    crc: &mut DfuCrc,
    bytes: &[u8],
) -> crate::error::Result<()> {
    crc.update(bytes);
    out.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn image_with_suffix(payload: &[u8]) -> Vec<u8> {
        let mut file = DfuFile::new("mem");
        file.firmware = payload.to_vec();
        file.size.total = payload.len();
        file.bcd_dfu = 0x0100;
        file.id_vendor = OptionalId(Some(0xcafe));
        file.id_product = OptionalId(Some(0xbeef));
        file.bcd_device = OptionalId(Some(0xdead));
        file.to_bytes(true)
    }

    #[test]
    fn suffix_round_trip() {
        let bytes = image_with_suffix(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes.len(), 4 + SUFFIX_LENGTH);

        let mut file = DfuFile::new("mem");
        file.firmware = bytes;
        file.parse(SuffixReq::NeedsSuffix, PrefixReq::NoPrefix)
            .unwrap();
        assert_eq!(file.size.suffix, SUFFIX_LENGTH);
        assert_eq!(file.bcd_dfu, 0x0100);
        assert_eq!(file.id_vendor, OptionalId(Some(0xcafe)));
        assert_eq!(file.id_product, OptionalId(Some(0xbeef)));
        assert_eq!(file.bcd_device, OptionalId(Some(0xdead)));
        assert_eq!(file.payload(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn crc_covers_every_bit() {
        let mut bytes = image_with_suffix(&[0x10, 0x20, 0x30, 0x40]);
        // Flip one payload bit; verification must now fail.
        bytes[1] ^= 0x04;
        let mut file = DfuFile::new("mem");
        file.firmware = bytes;
        assert!(matches!(
            file.parse(SuffixReq::NeedsSuffix, PrefixReq::NoPrefix),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn short_file_needs_suffix_fails() {
        let mut file = DfuFile::new("mem");
        file.firmware = vec![0u8; 8];
        assert!(matches!(
            file.parse(SuffixReq::NeedsSuffix, PrefixReq::NoPrefix),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn short_suffix_length_rejected() {
        let mut bytes = image_with_suffix(b"data");
        // Corrupt bLength, then fix up the CRC so only the length check trips.
        let total = bytes.len();
        bytes[total - 5] = 12;
        let crc = crate::crc::crc32(&bytes[..total - 4]);
        LE::write_u32(&mut bytes[total - 4..], crc);

        let mut file = DfuFile::new("mem");
        file.firmware = bytes;
        assert!(matches!(
            file.parse(SuffixReq::NeedsSuffix, PrefixReq::NoPrefix),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn missing_suffix_tolerated_when_maybe() {
        let mut file = DfuFile::new("mem");
        file.firmware = vec![0u8; 64];
        file.parse(SuffixReq::MaybeSuffix, PrefixReq::MaybePrefix)
            .unwrap();
        assert_eq!(file.size.suffix, 0);
        assert_eq!(file.payload().len(), 64);
    }

    #[test]
    fn suffix_forbidden_when_adding_new_one() {
        let mut file = DfuFile::new("mem");
        file.firmware = image_with_suffix(b"fw");
        assert!(matches!(
            file.parse(SuffixReq::NoSuffix, PrefixReq::MaybePrefix),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn stellaris_prefix_detected() {
        // 8-byte prefix + 4-byte payload, no suffix.
        let mut image = vec![0x01, 0x00, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00];
        image.extend_from_slice(&[0xaa; 4]);
        let mut file = DfuFile::new("mem");
        file.firmware = image;
        file.parse(SuffixReq::NoSuffix, PrefixReq::NeedsPrefix)
            .unwrap();
        assert_eq!(file.prefix_type, PrefixType::Stellaris);
        assert_eq!(file.size.prefix, STELLARIS_PREFIX_LENGTH);
        assert_eq!(file.stellaris_address, 2 * 1024);
        assert_eq!(file.payload(), &[0xaa; 4]);
    }

    #[test]
    fn stellaris_prefix_with_wrong_length_ignored() {
        let mut image = vec![0x01, 0x00, 0x02, 0x00, 0x99, 0x00, 0x00, 0x00];
        image.extend_from_slice(&[0xaa; 4]);
        let mut file = DfuFile::new("mem");
        file.firmware = image;
        file.parse(SuffixReq::NoSuffix, PrefixReq::MaybePrefix)
            .unwrap();
        assert_eq!(file.prefix_type, PrefixType::None);
    }

    #[test]
    fn lpc_prefix_detected() {
        let mut image = vec![0u8; LPC_PREFIX_LENGTH];
        image[0] = 0x1a;
        image[1] = 0x3f;
        LE::write_u16(&mut image[2..4], 2);
        image[12..16].fill(0xff);
        image.extend_from_slice(&[0xbb; 32]);
        let mut file = DfuFile::new("mem");
        file.firmware = image;
        file.parse(SuffixReq::NoSuffix, PrefixReq::NeedsPrefix)
            .unwrap();
        assert_eq!(file.prefix_type, PrefixType::LpcUnencrypted);
        assert_eq!(file.size.prefix, LPC_PREFIX_LENGTH);
    }

    #[test]
    fn prefix_required_but_absent() {
        let mut file = DfuFile::new("mem");
        file.firmware = vec![0u8; 32];
        assert!(matches!(
            file.parse(SuffixReq::NoSuffix, PrefixReq::NeedsPrefix),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn wildcard_ids_round_trip() {
        let mut file = DfuFile::new("mem");
        file.firmware = b"xyzw".to_vec();
        file.size.total = 4;
        file.bcd_dfu = 0x0100;
        let bytes = file.to_bytes(true);

        let mut parsed = DfuFile::new("mem");
        parsed.firmware = bytes;
        parsed
            .parse(SuffixReq::NeedsSuffix, PrefixReq::NoPrefix)
            .unwrap();
        assert_eq!(parsed.id_vendor, OptionalId::ANY);
        assert!(parsed.id_vendor.matches(0x1234));
        assert_eq!(format!("{:x}", parsed.id_vendor), "????");
    }
}
