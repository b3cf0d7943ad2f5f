use std::fmt::Display;

const VENDOR_OPENMOKO: u16 = 0x1d50; // Openmoko Freerunner / GTA02
const VENDOR_FIC: u16 = 0x1457; // Openmoko Freerunner / GTA02
const VENDOR_VOTI: u16 = 0x16c0; // OpenPCD Reader
const VENDOR_LEAFLABS: u16 = 0x1eaf; // Maple
const PRODUCT_MAPLE3: u16 = 0x0003; // rev 3 and 5

/// Fallback poll interval for devices with the POLLTIMEOUT quirk.
pub const DEFAULT_POLL_TIMEOUT_MS: u32 = 5;

/// Set of specification deviations detected for one device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Quirks(u32);

impl Quirks {
    /// Device returns bogus bwPollTimeout values.
    pub const POLL_TIMEOUT: Quirks = Quirks(1 << 0);

    /// Device reports a wrong DFU version in its functional descriptor.
    pub const FORCE_DFU11: Quirks = Quirks(1 << 1);

    pub const NONE: Quirks = Quirks(0);

    pub fn contains(self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    /// Look up the quirks for a device by its identifying triple.
    pub fn detect(vendor: u16, product: u16, bcd_device: u16) -> Quirks {
        let mut quirks = Quirks::NONE;

        if matches!(vendor, VENDOR_OPENMOKO | VENDOR_FIC | VENDOR_VOTI) {
            quirks.0 |= Self::POLL_TIMEOUT.0;
        }

        if vendor == VENDOR_LEAFLABS && product == PRODUCT_MAPLE3 && bcd_device == 0x0200 {
            quirks.0 |= Self::FORCE_DFU11.0;
        }

        quirks
    }
}

impl Display for Quirks {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.0 == 0 {
            return write!(f, "none");
        }
        let mut sep = "";
        if self.contains(Self::POLL_TIMEOUT) {
            write!(f, "{sep}poll-timeout")?;
            sep = ",";
        }
        if self.contains(Self::FORCE_DFU11) {
            write!(f, "{sep}force-dfu11")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openmoko_gets_poll_timeout() {
        let q = Quirks::detect(VENDOR_OPENMOKO, 0x5119, 0x0100);
        assert!(q.contains(Quirks::POLL_TIMEOUT));
        assert!(!q.contains(Quirks::FORCE_DFU11));
    }

    #[test]
    fn maple_rev3_forces_dfu11() {
        let q = Quirks::detect(VENDOR_LEAFLABS, PRODUCT_MAPLE3, 0x0200);
        assert!(q.contains(Quirks::FORCE_DFU11));
    }

    #[test]
    fn maple_other_revision_is_clean() {
        assert_eq!(
            Quirks::detect(VENDOR_LEAFLABS, PRODUCT_MAPLE3, 0x0100),
            Quirks::NONE
        );
    }

    #[test]
    fn unknown_device_is_clean() {
        assert_eq!(Quirks::detect(0x0483, 0xdf11, 0x2200), Quirks::NONE);
    }
}
