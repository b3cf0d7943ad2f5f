/// Streaming CRC-32 as used by the DFU suffix: the IEEE polynomial with
/// initial value 0xFFFFFFFF and no final complement, which is the bitwise
/// NOT of what `crc32fast` returns.
pub struct DfuCrc {
    hasher: crc32fast::Hasher,
}

impl DfuCrc {
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        !self.hasher.finalize()
    }
}

impl Default for DfuCrc {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience wrapper for one-shot computation over a whole buffer.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = DfuCrc::new();
    crc.update(bytes);
    crc.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference value: IEEE CRC-32 of "123456789" is 0xCBF43926, so the DFU
    // variant is its complement.
    #[test]
    fn known_vector() {
        assert_eq!(crc32(b"123456789"), !0xCBF43926u32);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let data = b"some firmware image bytes";
        let mut crc = DfuCrc::new();
        crc.update(&data[..7]);
        crc.update(&data[7..]);
        assert_eq!(crc.finalize(), crc32(data));
    }

    #[test]
    fn empty_input() {
        // CRC of nothing is the initial value, uncomplemented.
        assert_eq!(crc32(b""), 0xFFFFFFFF);
    }
}
