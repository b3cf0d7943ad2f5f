use log::{debug, warn};

use crate::error::{Error, Result};

/// Segment type bits as encoded in the low three bits of the type letter.
pub const READABLE: u8 = 0x1;
pub const ERASABLE: u8 = 0x2;
pub const WRITEABLE: u8 = 0x4;

/// One contiguous region of device memory, with an inclusive end address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemSegment {
    pub start: u32,
    pub end: u32,
    pub page_size: u32,
    pub mem_type: u8,
}

impl MemSegment {
    pub fn readable(&self) -> bool {
        self.mem_type & READABLE != 0
    }

    pub fn erasable(&self) -> bool {
        self.mem_type & ERASABLE != 0
    }

    pub fn writeable(&self) -> bool {
        self.mem_type & WRITEABLE != 0
    }

    pub fn contains(&self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }
}

/// Ordered list of memory segments parsed from one altsetting name.
#[derive(Clone, Debug, Default)]
pub struct MemLayout {
    pub name: String,
    segments: Vec<MemSegment>,
}

impl MemLayout {
    pub fn segments(&self) -> &[MemSegment] {
        &self.segments
    }

    /// Append a segment, keeping the list ordered by start address.
    pub fn add_segment(&mut self, segment: MemSegment) {
        let at = self
            .segments
            .partition_point(|s| s.start <= segment.start);
        self.segments.insert(at, segment);
    }

    /// First segment whose bounds contain the given address.
    pub fn find_segment(&self, address: u32) -> Option<&MemSegment> {
        self.segments.iter().find(|s| s.contains(address))
    }
}

/// Parse the memory map from an interface descriptor string encoded as per
/// ST document UM0424 section 4.3.2, e.g.
/// `@Internal Flash/0x08000000/04*016Kg,01*064Kg,01*128Kg`.
pub fn parse_memory_layout(intf_desc: &str) -> Result<MemLayout> {
    let rest = intf_desc
        .strip_prefix('@')
        .ok_or_else(|| Error::Data(format!("memory layout does not start with '@': {intf_desc}")))?;

    let (name, mut rest) = rest
        .split_once('/')
        .ok_or_else(|| Error::Data("memory layout has no address sections".into()))?;
    debug!("DfuSe interface name: \"{}\"", name.trim_end());

    let mut layout = MemLayout {
        name: name.trim_end().to_string(),
        segments: Vec::new(),
    };
    let mut count = 0usize;

    loop {
        let hex = rest
            .strip_prefix("0x")
            .or_else(|| rest.strip_prefix("0X"))
            .ok_or_else(|| Error::Data(format!("expected 0x-prefixed address at \"{rest}\"")))?;
        let digits = hex
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(hex.len());
        let mut address = u32::from_str_radix(&hex[..digits], 16)
            .map_err(|_| Error::Data(format!("bad segment address in \"{rest}\"")))?;
        rest = hex[digits..]
            .strip_prefix('/')
            .ok_or_else(|| Error::Data("expected '/' after segment address".into()))?;

        // One or more count*size sections for this base address.
        loop {
            let (sectors, after) = take_decimal(rest)
                .ok_or_else(|| Error::Data(format!("expected sector count at \"{rest}\"")))?;
            let after = after
                .strip_prefix('*')
                .ok_or_else(|| Error::Data("expected '*' after sector count".into()))?;
            let (size, after) = take_decimal(after)
                .ok_or_else(|| Error::Data(format!("expected sector size at \"{after}\"")))?;
            let mut chars = after.chars();
            let multiplier = chars.next();
            count += 1;

            let mut size = size;
            let mut mem_type = 0u8;
            match multiplier {
                Some('B') => {}
                Some('K') => size *= 1024,
                Some('M') => size *= 1024 * 1024,
                Some(c @ 'a'..='g') => {
                    warn!("non-valid multiplier '{c}', interpreted as type identifier");
                    mem_type = c as u8;
                }
                Some(c) => warn!("non-valid multiplier '{c}', assuming bytes"),
                None => return Err(Error::Data("truncated segment section".into())),
            }
            let after = chars.as_str();

            let after = if mem_type == 0 {
                let mut chars = after.chars();
                match chars.next() {
                    Some(c) if c.is_ascii_alphabetic() => {
                        mem_type = c as u8;
                        chars.as_str()
                    }
                    _ => {
                        warn!("no valid type for segment {count}");
                        after
                    }
                }
            } else {
                after
            };

            let span = sectors
                .checked_mul(size)
                .filter(|&s| s > 0)
                .ok_or_else(|| Error::Data("segment has no addressable bytes".into()))?;
            layout.add_segment(MemSegment {
                start: address,
                end: address + span - 1,
                page_size: size,
                mem_type: mem_type & 7,
            });
            debug!(
                "memory segment at 0x{:08x} {} x {} = {} ({}{}{})",
                address,
                sectors,
                size,
                span,
                if mem_type & READABLE != 0 { "r" } else { "" },
                if mem_type & ERASABLE != 0 { "e" } else { "" },
                if mem_type & WRITEABLE != 0 { "w" } else { "" },
            );
            address += span;

            match after.strip_prefix(',') {
                Some(next) => rest = next,
                None => {
                    rest = after;
                    break;
                }
            }
        }

        match rest.strip_prefix('/') {
            Some(next) => rest = next,
            None => break,
        }
        if rest.is_empty() {
            break;
        }
    }

    debug!("parsed {} segments", count);
    Ok(layout)
}

fn take_decimal(s: &str) -> Option<(u32, &str)> {
    let digits = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits == 0 {
        return None;
    }
    s[..digits].parse().ok().map(|v| (v, &s[digits..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stm32_internal_flash() {
        let layout =
            parse_memory_layout("@Internal Flash/0x08000000/04*016Kg,01*064Kg,01*128Kg").unwrap();
        assert_eq!(layout.name, "Internal Flash");

        let segs = layout.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(
            segs[0],
            MemSegment {
                start: 0x0800_0000,
                end: 0x0800_FFFF,
                page_size: 16 * 1024,
                mem_type: READABLE | ERASABLE | WRITEABLE,
            }
        );
        assert_eq!(
            segs[1],
            MemSegment {
                start: 0x0801_0000,
                end: 0x0801_FFFF,
                page_size: 64 * 1024,
                mem_type: READABLE | ERASABLE | WRITEABLE,
            }
        );
        assert_eq!(
            segs[2],
            MemSegment {
                start: 0x0802_0000,
                end: 0x0803_FFFF,
                page_size: 128 * 1024,
                mem_type: READABLE | ERASABLE | WRITEABLE,
            }
        );
    }

    #[test]
    fn starts_are_monotonic() {
        let layout = parse_memory_layout(
            "@Flash/0x08000000/04*016Kg,01*064Kg/0x1FFF0000/01*032Ka",
        )
        .unwrap();
        let starts: Vec<u32> = layout.segments().iter().map(|s| s.start).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn find_segment_returns_containing() {
        let layout =
            parse_memory_layout("@Internal Flash/0x08000000/04*016Kg,01*064Kg,01*128Kg").unwrap();
        assert_eq!(
            layout.find_segment(0x0800_4000).unwrap().page_size,
            16 * 1024
        );
        assert_eq!(
            layout.find_segment(0x0801_0000).unwrap().page_size,
            64 * 1024
        );
        assert_eq!(
            layout.find_segment(0x0803_FFFF).unwrap().page_size,
            128 * 1024
        );
        assert!(layout.find_segment(0x0804_0000).is_none());
        assert!(layout.find_segment(0x0000_0000).is_none());
    }

    #[test]
    fn add_segment_keeps_order_and_grows_by_one() {
        let mut layout = MemLayout::default();
        let seg = |start| MemSegment {
            start,
            end: start + 0xfff,
            page_size: 0x1000,
            mem_type: READABLE,
        };
        layout.add_segment(seg(0x2000));
        layout.add_segment(seg(0x0000));
        layout.add_segment(seg(0x1000));
        assert_eq!(layout.segments().len(), 3);
        let starts: Vec<u32> = layout.segments().iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0x0000, 0x1000, 0x2000]);
    }

    #[test]
    fn type_bits_decode_from_letter() {
        // 'a' = 0x61: readable only. 'e' = 0x65: readable | writeable.
        let layout = parse_memory_layout("@Opt/0x1FFFC000/01*016Ba,01*016Be").unwrap();
        let segs = layout.segments();
        assert!(segs[0].readable() && !segs[0].erasable() && !segs[0].writeable());
        assert!(segs[1].readable() && !segs[1].erasable() && segs[1].writeable());
    }

    #[test]
    fn byte_and_mega_units() {
        let layout = parse_memory_layout("@X/0x00000000/01*512Bg/0x10000000/01*001Mg").unwrap();
        let segs = layout.segments();
        assert_eq!(segs[0].end, 511);
        assert_eq!(segs[1].end, 0x1000_0000 + 1024 * 1024 - 1);
    }

    #[test]
    fn rejects_missing_at_sign() {
        assert!(parse_memory_layout("Internal Flash/0x08000000/04*016Kg").is_err());
    }

    #[test]
    fn rejects_garbage_address() {
        assert!(parse_memory_layout("@Flash/0xZZZZ/04*016Kg").is_err());
    }
}
