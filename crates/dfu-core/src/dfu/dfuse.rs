//! Standard DFU vs. ST DfuSe detection.
//!
//! DfuSe devices report `bcdDFUVersion` 0x011A and describe their memory in
//! the interface name, e.g. `@Internal Flash  /0x08000000/04*016Kg,01*064Kg`.

use std::sync::LazyLock;

use regex::Regex;

use super::properties::FunctionalProperties;

static LAYOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@?([^/]*?)\s*/0x([\da-fA-F]+)U?/(.*)").expect("valid regex"));
static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\*(\d+)([KMB ])([a-g])(?:,|$)").expect("valid regex"));

/// Contiguous run of equally sized pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    pub start: u32,
    pub end: u32,
    pub page_size: u32,
    /// Bit 0 readable, bit 1 erasable, bit 2 writable.
    pub memory_type: u8,
}

impl MemorySegment {
    pub fn readable(&self) -> bool {
        self.memory_type & 1 != 0
    }

    pub fn erasable(&self) -> bool {
        self.memory_type & 2 != 0
    }

    pub fn writable(&self) -> bool {
        self.memory_type & 4 != 0
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub name: String,
    pub segments: Vec<MemorySegment>,
}

impl MemoryLayout {
    /// Parse a DfuSe interface name. `None` if it does not describe memory.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let captures = LAYOUT_RE.captures(descriptor)?;
        let mut addr = u32::from_str_radix(&captures[2], 16).ok()?;

        let mut segments = Vec::new();
        for seg in SEGMENT_RE.captures_iter(&captures[3]) {
            let pages: u32 = seg[1].parse().ok()?;
            let size: u32 = seg[2].parse().ok()?;
            let page_size = match &seg[3] {
                "K" => size.checked_mul(1024)?,
                "M" => size.checked_mul(1024 * 1024)?,
                _ => size,
            };
            let memory_type = seg[4].as_bytes()[0] & 7;
            let end = addr.checked_add(pages.checked_mul(page_size)?)?;
            segments.push(MemorySegment {
                start: addr,
                end,
                page_size,
                memory_type,
            });
            addr = end;
        }

        if segments.is_empty() {
            return None;
        }
        Some(Self {
            name: captures[1].to_string(),
            segments,
        })
    }

    pub fn start_address(&self) -> Option<u32> {
        self.segments.first().map(|s| s.start)
    }

    pub fn segment_at(&self, addr: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }
}

/// Protocol flavour, decided once at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuVariant {
    Standard,
    DfuSe { layout: Option<MemoryLayout> },
}

impl DfuVariant {
    pub fn detect(properties: &FunctionalProperties, interface_name: Option<&str>) -> Self {
        if properties.is_dfuse() {
            DfuVariant::DfuSe {
                layout: interface_name.and_then(MemoryLayout::parse),
            }
        } else {
            DfuVariant::Standard
        }
    }

    pub fn is_dfuse(&self) -> bool {
        matches!(self, DfuVariant::DfuSe { .. })
    }

    pub fn start_address(&self) -> Option<u32> {
        match self {
            DfuVariant::DfuSe { layout: Some(layout) } => layout.start_address(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_parse() {
        let layout =
            MemoryLayout::parse("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();
        assert_eq!(layout.name, "Internal Flash");
        assert_eq!(layout.segments.len(), 3);
        assert_eq!(layout.segments[0].start, 0x0800_0000);
        assert_eq!(layout.segments[0].page_size, 16 * 1024);
        assert_eq!(layout.segments[1].start, 0x0801_0000);
        assert_eq!(layout.segments[2].end, 0x0810_0000);
        assert!(layout.segments[0].writable() && layout.segments[0].erasable());
        assert_eq!(layout.segment_at(0x0801_0004), Some(&layout.segments[1]));
    }

    #[test]
    fn test_layout_single_byte_pages() {
        let layout = MemoryLayout::parse("@Option Bytes   /0x5200201C/01*128 e").unwrap();
        assert_eq!(layout.name, "Option Bytes");
        assert_eq!(layout.segments[0].page_size, 128);
        assert!(layout.segments[0].readable() && !layout.segments[0].erasable());
    }

    #[test]
    fn test_layout_rejects_plain_names() {
        assert_eq!(MemoryLayout::parse("MCUBOOT"), None);
        assert_eq!(MemoryLayout::parse("image-0"), None);
    }

    #[test]
    fn test_variant_detection() {
        let standard = FunctionalProperties::default();
        assert_eq!(DfuVariant::detect(&standard, Some("image-0")), DfuVariant::Standard);

        let dfuse = FunctionalProperties {
            dfu_version: 0x011A,
            ..standard
        };
        let variant = DfuVariant::detect(&dfuse, Some("@Flash /0x08000000/02*128Kg"));
        assert!(variant.is_dfuse());
        assert_eq!(variant.start_address(), Some(0x0800_0000));
        assert_eq!(
            DfuVariant::detect(&dfuse, None),
            DfuVariant::DfuSe { layout: None }
        );
    }
}
