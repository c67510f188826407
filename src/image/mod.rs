//! Firmware images
//!
//! Images arrive as an ordered list of [`Section`]s (from an ELF or HEX
//! reader) and are flattened into one contiguous [`FirmwareImage`], with gaps
//! padded by a fill byte.

use std::path::Path;

use ihex::Record;
use log::debug;

mod version_info;

pub use self::version_info::{
    find_info_offset, BuildInfo, StampReport, Stamper, VersionInfo, DEFAULT_VCS_COMMAND,
    OFFSET_IMAGE_CRC, VCS_INFO_END, VCS_INFO_START, VERSION_INFO_SIZE,
};

use crate::error::{Error, Result};

pub const DEFAULT_GAP_FILL: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Load memory address
    pub lma: u32,
    /// Runtime address
    pub vma: u32,
    pub size: u32,
    /// `None` for sections that occupy no space in the image (e.g. `.bss`)
    pub data: Option<Vec<u8>>,
}

impl Section {
    pub fn new(name: impl Into<String>, lma: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            lma,
            vma: lma,
            size: data.len() as u32,
            data: Some(data),
        }
    }

    pub fn nobits(name: impl Into<String>, lma: u32, vma: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            lma,
            vma,
            size,
            data: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.lma as u64 + self.size as u64
    }
}

/// Start and end address of the loadable part of `sections`.
pub(crate) fn loadable_extent(sections: &[Section]) -> Option<(u32, u64)> {
    let mut loadable = sections.iter().filter(|s| s.data.is_some());
    let first = loadable.next()?;

    let (start, end) = loadable.fold((first.lma, first.end()), |(start, end), s| {
        (start.min(s.lma), end.max(s.end()))
    });
    Some((start, end))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    start_address: u32,
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(start_address: u32, data: Vec<u8>) -> Self {
        Self {
            start_address,
            data,
        }
    }

    /// Flattens the loadable sections, padding gaps with `fill`.
    pub fn from_sections(sections: &[Section], fill: u8) -> Result<Self> {
        let (start, end) = loadable_extent(sections)
            .ok_or_else(|| Error::Configuration("image has no loadable sections".into()))?;

        let len = usize::try_from(end - start as u64)
            .map_err(|_| Error::Configuration("image too large".into()))?;
        let mut data = vec![fill; len];

        for section in sections {
            let Some(bytes) = &section.data else {
                continue;
            };
            let offset = (section.lma - start) as usize;
            let size = bytes.len().min(section.size as usize);
            data[offset..offset + size].copy_from_slice(&bytes[..size]);
        }

        Ok(Self::new(start, data))
    }

    /// Parses Intel HEX text. Contiguous records are merged into sections.
    pub fn from_ihex(text: &str, fill: u8) -> Result<Self> {
        Self::from_sections(&ihex_sections(text)?, fill)
    }

    pub fn from_ihex_file(path: impl AsRef<Path>, fill: u8) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading \"{}\"", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_ihex(&text, fill)
    }

    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    pub fn end_address(&self) -> u64 {
        self.start_address as u64 + self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

pub fn ihex_sections(text: &str) -> Result<Vec<Section>> {
    let mut base: u32 = 0;
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();

    for record in ihex::Reader::new(text) {
        match record? {
            Record::Data { offset, value } => {
                let address = base.wrapping_add(offset as u32);
                match chunks.last_mut() {
                    Some((start, bytes)) if *start as u64 + bytes.len() as u64 == address as u64 => {
                        bytes.extend_from_slice(&value);
                    }
                    _ => chunks.push((address, value)),
                }
            }
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::EndOfFile => break,
            _ => {}
        }
    }

    chunks.sort_by_key(|(start, _)| *start);

    for pair in chunks.windows(2) {
        let (start, bytes) = &pair[0];
        if *start as u64 + bytes.len() as u64 > pair[1].0 as u64 {
            return Err(Error::Configuration(format!(
                "overlapping HEX records at {:#010x}",
                pair[1].0
            )));
        }
    }

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, (start, bytes))| Section::new(format!("hex{}", i), start, bytes))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "\
:020000040800F2
:10000000000102030405060708090A0B0C0D0E0F78
:0400100010111213A6
:040020002021222356
:00000001FF
";

    #[test]
    fn test_from_ihex_fills_gaps() {
        let image = FirmwareImage::from_ihex(HEX, 0xFF).unwrap();
        assert_eq!(image.start_address(), 0x0800_0000);
        assert_eq!(image.len(), 0x24);
        assert_eq!(&image.data()[..0x14], &(0u8..0x14).collect::<Vec<_>>()[..]);
        assert_eq!(&image.data()[0x14..0x20], &[0xFF; 12]);
        assert_eq!(&image.data()[0x20..], &[0x20, 0x21, 0x22, 0x23]);
    }

    #[test]
    fn test_ihex_merges_contiguous_records() {
        let sections = ihex_sections(HEX).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].lma, 0x0800_0000);
        assert_eq!(sections[0].size, 0x14);
        assert_eq!(sections[1].lma, 0x0800_0020);
    }

    #[test]
    fn test_from_sections_skips_nobits() {
        let sections = vec![
            Section::new(".isr_vector", 0x100, vec![1, 2, 3, 4]),
            Section::new(".text", 0x108, vec![5, 6]),
            Section::nobits(".bss", 0x2000_0000, 0x2000_0000, 0x400),
        ];
        let image = FirmwareImage::from_sections(&sections, 0x00).unwrap();
        assert_eq!(image.start_address(), 0x100);
        assert_eq!(image.data(), &[1, 2, 3, 4, 0, 0, 0, 0, 5, 6]);
    }

    #[test]
    fn test_no_loadable_sections() {
        let sections = vec![Section::nobits(".bss", 0, 0, 16)];
        assert!(FirmwareImage::from_sections(&sections, 0xFF).is_err());
    }

    #[test]
    fn test_bad_hex() {
        assert!(matches!(
            FirmwareImage::from_ihex(":10000000zz\n", 0xFF),
            Err(Error::HexFile(_))
        ));
    }
}
