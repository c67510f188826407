//! Version information block embedded in firmware images
//!
//! The firmware reserves a 184 byte record framed by two ASCII markers. At
//! build time the record is filled with build metadata and the image CRC
//! word is forged so that the checksum of the complete image equals a fixed
//! target, which the bootloader or application can verify in place.

use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};

use super::{loadable_extent, FirmwareImage, Section, DEFAULT_GAP_FILL};
use crate::error::{Error, Result};
use crate::forge::{stm32, CrcMode};

pub const VCS_INFO_START: &[u8; 16] = b"VCSINFO2_START->";
pub const VCS_INFO_END: &[u8; 16] = b"<---VCSINFO2_END";
pub const VERSION_INFO_SIZE: usize = 184;
pub const OFFSET_IMAGE_CRC: usize = 16;

pub const DEFAULT_VCS_COMMAND: &str = "git describe --always --dirty";

const OFFSET_IMAGE_START: usize = 20;
const OFFSET_IMAGE_SIZE: usize = 24;
const OFFSET_VCS_ID: usize = 28;
const OFFSET_BUILD_USER: usize = 60;
const OFFSET_BUILD_HOST: usize = 76;
const OFFSET_BUILD_DATE: usize = 92;
const OFFSET_BUILD_TIME: usize = 108;
const OFFSET_PRODUCT_NAME: usize = 124;
const OFFSET_MAJOR: usize = 156;
const OFFSET_MINOR: usize = 160;
const OFFSET_PATCH: usize = 164;
const OFFSET_END: usize = 168;

const VCS_ID_LEN: usize = 32;
const FIELD_LEN: usize = 16;
const PRODUCT_NAME_LEN: usize = 32;

/// Offset of the first start marker that is followed by a matching end
/// marker.
pub fn find_info_offset(data: &[u8]) -> Option<usize> {
    let mut from = 0;

    while from < data.len() {
        let found = data[from..]
            .windows(VCS_INFO_START.len())
            .position(|w| w == VCS_INFO_START)?;
        let offset = from + found;

        let end = data.get(offset + OFFSET_END..offset + VERSION_INFO_SIZE);
        if end == Some(&VCS_INFO_END[..]) {
            return Some(offset);
        }

        from = offset + VCS_INFO_START.len();
    }

    None
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_str(buf: &[u8], offset: usize, len: usize) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Truncates to `len` bytes and pads with NULs.
fn write_str(buf: &mut [u8], offset: usize, len: usize, value: &str) {
    let field = &mut buf[offset..offset + len];
    let bytes = value.as_bytes();
    let n = bytes.len().min(len);
    field[..n].copy_from_slice(&bytes[..n]);
    field[n..].fill(0);
}

/// Decoded version information record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub image_crc: u32,
    pub image_start: u32,
    pub image_size: u32,
    pub vcs_id: String,
    pub build_user: String,
    pub build_host: String,
    pub build_date: String,
    pub build_time: String,
    pub product_name: String,
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

impl VersionInfo {
    /// Parses the record starting at `offset`.
    pub fn read_at(data: &[u8], offset: usize) -> Result<Self> {
        let record = offset
            .checked_add(VERSION_INFO_SIZE)
            .and_then(|end| data.get(offset..end))
            .ok_or(Error::MarkerNotFound)?;

        if &record[..16] != VCS_INFO_START || &record[OFFSET_END..] != VCS_INFO_END {
            return Err(Error::MarkerNotFound);
        }

        Ok(Self {
            image_crc: read_u32(record, OFFSET_IMAGE_CRC),
            image_start: read_u32(record, OFFSET_IMAGE_START),
            image_size: read_u32(record, OFFSET_IMAGE_SIZE),
            vcs_id: read_str(record, OFFSET_VCS_ID, VCS_ID_LEN),
            build_user: read_str(record, OFFSET_BUILD_USER, FIELD_LEN),
            build_host: read_str(record, OFFSET_BUILD_HOST, FIELD_LEN),
            build_date: read_str(record, OFFSET_BUILD_DATE, FIELD_LEN),
            build_time: read_str(record, OFFSET_BUILD_TIME, FIELD_LEN),
            product_name: read_str(record, OFFSET_PRODUCT_NAME, PRODUCT_NAME_LEN),
            major: read_u32(record, OFFSET_MAJOR) as i32,
            minor: read_u32(record, OFFSET_MINOR) as i32,
            patch: read_u32(record, OFFSET_PATCH) as i32,
        })
    }

    /// Locates and parses the record in `data`.
    pub fn find(data: &[u8]) -> Result<Self> {
        let offset = find_info_offset(data).ok_or(Error::MarkerNotFound)?;
        Self::read_at(data, offset)
    }
}

/// Build metadata written into the record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildInfo {
    pub vcs_id: String,
    pub user: String,
    pub host: String,
    pub date: String,
    pub time: String,
}

impl BuildInfo {
    /// Runs the version control command through the shell and captures the
    /// user, host and current UTC date and time.
    pub fn collect(vcs_command: &str) -> Result<Self> {
        debug!("running \"{}\"...", vcs_command);

        let output = if cfg!(windows) {
            Command::new("cmd").args(["/C", vcs_command]).output()?
        } else {
            Command::new("sh").args(["-c", vcs_command]).output()?
        };

        if !output.status.success() {
            return Err(Error::Configuration(format!(
                "\"{}\" failed: {}",
                vcs_command,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let vcs_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("{}", vcs_id);

        let (date, time) = utc_date_time(SystemTime::now());

        Ok(Self {
            vcs_id,
            user: env_first(&["USER", "USERNAME", "LOGNAME"]),
            host: hostname(),
            date,
            time,
        })
    }

    fn write_into(&self, record: &mut [u8]) {
        write_str(record, OFFSET_VCS_ID, VCS_ID_LEN, &self.vcs_id);
        write_str(record, OFFSET_BUILD_USER, FIELD_LEN, &self.user);
        write_str(record, OFFSET_BUILD_HOST, FIELD_LEN, &self.host);
        write_str(record, OFFSET_BUILD_DATE, FIELD_LEN, &self.date);
        write_str(record, OFFSET_BUILD_TIME, FIELD_LEN, &self.time);
    }
}

fn env_first(names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}

fn hostname() -> String {
    let host = env_first(&["HOSTNAME", "COMPUTERNAME"]);
    if !host.is_empty() {
        return host;
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// `YYYY-MM-DD` and `HH:MM:SS` in UTC.
fn utc_date_time(now: SystemTime) -> (String, String) {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);

    (
        format!("{:04}-{:02}-{:02}", year, month, day),
        format!("{:02}:{:02}:{:02}", rem / 3600, rem / 60 % 60, rem % 60),
    )
}

// Howard Hinnant's days-to-civil conversion
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Outcome of a successful stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampReport {
    /// Section holding the record, `None` for raw images
    pub section: Option<String>,
    /// Offset of the record inside its section or raw buffer
    pub info_offset: usize,
    pub image_start: u32,
    pub image_size: u32,
    /// Value written to the CRC field
    pub image_crc: u32,
}

/// Fills the version information record and forges the image CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamper {
    pub mode: CrcMode,
    pub target_crc: u32,
    pub force: bool,
    pub gap_fill: u8,
}

impl Default for Stamper {
    fn default() -> Self {
        Self {
            mode: CrcMode::Standard,
            target_crc: 0,
            force: false,
            gap_fill: DEFAULT_GAP_FILL,
        }
    }
}

impl Stamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: CrcMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_target_crc(mut self, target_crc: u32) -> Self {
        self.target_crc = target_crc;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_gap_fill(mut self, gap_fill: u8) -> Self {
        self.gap_fill = gap_fill;
        self
    }

    fn check_unstamped(&self, record: &[u8]) -> Result<()> {
        let existing = read_u32(record, OFFSET_IMAGE_CRC);
        if existing != 0 && !self.force {
            return Err(Error::AlreadyStamped(existing));
        }
        Ok(())
    }

    fn check_patch_window(&self, len: usize, offset: usize) -> Result<()> {
        if self.mode == CrcMode::Stm32Hw {
            stm32::check_word_aligned(len, offset)?;
        }
        Ok(())
    }

    /// Stamps a flat binary whose first byte is the image start.
    ///
    /// `data` is left untouched when an error is returned before forging.
    pub fn stamp_raw(&self, data: &mut [u8], build: &BuildInfo) -> Result<StampReport> {
        debug!("searching for structure marker...");
        let offset = find_info_offset(data).ok_or(Error::MarkerNotFound)?;
        debug!("  found at {}", offset);

        let record_range = offset..offset + VERSION_INFO_SIZE;
        self.check_unstamped(&data[record_range.clone()])?;

        let crc_offset = offset + OFFSET_IMAGE_CRC;
        self.check_patch_window(data.len(), crc_offset)?;

        let image_size = u32::try_from(data.len())
            .map_err(|_| Error::Configuration("image too large".into()))?;

        let record = &mut data[record_range];
        build.write_into(record);
        write_u32(record, OFFSET_IMAGE_START, 0);
        write_u32(record, OFFSET_IMAGE_SIZE, image_size);

        let image_crc = self.mode.patch(self.target_crc, data, crc_offset)?;

        info!(
            "image_crc = {:#010x}, image_size = {}",
            image_crc, image_size
        );

        Ok(StampReport {
            section: None,
            info_offset: offset,
            image_start: 0,
            image_size,
            image_crc,
        })
    }

    /// Stamps a sectioned image. The CRC is forged over the flattened image
    /// and written back into the section holding the record.
    pub fn stamp_sections(
        &self,
        sections: &mut [Section],
        build: &BuildInfo,
    ) -> Result<StampReport> {
        debug!("searching for structure marker...");
        let (index, offset) = sections
            .iter()
            .enumerate()
            .find_map(|(i, s)| {
                s.data
                    .as_deref()
                    .and_then(find_info_offset)
                    .map(|offset| (i, offset))
            })
            .ok_or(Error::MarkerNotFound)?;
        debug!("  found in {} at {}", sections[index].name, offset);

        let record_range = offset..offset + VERSION_INFO_SIZE;
        if let Some(data) = &sections[index].data {
            self.check_unstamped(&data[record_range.clone()])?;
        }

        let (start, end) = loadable_extent(sections).ok_or(Error::MarkerNotFound)?;
        let flat_len = (end - start as u64) as usize;
        let crc_offset = (sections[index].lma - start) as usize + offset + OFFSET_IMAGE_CRC;
        self.check_patch_window(flat_len, crc_offset)?;

        let image_size = sections
            .last()
            .map(|last| last.end() - start as u64)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or_else(|| Error::Configuration("image too large".into()))?;

        if let Some(data) = sections[index].data.as_mut() {
            let record = &mut data[record_range.clone()];
            build.write_into(record);
            write_u32(record, OFFSET_IMAGE_START, start);
            write_u32(record, OFFSET_IMAGE_SIZE, image_size);
        }

        let mut image = FirmwareImage::from_sections(sections, self.gap_fill)?;
        let image_crc = self
            .mode
            .patch(self.target_crc, image.data_mut(), crc_offset)?;

        if let Some(data) = sections[index].data.as_mut() {
            write_u32(&mut data[record_range], OFFSET_IMAGE_CRC, image_crc);
        }

        info!(
            "image_crc = {:#010x}, image_start = {:#010x}, image_size = {}",
            image_crc, start, image_size
        );

        Ok(StampReport {
            section: Some(sections[index].name.clone()),
            info_offset: offset,
            image_start: start,
            image_size,
            image_crc,
        })
    }
}
