//! Firmware Update Transport Library
//!
//! This library flashes firmware onto STM32 based devices through their
//! resident bootloader, over a serial port or a TCP serial bridge, and
//! prepares images for it by embedding version information and a forged
//! CRC-32.
//!
//! # Features
//! - Serial and TCP connection support with transparent reconnect
//! - COBS/R framing with CRC-16 integrity checks
//! - Publish/subscribe routing of device messages by ID
//! - Pipelined flash writes with CRC verification
//! - Intel HEX loading
//! - CRC-32 forging, including the STM32 hardware CRC unit variant
//!
//! # Protocol Stack
//! - Application Protocol Layer (APL): typed bootloader and shell messages
//! - Link Protocol Layer (LPL): COBS/R frames with CRC-16
//!
//! # Examples
//!
//! ## Serial Device Update
//! ```no_run
//! use flashlink::{BootConfig, Target};
//!
//! #[tokio::main]
//! async fn main() -> flashlink::Result<()> {
//!     let target = Target::serial("/dev/ttyUSB0");
//!     let report = flashlink::update_firmware(&target, "firmware.hex", BootConfig::new()).await?;
//!     report.verify.into_result()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Network Device Update
//! ```no_run
//! use flashlink::{BootConfig, BootProtocol, ConnectionManager, LinkConfig, Target};
//!
//! #[tokio::main]
//! async fn main() -> flashlink::Result<()> {
//!     let manager = ConnectionManager::new(LinkConfig::default());
//!     manager.connect(&"tcp://192.168.1.100".parse::<Target>()?).await?;
//!
//!     let mut boot = BootProtocol::new(manager.clone(), BootConfig::new().with_ack_window(4))?;
//!     boot.write_hex_file("firmware.hex", |percent, text| println!("{:3}% {}", percent, text))
//!         .await?;
//!
//!     manager.disconnect().await
//! }
//! ```
//!
//! ## Stamping an Image
//! ```no_run
//! use flashlink::{BuildInfo, CrcMode, Stamper};
//!
//! fn main() -> flashlink::Result<()> {
//!     let mut data = std::fs::read("firmware.bin")?;
//!     let build = BuildInfo::collect(flashlink::DEFAULT_VCS_COMMAND)?;
//!     Stamper::new().with_mode(CrcMode::Stm32Hw).stamp_raw(&mut data, &build)?;
//!     std::fs::write("firmware.bin", data)?;
//!     Ok(())
//! }
//! ```

mod console;
mod dfu;
mod dispatcher;
mod error;
mod forge;
mod image;
mod link;
mod protocols;

pub use console::{send_shell, ConsoleLogger, LineBuffer};
pub use dfu::{
    sectors_covering, BootConfig, BootProtocol, BootState, PhaseTimings, Sector, UpdateReport,
    VerifyReport, DEFAULT_ACK_WINDOW, DEFAULT_RESET_DELAY, DEFAULT_RESPONSE_TIMEOUT,
    RESET_COMMAND, STM32F4_SECTORS,
};
pub use dispatcher::{Dispatcher, SubscriberId, Subscription};
pub use error::{Error, Result};
pub use forge::{crc32, forge, forge_stm32, stm32, CrcMode, Gf2Matrix};
pub use image::{
    find_info_offset, ihex_sections, BuildInfo, FirmwareImage, Section, StampReport, Stamper,
    VersionInfo, DEFAULT_GAP_FILL, DEFAULT_VCS_COMMAND, OFFSET_IMAGE_CRC, VCS_INFO_END,
    VCS_INFO_START, VERSION_INFO_SIZE,
};
pub use link::{
    list_serial_ports, AsyncStream, ByteStream, Connection, ConnectionManager, ConnectionStats,
    LinkConfig, StatsSnapshot, StreamReader, StreamWriter, Target, DEFAULT_BAUD_RATE,
    DEFAULT_TCP_PORT,
};
pub use protocols::apl::{
    BootEnter, BootEraseSector, BootReadData, BootResponse, BootVerify, BootWriteData, Message,
    MessageId, ShellText, MAX_DATA_CHUNK,
};
pub use protocols::lpl::{
    cobsr, crc16, decode_packet, encode_packet, FrameCodec, FrameError, MAX_FRAME_LEN,
    MAX_MESSAGE_LEN,
};

use std::path::Path;

use log::info;

/// Connects to `target`, flashes an Intel HEX file and disconnects.
///
/// Device console output is logged under the `device` target meanwhile.
pub async fn update_firmware(
    target: &Target,
    firmware: impl AsRef<Path>,
    config: BootConfig,
) -> Result<UpdateReport> {
    let manager = ConnectionManager::new(LinkConfig::default());
    manager.connect(target).await?;

    let _console = ConsoleLogger::spawn(manager.dispatcher());
    let mut boot = BootProtocol::new(manager.clone(), config)?;

    let report = boot
        .write_hex_file(firmware, |percent, text| info!("{:3}% {}", percent, text))
        .await;

    drop(boot);
    manager.disconnect().await?;
    report
}

/// Stamps a raw binary file in place.
pub fn stamp_binary_file(
    path: impl AsRef<Path>,
    stamper: &Stamper,
    build: &BuildInfo,
) -> Result<StampReport> {
    let path = path.as_ref();
    info!("loading \"{}\"...", path.display());
    let mut data = std::fs::read(path)?;

    let report = stamper.stamp_raw(&mut data, build)?;

    info!("saving \"{}\"...", path.display());
    std::fs::write(path, data)?;
    Ok(report)
}
