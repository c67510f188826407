//! Bootloader session
//!
//! [`BootProtocol`] drives the device bootloader over the current connection
//! of a [`ConnectionManager`]. Every command is answered by exactly one
//! `BOOT_RESPONSE`, which the protocol receives through its own dispatcher
//! subscription. Flash writes are pipelined: up to `ack_window` writes may be
//! outstanding before the host waits for an acknowledgement.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::dispatcher::Subscription;
use crate::error::{Error, Result};
use crate::forge::crc32;
use crate::link::ConnectionManager;
use crate::protocols::apl::{
    BootEnter, BootEraseSector, BootReadData, BootResponse, BootVerify, BootWriteData, Message,
    MessageId, ShellText, MAX_DATA_CHUNK,
};

mod config;
mod types;
mod update;

pub use self::config::{
    BootConfig, DEFAULT_ACK_WINDOW, DEFAULT_RESET_DELAY, DEFAULT_RESPONSE_TIMEOUT,
};
pub use self::types::{
    sectors_covering, BootState, PhaseTimings, Sector, UpdateReport, VerifyReport,
    STM32F4_SECTORS,
};

/// Shell input that makes the running application reboot into the bootloader.
pub const RESET_COMMAND: &[u8] = b"\x03\nreset\n";

pub struct BootProtocol {
    manager: Arc<ConnectionManager>,
    responses: Subscription,
    config: BootConfig,
    state: BootState,
}

impl BootProtocol {
    /// Registers for bootloader responses on the manager's dispatcher.
    ///
    /// The registration lives as long as the returned value.
    pub fn new(manager: Arc<ConnectionManager>, config: BootConfig) -> Result<Self> {
        config.validate()?;

        let responses = manager.dispatcher().subscribe(MessageId::BootResponse);
        debug!("BootProtocol: subscribed as consumer {}", responses.id());

        Ok(Self {
            manager,
            responses,
            config,
            state: BootState::Idle,
        })
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    /// Deregisters explicitly, reporting dispatcher errors.
    pub fn close(self) -> Result<()> {
        self.responses.unsubscribe()
    }

    async fn send(&self, message: Message) -> Result<()> {
        let connection = self.manager.current()?;
        connection.send_message(&message).await
    }

    fn ensure_active(&self, command: &str) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} while bootloader is {}",
                command, self.state
            )))
        }
    }

    /// Waits for the next bootloader response.
    pub async fn get_response(&mut self) -> Result<BootResponse> {
        let frame = self
            .responses
            .recv_timeout(self.config.response_timeout)
            .await?;
        BootResponse::from_bytes(&frame)
    }

    async fn command(&mut self, message: Message) -> Result<BootResponse> {
        self.send(message).await?;
        self.get_response().await
    }

    /// Asks the running application to reboot into the bootloader.
    ///
    /// Best effort: nothing is acknowledged. Waits `reset_delay` afterwards.
    pub async fn reset_hack(&mut self) -> Result<()> {
        info!("Resetting device");
        self.send(Message::ShellFromPc(ShellText::new(RESET_COMMAND)))
            .await?;
        sleep(self.config.reset_delay).await;
        Ok(())
    }

    pub async fn enter(&mut self) -> Result<BootResponse> {
        info!("Entering bootloader");
        let response = self
            .command(Message::BootEnter(BootEnter {
                magic: self.config.enter_magic,
            }))
            .await?;

        if response.status() == Some(0) {
            warn!("Bootloader rejected enter command");
        }

        self.state = BootState::Entered;
        Ok(response)
    }

    /// Consumes one response if it arrives within the timeout.
    pub async fn discard_stale_response(&mut self) {
        match self.get_response().await {
            Ok(response) => debug!("Discarded stale response {:02x?}", &response.data[..]),
            Err(Error::Timeout) => {}
            Err(e) => debug!("Discarding stale response: {}", e),
        }
    }

    pub async fn erase_sector(&mut self, sector: u8) -> Result<BootResponse> {
        self.ensure_active("erase")?;
        self.state = BootState::Erasing;

        debug!("Erasing sector {}", sector);
        let response = self
            .command(Message::BootEraseSector(BootEraseSector { sector }))
            .await?;
        debug!("Erase sector {}: status {:?}", sector, response.status());
        Ok(response)
    }

    /// Reads up to [`MAX_DATA_CHUNK`] bytes of device memory.
    pub async fn read_data(&mut self, address: u32, length: u8) -> Result<Bytes> {
        self.ensure_active("read")?;

        if length as usize > MAX_DATA_CHUNK {
            return Err(Error::InvalidMessage(format!(
                "read of {} bytes exceeds {}",
                length, MAX_DATA_CHUNK
            )));
        }

        let response = self
            .command(Message::BootReadData(BootReadData { address, length }))
            .await?;

        if response.data.len() != length as usize {
            return Err(Error::InvalidMessage(format!(
                "read of {} bytes at {:#010x} returned {} bytes",
                length,
                address,
                response.data.len()
            )));
        }
        Ok(response.data)
    }

    /// Writes `data` at `address` in chunks of at most `chunk_size` bytes.
    ///
    /// With a window of `w`, the first `w` writes go out without waiting;
    /// after that each write is followed by one response, and the remaining
    /// responses are collected at the end. Every chunk is acknowledged
    /// exactly once. `progress` receives the number of bytes sent so far.
    /// Returns the number of chunks written.
    pub async fn write_data<F>(
        &mut self,
        address: u32,
        data: &[u8],
        ack_window: usize,
        mut progress: F,
    ) -> Result<usize>
    where
        F: FnMut(usize),
    {
        self.ensure_active("write")?;
        self.state = BootState::Writing;

        let mut pending = 0usize;
        let mut offset = 0usize;
        let mut chunks = 0usize;

        for chunk in data.chunks(self.config.chunk_size) {
            let chunk_address = u32::try_from(offset)
                .ok()
                .and_then(|offset| address.checked_add(offset))
                .ok_or_else(|| {
                    Error::InvalidMessage(format!(
                        "write of {} bytes at {:#010x} overflows the address space",
                        data.len(),
                        address
                    ))
                })?;

            let message = BootWriteData::new(chunk_address, Bytes::copy_from_slice(chunk))?;
            self.send(Message::BootWriteData(message)).await?;

            offset += chunk.len();
            chunks += 1;
            progress(offset);

            if pending >= ack_window {
                self.get_response().await?;
            } else {
                pending += 1;
            }
        }

        while pending > 0 {
            self.get_response().await?;
            pending -= 1;
        }

        debug!("Wrote {} bytes at {:#010x} in {} chunks", data.len(), address, chunks);
        Ok(chunks)
    }

    /// Compares the device CRC-32 of `[address, address + len)` with `data`.
    ///
    /// A mismatch is reported, not returned as an error; see
    /// [`VerifyReport::into_result`].
    pub async fn verify_data(&mut self, address: u32, data: &[u8]) -> Result<VerifyReport> {
        self.ensure_active("verify")?;
        self.state = BootState::Verifying;

        let length = u32::try_from(data.len())
            .map_err(|_| Error::InvalidMessage("verify length exceeds 32 bits".into()))?;

        let response = self
            .command(Message::BootVerify(BootVerify { address, length }))
            .await?;

        let report = VerifyReport {
            address,
            length,
            local_crc: crc32(data),
            remote_crc: response.crc()?,
        };

        if report.passed() {
            info!("Verify ok: crc {:#010x}", report.local_crc);
        } else {
            error!(
                "Verify failed: local crc {:#010x}, remote crc {:#010x}",
                report.local_crc, report.remote_crc
            );
        }

        Ok(report)
    }

    /// Leaves the bootloader and starts the application.
    pub async fn exit(&mut self) -> Result<BootResponse> {
        self.ensure_active("exit")?;

        info!("Starting application");
        let response = self.command(Message::BootExit).await?;
        self.state = BootState::Exited;
        Ok(response)
    }
}
