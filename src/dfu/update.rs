use std::path::Path;
use std::time::Instant;

use log::{error, info};

use super::{BootProtocol, PhaseTimings, UpdateReport};
use crate::error::Result;
use crate::image::FirmwareImage;

impl BootProtocol {
    /// Loads an Intel HEX file and flashes it with [`BootProtocol::write_image`].
    pub async fn write_hex_file<P>(
        &mut self,
        path: impl AsRef<Path>,
        mut progress: P,
    ) -> Result<UpdateReport>
    where
        P: FnMut(u8, &str),
    {
        let path = path.as_ref();
        progress(0, &format!("Loading {}", path.display()));

        let image = FirmwareImage::from_ihex_file(path, self.config.gap_filling)?;
        info!("Loaded \"{}\"", path.display());

        self.write_image(&image, progress).await
    }

    /// Full update sequence: reset, enter, erase, write, verify, exit.
    ///
    /// The first `reserved_head` bytes (the vector table) are written last,
    /// after the rest of the image was verified. A verify mismatch is logged
    /// and reported in the result; the sequence still completes.
    pub async fn write_image<P>(
        &mut self,
        image: &FirmwareImage,
        mut progress: P,
    ) -> Result<UpdateReport>
    where
        P: FnMut(u8, &str),
    {
        let start = image.start_address();
        let data = image.data();
        let head_len = self.config.reserved_head.min(data.len());
        let (head, body) = data.split_at(head_len);
        let body_address = start.wrapping_add(head_len as u32);

        info!("  Start {:#010x}", start);
        info!("  End   {:#010x}", image.end_address().saturating_sub(1));

        progress(2, "Resetting");
        self.reset_hack().await?;

        progress(5, "Entering bootloader");
        self.enter().await?;
        self.discard_stale_response().await;

        let t0 = Instant::now();

        let sectors = self.config.erase_sectors.clone();
        let sector_count = sectors.len().max(1);
        for (i, sector) in sectors.enumerate() {
            let percent = 10 + 10 * i / sector_count;
            progress(percent as u8, &format!("Erasing sector {}...", sector));
            self.erase_sector(sector).await?;
        }

        let t_erase = Instant::now();

        let body_len = body.len().max(1);
        let ack_window = self.config.ack_window;
        self.write_data(body_address, body, ack_window, |written| {
            let percent = 20 + 60 * written / body_len;
            progress(
                percent as u8,
                &format!("Writing {:#010x}...", body_address as usize + written),
            );
        })
        .await?;

        let t_write = Instant::now();

        progress(85, "Verifying");
        let verify = self.verify_data(body_address, body).await?;
        if !verify.passed() {
            error!("Continuing after checksum error");
        }

        let t_verify = Instant::now();

        progress(90, &format!("Writing first {} bytes", head.len()));
        self.write_data(start, head, 0, |_| {}).await?;

        progress(95, "Starting application");
        self.exit().await?;

        progress(100, "Done.");

        let t_total = Instant::now();
        let timings = PhaseTimings {
            erase: t_erase - t0,
            write: t_write - t_erase,
            verify: t_verify - t_write,
            total: t_total - t0,
        };

        info!("Done.");
        info!("  Erase:  {:?}", timings.erase);
        info!("  Write:  {:?}", timings.write);
        info!("  Verify: {:?}", timings.verify);
        info!("  Total:  {:?}", timings.total);

        Ok(UpdateReport { verify, timings })
    }
}
