use embedded_hal::{delay::DelayNs, digital::OutputPin, spi::SpiBus};

use super::{
    helpers::{csd_structure, decode_sector_count},
    CardRegisters, SdCard, SdCardError, SdCardStatus, SD_CMD0, SD_CMD1, SD_CMD10, SD_CMD58,
    SD_CMD9, SD_MIN_WAKE_BYTES,
};
use crate::{
    clock::{Clock, Deadline},
    power::power_on_settle,
};

impl<SPI, CS, CLK> SdCard<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
{
    /// Brings the card up, captures CSD/CID/OCR and locates the FAT32
    /// partition.
    ///
    /// Meant to run once at boot: unless `idle_retry_limit` is set the
    /// idle-state wait retries for as long as the card keeps answering busy.
    pub fn init<D: DelayNs>(&mut self, delay: &mut D) -> Result<SdCardStatus, SdCardError> {
        self.ensure_idle()?;
        self.invalidate();

        power_on_settle(delay, self.config.power_on_delay_ms);
        self.deselect()?;
        self.send_dummy_bytes(self.config.wake_bytes.max(SD_MIN_WAKE_BYTES))?;
        self.wait_ready()?;

        let reset_r1 = match self.send_command(SD_CMD0, 0, 0x95, &mut []) {
            Ok(r1) => r1,
            Err(SdCardError::Timeout(_)) => 0xFF,
            Err(err) => return Err(err),
        };
        log::debug!("sd: reset result 0x{:02X}", reset_r1);
        if reset_r1 != 0x01 {
            return Err(SdCardError::ResetFailed(reset_r1));
        }

        self.wait_leave_idle()?;

        let csd = self.read_register(SD_CMD9)?;
        log::debug!("sd: CSD {:02X?}", csd);
        let structure = csd_structure(&csd);
        log::debug!("sd: CSD_STRUCTURE {}", structure);
        let sector_count = match decode_sector_count(&csd) {
            Some(count) => count,
            None => {
                log::warn!("sd: CSD structure version {} not supported", structure);
                return Err(SdCardError::UnsupportedCard(structure));
            }
        };
        log::debug!("sd: {} sectors", sector_count);

        let cid = self.read_register(SD_CMD10)?;
        log::debug!("sd: CID {:02X?}", cid);

        let mut ocr_bytes = [0u8; 4];
        let ocr_r1 = match self.send_command(SD_CMD58, 0, 0xFF, &mut ocr_bytes) {
            Ok(r1) => r1,
            Err(SdCardError::Timeout(_)) => 0xFF,
            Err(err) => return Err(err),
        };
        if ocr_r1 != 0x00 {
            return Err(SdCardError::RegisterRead {
                cmd: SD_CMD58,
                r1: ocr_r1,
            });
        }
        let ocr = u32::from_be_bytes(ocr_bytes);
        log::debug!("sd: OCR {:08X}", ocr);

        self.sector_count = sector_count;
        self.cached_sector_index = None;
        self.registers = Some(CardRegisters {
            csd,
            cid,
            ocr,
            csd_structure: structure,
        });

        let partition = match self.scan_partition_table() {
            Ok(partition) => partition,
            Err(err) => {
                log::warn!("sd: partition scan failed: {}", err);
                return Err(err);
            }
        };
        log::debug!("sd: init finished");

        Ok(SdCardStatus {
            sector_count,
            capacity_bytes: sector_count as u64 * super::SD_SECTOR_SIZE as u64,
            partition,
        })
    }

    /// The card holds its data line low while it is still powering up.
    fn wait_ready(&mut self) -> Result<(), SdCardError> {
        let deadline = Deadline::after(&self.clock, self.config.ready_timeout_ms);
        loop {
            if self.transfer_byte(0xFF)? == 0xFF {
                return Ok(());
            }
            if deadline.expired(&self.clock) {
                return Err(SdCardError::NotReady);
            }
        }
    }

    fn wait_leave_idle(&mut self) -> Result<(), SdCardError> {
        let mut attempts = 0u32;
        loop {
            let r1 = match self.send_command(SD_CMD1, 0, 0xFF, &mut []) {
                Ok(r1) => r1,
                Err(SdCardError::Timeout(_)) => 0xFF,
                Err(err) => return Err(err),
            };
            if r1 == 0x00 {
                return Ok(());
            }
            attempts = attempts.saturating_add(1);
            if let Some(limit) = self.config.idle_retry_limit {
                if attempts >= limit {
                    return Err(SdCardError::StillIdle(r1));
                }
            }
        }
    }

    fn read_register(&mut self, cmd: u8) -> Result<[u8; 16], SdCardError> {
        let r1 = match self.send_command_hold_cs(cmd, 0, 0xFF, &mut []) {
            Ok(r1) => r1,
            Err(SdCardError::Timeout(_)) => return Err(SdCardError::RegisterRead { cmd, r1: 0xFF }),
            Err(err) => return Err(err),
        };
        if r1 != 0x00 {
            self.end_transaction()?;
            log::debug!("sd: CMD{} result 0x{:02X}", cmd, r1);
            return Err(SdCardError::RegisterRead { cmd, r1 });
        }

        if let Err(err) = self.wait_data_token(cmd) {
            self.end_transaction()?;
            return Err(match err {
                SdCardError::Timeout(_) => SdCardError::RegisterRead { cmd, r1: 0xFF },
                SdCardError::DataTokenUnexpected { token, .. } => {
                    SdCardError::RegisterRead { cmd, r1: token }
                }
                other => other,
            });
        }

        let mut block = [0u8; 16];
        for slot in &mut block {
            *slot = self.transfer_byte(0xFF)?;
        }
        // Read and discard CRC16.
        self.transfer_byte(0xFF)?;
        self.transfer_byte(0xFF)?;
        self.end_transaction()?;
        Ok(block)
    }
}
