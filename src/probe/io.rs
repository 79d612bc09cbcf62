use embedded_hal::{
    digital::{Error as _, OutputPin},
    spi::{Error as _, SpiBus},
};

use super::{
    SdCard, SdCardError, StreamState, SD_CMD17, SD_DATA_TOKEN, SD_SECTOR_SIZE,
};
use crate::clock::{Clock, Deadline};

impl<SPI, CS, CLK> SdCard<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
{
    /// Loads `index` into the sector buffer and returns it.
    ///
    /// A cache hit costs no bus traffic. On failure the buffer is only
    /// distrusted if the payload transfer had begun.
    pub fn read_sector(&mut self, index: u32) -> Result<&[u8; SD_SECTOR_SIZE], SdCardError> {
        if self.cached_sector_index == Some(index) {
            return Ok(&self.cached_sector);
        }
        self.ensure_idle()?;
        if !self.is_initialized() {
            return Err(SdCardError::NotInitialized);
        }
        self.check_range(index)?;

        self.begin_sector_read(index)?;

        self.cached_sector_index = None;
        let result = self.receive_payload();
        let closed = self.end_transaction();
        result?;
        closed?;
        self.cached_sector_index = Some(index);
        Ok(&self.cached_sector)
    }

    /// Like [`read_sector`](Self::read_sector), but stops once the data token
    /// arrives so the caller can pull the 512 payload bytes one at a time
    /// with [`stream_byte`](Self::stream_byte).
    ///
    /// The transaction holds chip select until
    /// [`finish_streaming`](Self::finish_streaming) runs. Every other command
    /// fails with [`SdCardError::TransactionOpen`] until then.
    pub fn read_sector_streaming(&mut self, index: u32) -> Result<(), SdCardError> {
        self.ensure_idle()?;
        if !self.is_initialized() {
            return Err(SdCardError::NotInitialized);
        }
        self.check_range(index)?;

        // The payload bypasses the buffer; whatever it caches stays valid.
        self.begin_sector_read(index)?;
        self.stream = Some(StreamState {
            sector: index,
            remaining: SD_SECTOR_SIZE as u16,
        });
        Ok(())
    }

    pub fn stream_byte(&mut self) -> Result<u8, SdCardError> {
        let Some(state) = self.stream.as_mut() else {
            return Err(SdCardError::NoTransaction);
        };
        if state.remaining == 0 {
            // Only the CRC is left and that belongs to the completion step.
            return Err(SdCardError::StreamExhausted);
        }
        state.remaining -= 1;
        self.transfer_byte(0xFF)
    }

    /// Drains whatever payload is left plus the two CRC bytes and releases
    /// chip select.
    pub fn finish_streaming(&mut self) -> Result<(), SdCardError> {
        let Some(state) = self.stream.take() else {
            return Err(SdCardError::NoTransaction);
        };
        if state.remaining > 0 {
            log::trace!(
                "sd: sector {} stream closed with {} bytes unread",
                state.sector,
                state.remaining
            );
        }
        let drained = self.drain_stream(state.remaining);
        let closed = self.end_transaction();
        drained?;
        closed
    }

    fn drain_stream(&mut self, remaining: u16) -> Result<(), SdCardError> {
        self.send_dummy_bytes(remaining)?;
        // Discard data CRC16.
        self.transfer_byte(0xFF)?;
        self.transfer_byte(0xFF)?;
        Ok(())
    }

    fn check_range(&self, index: u32) -> Result<(), SdCardError> {
        if index >= self.sector_count {
            log::debug!(
                "sd: sector 0x{:X} is beyond the card (0x{:X} sectors)",
                index,
                self.sector_count
            );
            return Err(SdCardError::OutOfRange(index));
        }
        Ok(())
    }

    /// CMD17 up to and including the data token. Chip select stays asserted
    /// on success and is released on any failure.
    fn begin_sector_read(&mut self, index: u32) -> Result<(), SdCardError> {
        let r1 = self.send_command_hold_cs(SD_CMD17, index, 0xFF, &mut [])?;
        if r1 != 0x00 {
            self.end_transaction()?;
            return Err(SdCardError::CommandRejected { cmd: SD_CMD17, r1 });
        }
        if let Err(err) = self.wait_data_token(SD_CMD17) {
            self.end_transaction()?;
            return Err(err);
        }
        Ok(())
    }

    fn receive_payload(&mut self) -> Result<(), SdCardError> {
        self.cached_sector.fill(0xFF);
        self.spi
            .transfer_in_place(&mut self.cached_sector)
            .map_err(|err| SdCardError::Spi(err.kind()))?;
        // Discard data CRC16.
        self.transfer_byte(0xFF)?;
        self.transfer_byte(0xFF)?;
        Ok(())
    }

    pub(super) fn ensure_idle(&self) -> Result<(), SdCardError> {
        if self.stream.is_some() {
            return Err(SdCardError::TransactionOpen);
        }
        Ok(())
    }

    pub(super) fn send_command(
        &mut self,
        cmd: u8,
        arg: u32,
        crc: u8,
        extra_response: &mut [u8],
    ) -> Result<u8, SdCardError> {
        self.send_command_inner(cmd, arg, crc, extra_response, true)
    }

    pub(super) fn send_command_hold_cs(
        &mut self,
        cmd: u8,
        arg: u32,
        crc: u8,
        extra_response: &mut [u8],
    ) -> Result<u8, SdCardError> {
        self.send_command_inner(cmd, arg, crc, extra_response, false)
    }

    fn send_command_inner(
        &mut self,
        cmd: u8,
        arg: u32,
        crc: u8,
        extra_response: &mut [u8],
        release_cs_after: bool,
    ) -> Result<u8, SdCardError> {
        let frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];

        self.select()?;
        let result = self.exchange_command(cmd, &frame, extra_response);
        if result.is_err() || release_cs_after {
            self.end_transaction()?;
        }
        result
    }

    fn exchange_command(
        &mut self,
        cmd: u8,
        frame: &[u8; 6],
        extra_response: &mut [u8],
    ) -> Result<u8, SdCardError> {
        for &byte in frame {
            self.transfer_byte(byte)?;
        }

        let deadline = Deadline::after(&self.clock, self.config.timeout_ms);
        let r1 = loop {
            let r1 = self.transfer_byte(0xFF)?;
            if (r1 & 0x80) == 0 {
                break r1;
            }
            if deadline.expired(&self.clock) {
                return Err(SdCardError::Timeout(cmd));
            }
        };

        for slot in extra_response {
            *slot = self.transfer_byte(0xFF)?;
        }
        Ok(r1)
    }

    pub(super) fn wait_data_token(&mut self, cmd: u8) -> Result<(), SdCardError> {
        let deadline = Deadline::after(&self.clock, self.config.timeout_ms);
        loop {
            let token = self.transfer_byte(0xFF)?;
            if token == SD_DATA_TOKEN {
                return Ok(());
            }
            if token != 0xFF {
                return Err(SdCardError::DataTokenUnexpected { cmd, token });
            }
            if deadline.expired(&self.clock) {
                return Err(SdCardError::Timeout(cmd));
            }
        }
    }

    pub(super) fn send_dummy_bytes(&mut self, count: u16) -> Result<(), SdCardError> {
        for _ in 0..count {
            self.transfer_byte(0xFF)?;
        }
        Ok(())
    }

    pub(super) fn transfer_byte(&mut self, byte: u8) -> Result<u8, SdCardError> {
        let mut frame = [byte];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|err| SdCardError::Spi(err.kind()))?;
        Ok(frame[0])
    }

    fn select(&mut self) -> Result<(), SdCardError> {
        self.cs
            .set_low()
            .map_err(|err| SdCardError::ChipSelect(err.kind()))
    }

    pub(super) fn deselect(&mut self) -> Result<(), SdCardError> {
        self.cs
            .set_high()
            .map_err(|err| SdCardError::ChipSelect(err.kind()))
    }

    pub(super) fn end_transaction(&mut self) -> Result<(), SdCardError> {
        self.deselect()?;
        self.transfer_byte(0xFF)?;
        Ok(())
    }
}
