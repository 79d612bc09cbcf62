use super::{BlockDevice, FatError};
use crate::probe::SD_SECTOR_SIZE;

/// Where the bytes of the sector a chain currently points at come from.
///
/// Both implementations see the same sequence of calls: `prime` when the
/// chain lands on a sector, `byte` with non-decreasing offsets, `release`
/// when the reader is done before the end of the sector.
pub trait SectorSource {
    fn prime<D: BlockDevice>(&mut self, dev: &mut D, sector: u32) -> Result<(), FatError<D::Error>>;

    fn byte<D: BlockDevice>(&mut self, dev: &mut D, offset: usize) -> Result<u8, FatError<D::Error>>;

    fn release<D: BlockDevice>(&mut self, dev: &mut D) -> Result<(), FatError<D::Error>>;
}

/// Copies each sector into the device's sector buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Buffered {
    sector: Option<u32>,
}

impl Buffered {
    pub const fn new() -> Self {
        Self { sector: None }
    }

    pub fn sector(&self) -> Option<u32> {
        self.sector
    }
}

impl SectorSource for Buffered {
    fn prime<D: BlockDevice>(&mut self, dev: &mut D, sector: u32) -> Result<(), FatError<D::Error>> {
        self.sector = None;
        dev.read_sector(sector)?;
        self.sector = Some(sector);
        Ok(())
    }

    fn byte<D: BlockDevice>(&mut self, dev: &mut D, offset: usize) -> Result<u8, FatError<D::Error>> {
        let sector = self.sector.ok_or(FatError::StreamNotOpen)?;
        // A FAT lookup may have evicted the buffer since priming; this is a
        // cache hit otherwise.
        let data = dev.read_sector(sector)?;
        Ok(data[offset % SD_SECTOR_SIZE])
    }

    fn release<D: BlockDevice>(&mut self, _dev: &mut D) -> Result<(), FatError<D::Error>> {
        Ok(())
    }
}

/// Pulls each byte directly off the bus, holding the device transaction open
/// between calls. The transaction closes by itself after the 512th byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Streamed {
    open: bool,
    consumed: usize,
}

impl Streamed {
    pub const fn new() -> Self {
        Self {
            open: false,
            consumed: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl SectorSource for Streamed {
    fn prime<D: BlockDevice>(&mut self, dev: &mut D, sector: u32) -> Result<(), FatError<D::Error>> {
        self.release(dev)?;
        dev.begin_stream(sector)?;
        self.open = true;
        self.consumed = 0;
        Ok(())
    }

    fn byte<D: BlockDevice>(&mut self, dev: &mut D, offset: usize) -> Result<u8, FatError<D::Error>> {
        if !self.open || offset < self.consumed {
            return Err(FatError::StreamNotOpen);
        }
        while self.consumed < offset {
            dev.stream_byte()?;
            self.consumed += 1;
        }
        let byte = dev.stream_byte()?;
        self.consumed += 1;
        if self.consumed >= SD_SECTOR_SIZE {
            self.open = false;
            dev.end_stream()?;
        }
        Ok(byte)
    }

    fn release<D: BlockDevice>(&mut self, dev: &mut D) -> Result<(), FatError<D::Error>> {
        if self.open {
            self.open = false;
            dev.end_stream()?;
        }
        Ok(())
    }
}
