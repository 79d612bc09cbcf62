use core::fmt;

use embedded_hal::{digital::OutputPin, spi::SpiBus};

use crate::{
    clock::Clock,
    probe::{SdCard, SdCardError, SD_SECTOR_SIZE},
};

mod api_read;
mod cluster_utils;
mod dir_scan;
mod fat_mount;
mod names_lfn;
mod source;


pub use api_read::{Fat32, OpenFile};
pub use cluster_utils::{is_end_of_chain, lookup_cluster, ClusterChain};
pub use dir_scan::{list_dir, resolve, resolve_directory, DirListing, DirectoryEntry, ResolvedFile};
pub use fat_mount::{mount, parse_boot_sector, FatVolume};
pub use names_lfn::{
    short_name_checksum, short_name_from_segment, short_name_to_text, LongNameAccumulator,
};
pub use source::{Buffered, SectorSource, Streamed};

pub const DIR_ENTRY_SIZE: usize = 32;
pub const DIR_ENTRIES_PER_SECTOR: usize = SD_SECTOR_SIZE / DIR_ENTRY_SIZE;
pub const FAT_ENTRIES_PER_SECTOR: u32 = (SD_SECTOR_SIZE / 4) as u32;
pub const FAT32_EOC: u32 = 0x0FFF_FFF8;
pub const FAT32_EOC_MARKER: u32 = 0x0FFF_FFFF;
pub const FAT32_ENTRY_MASK: u32 = 0x0FFF_FFFF;
const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME: u8 = 0x08;

/// Sector-granular read access as the filesystem layer needs it.
///
/// `read_sector` serves one buffered sector; the stream calls move a single
/// sector's payload straight from the device to the caller. A stream must be
/// closed with `end_stream` before any other call.
pub trait BlockDevice {
    type Error: fmt::Debug;

    fn read_sector(&mut self, index: u32) -> Result<&[u8; SD_SECTOR_SIZE], Self::Error>;

    fn begin_stream(&mut self, index: u32) -> Result<(), Self::Error>;

    fn stream_byte(&mut self) -> Result<u8, Self::Error>;

    fn end_stream(&mut self) -> Result<(), Self::Error>;

    /// First sector of the FAT32 partition, once the partition table was read.
    fn partition_first_sector(&self) -> Option<u32>;
}

impl<SPI, CS, CLK> BlockDevice for SdCard<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
{
    type Error = SdCardError;

    fn read_sector(&mut self, index: u32) -> Result<&[u8; SD_SECTOR_SIZE], SdCardError> {
        SdCard::read_sector(self, index)
    }

    fn begin_stream(&mut self, index: u32) -> Result<(), SdCardError> {
        self.read_sector_streaming(index)
    }

    fn stream_byte(&mut self) -> Result<u8, SdCardError> {
        SdCard::stream_byte(self)
    }

    fn end_stream(&mut self) -> Result<(), SdCardError> {
        self.finish_streaming()
    }

    fn partition_first_sector(&self) -> Option<u32> {
        self.partition().map(|partition| partition.first_sector)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatError<E> {
    Device(E),
    NoPartition,
    InvalidSignature,
    UnsupportedSectorSize(u16),
    InvalidBootSector,
    InvalidCluster(u32),
    ChainInit(u32),
    BrokenChain(u32),
    /// The chain ended where more data was expected. Directory walks treat
    /// this as exhaustion.
    EndOfChain,
    /// A file's chain ran out before its declared size was reached.
    ChainShorterThanFile,
    InvalidPath,
    NotFound,
    NotDirectory,
    StreamNotOpen,
    BufferTooSmall { needed: usize },
}

impl<E> From<E> for FatError<E> {
    fn from(value: E) -> Self {
        Self::Device(value)
    }
}

impl<E: fmt::Display> fmt::Display for FatError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(err) => write!(f, "device: {err}"),
            Self::NoPartition => f.write_str("no partition located"),
            Self::InvalidSignature => f.write_str("invalid boot sector signature"),
            Self::UnsupportedSectorSize(size) => write!(f, "unsupported sector size {size}"),
            Self::InvalidBootSector => f.write_str("invalid boot sector layout"),
            Self::InvalidCluster(cluster) => write!(f, "invalid cluster {cluster}"),
            Self::ChainInit(cluster) => write!(f, "cannot start chain at cluster {cluster}"),
            Self::BrokenChain(cluster) => write!(f, "broken chain at cluster {cluster}"),
            Self::EndOfChain => f.write_str("end of cluster chain"),
            Self::ChainShorterThanFile => f.write_str("cluster chain shorter than file size"),
            Self::InvalidPath => f.write_str("invalid path"),
            Self::NotFound => f.write_str("not found"),
            Self::NotDirectory => f.write_str("not a directory"),
            Self::StreamNotOpen => f.write_str("no sector primed for streaming"),
            Self::BufferTooSmall { needed } => write!(f, "buffer too small, need {needed} bytes"),
        }
    }
}
