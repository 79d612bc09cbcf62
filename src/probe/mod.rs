use core::fmt;

use embedded_hal::{digital::OutputPin, spi::SpiBus};

mod helpers;
mod init;
mod io;
mod mbr;

pub use helpers::{decode_sector_count, extract_bits};
pub use mbr::parse_partition_table;

const SD_CMD0: u8 = 0;
const SD_CMD1: u8 = 1;
const SD_CMD9: u8 = 9;
const SD_CMD10: u8 = 10;
const SD_CMD17: u8 = 17;
const SD_CMD58: u8 = 58;
const SD_DATA_TOKEN: u8 = 0xFE;
pub const SD_SECTOR_SIZE: usize = 512;
/// 80 clocks with chip select high before the first command.
pub const SD_MIN_WAKE_BYTES: u16 = 10;

pub const MBR_SIGNATURE_OFFSET: usize = 0x1FE;
pub const MBR_PARTITION_TABLE_OFFSET: usize = 0x1BE;
pub const MBR_PARTITION_RECORD_SIZE: usize = 16;

/// How the partition-table scan decides a record holds a FAT32 volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartitionTypeMatch {
    /// Any type byte with a bit of `0x0C` set.
    #[default]
    Masked,
    /// Only `0x0C`, FAT32 with LBA addressing.
    Fat32LbaOnly,
}

impl PartitionTypeMatch {
    pub fn accepts(self, partition_type: u8) -> bool {
        match self {
            Self::Masked => partition_type & 0x0C != 0,
            Self::Fat32LbaOnly => partition_type == 0x0C,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdCardConfig {
    pub timeout_ms: u32,
    pub power_on_delay_ms: u32,
    pub wake_bytes: u16,
    pub ready_timeout_ms: u32,
    pub idle_retry_limit: Option<u32>,
    pub partition_match: PartitionTypeMatch,
}

impl Default for SdCardConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            power_on_delay_ms: crate::SD_POWER_SETTLE_MS,
            wake_bytes: 512,
            ready_timeout_ms: 1000,
            idle_retry_limit: None,
            partition_match: PartitionTypeMatch::Masked,
        }
    }
}

impl SdCardConfig {
    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_power_on_delay_ms(mut self, delay_ms: u32) -> Self {
        self.power_on_delay_ms = delay_ms;
        self
    }

    /// At least [`SD_MIN_WAKE_BYTES`] are always sent.
    pub fn with_wake_bytes(mut self, bytes: u16) -> Self {
        self.wake_bytes = bytes.max(SD_MIN_WAKE_BYTES);
        self
    }

    pub fn with_ready_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.ready_timeout_ms = timeout_ms;
        self
    }

    pub fn with_idle_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.idle_retry_limit = limit;
        self
    }

    pub fn with_partition_match(mut self, policy: PartitionTypeMatch) -> Self {
        self.partition_match = policy;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdCardError {
    Spi(embedded_hal::spi::ErrorKind),
    ChipSelect(embedded_hal::digital::ErrorKind),
    NotReady,
    ResetFailed(u8),
    StillIdle(u8),
    RegisterRead { cmd: u8, r1: u8 },
    UnsupportedCard(u8),
    Timeout(u8),
    CommandRejected { cmd: u8, r1: u8 },
    DataTokenUnexpected { cmd: u8, token: u8 },
    OutOfRange(u32),
    InvalidMbrSignature,
    PartitionNotFound,
    NotInitialized,
    TransactionOpen,
    NoTransaction,
    /// All 512 payload bytes were taken; the stream still needs finishing.
    StreamExhausted,
}

impl fmt::Display for SdCardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(kind) => write!(f, "spi error: {kind:?}"),
            Self::ChipSelect(kind) => write!(f, "chip select error: {kind:?}"),
            Self::NotReady => f.write_str("card never released the data line"),
            Self::ResetFailed(r1) => write!(f, "software reset answered r1=0x{r1:02X}"),
            Self::StillIdle(r1) => write!(f, "card did not leave idle state, r1=0x{r1:02X}"),
            Self::RegisterRead { cmd, r1 } => {
                write!(f, "register read CMD{cmd} failed, r1=0x{r1:02X}")
            }
            Self::UnsupportedCard(version) => {
                write!(f, "unsupported CSD structure version {version}")
            }
            Self::Timeout(cmd) => write!(f, "CMD{cmd} timed out"),
            Self::CommandRejected { cmd, r1 } => write!(f, "CMD{cmd} rejected, r1=0x{r1:02X}"),
            Self::DataTokenUnexpected { cmd, token } => {
                write!(f, "CMD{cmd} returned data token 0x{token:02X}")
            }
            Self::OutOfRange(sector) => write!(f, "sector {sector} is beyond the card"),
            Self::InvalidMbrSignature => f.write_str("invalid MBR signature"),
            Self::PartitionNotFound => f.write_str("no active FAT32 LBA partition"),
            Self::NotInitialized => f.write_str("card not initialized"),
            Self::TransactionOpen => f.write_str("a streaming read is still open"),
            Self::NoTransaction => f.write_str("no streaming read is open"),
            Self::StreamExhausted => f.write_str("streamed sector fully read, finish it"),
        }
    }
}

/// Raw identification registers captured during bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CardRegisters {
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub ocr: u32,
    pub csd_structure: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub partition_type: u8,
    pub first_sector: u32,
    pub sector_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdCardStatus {
    pub sector_count: u32,
    pub capacity_bytes: u64,
    pub partition: Partition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StreamState {
    sector: u32,
    remaining: u16,
}

/// SD card in SPI mode with a one-sector read cache.
///
/// The cache is trusted only while `cached_sector_index` names the last read
/// that ran to completion. Anything that may leave the buffer half written
/// clears the index first.
pub struct SdCard<SPI, CS, CLK> {
    spi: SPI,
    cs: CS,
    clock: CLK,
    config: SdCardConfig,
    registers: Option<CardRegisters>,
    sector_count: u32,
    cached_sector_index: Option<u32>,
    cached_sector: [u8; SD_SECTOR_SIZE],
    partition: Option<Partition>,
    stream: Option<StreamState>,
}

impl<SPI, CS, CLK> SdCard<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS, clock: CLK) -> Self {
        Self::with_config(spi, cs, clock, SdCardConfig::default())
    }

    /// Chip select is left alone until [`init`](Self::init) drives it high.
    pub fn with_config(spi: SPI, cs: CS, clock: CLK, config: SdCardConfig) -> Self {
        Self {
            spi,
            cs,
            clock,
            config,
            registers: None,
            sector_count: 0,
            cached_sector_index: None,
            cached_sector: [0; SD_SECTOR_SIZE],
            partition: None,
            stream: None,
        }
    }

    pub fn config(&self) -> &SdCardConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.registers.is_some()
    }

    pub fn registers(&self) -> Option<&CardRegisters> {
        self.registers.as_ref()
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    pub fn partition(&self) -> Option<Partition> {
        self.partition
    }

    pub fn cached_sector_index(&self) -> Option<u32> {
        self.cached_sector_index
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Forgets everything learned during bring-up.
    pub fn invalidate(&mut self) {
        self.registers = None;
        self.sector_count = 0;
        self.cached_sector_index = None;
        self.partition = None;
    }

    pub fn release(self) -> (SPI, CS, CLK) {
        (self.spi, self.cs, self.clock)
    }
}
