//! Read-only SD card + FAT32 driver for microcontrollers.
//!
//! The card is driven in SPI mode over any `embedded-hal` 1.0 `SpiBus` with a
//! separate chip-select `OutputPin`. One 512-byte sector buffer lives inside
//! [`probe::SdCard`]; everything above it borrows that buffer, so at most one
//! file and one directory walk are in flight at a time.
#![cfg_attr(not(test), no_std)]

pub mod api;
pub mod clock;
pub mod fat;
pub mod power;
pub mod probe;

#[cfg(feature = "esp32")]
pub mod esp;

pub use clock::{Clock, Deadline};
pub use fat::{BlockDevice, Buffered, Fat32, FatError, OpenFile, SectorSource, Streamed};
pub use power::{power_on_settle, SD_POWER_SETTLE_MS};
pub use probe::{SdCard, SdCardConfig, SdCardError, SD_SECTOR_SIZE};

pub const SD_PATH_MAX: usize = 64;
