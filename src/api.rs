use core::fmt;

use embedded_hal::{delay::DelayNs, digital::OutputPin, spi::SpiBus};

use crate::{
    clock::Clock,
    fat::{self, DirListing, Fat32, FatError, FatVolume},
    probe::{SdCard, SdCardError, SdCardStatus},
    SD_PATH_MAX,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdIoError {
    Card(SdCardError),
    Fat(FatError<SdCardError>),
}

impl From<SdCardError> for SdIoError {
    fn from(value: SdCardError) -> Self {
        Self::Card(value)
    }
}

impl From<FatError<SdCardError>> for SdIoError {
    fn from(value: FatError<SdCardError>) -> Self {
        match value {
            FatError::Device(err) => Self::Card(err),
            other => Self::Fat(other),
        }
    }
}

impl fmt::Display for SdIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Card(err) => write!(f, "sd: {err}"),
            Self::Fat(err) => write!(f, "fat: {err}"),
        }
    }
}

/// Powers the card up, captures its registers and mounts the FAT32
/// partition it carries.
pub fn bring_up<SPI, CS, CLK, D>(
    card: &mut SdCard<SPI, CS, CLK>,
    delay: &mut D,
) -> Result<(SdCardStatus, FatVolume), SdIoError>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
{
    let status = card.init(delay)?;
    let volume = fat::mount(card)?;
    log::info!(
        "sd: {} MiB card, FAT32 volume {:?} at sector {}",
        status.capacity_bytes / (1024 * 1024),
        volume.label(),
        volume.partition_first_sector
    );
    Ok((status, volume))
}

/// Reads the whole file at `path` into `out` and returns its length.
pub fn read_file<SPI, CS, CLK>(
    card: &mut SdCard<SPI, CS, CLK>,
    path: &str,
    out: &mut [u8],
) -> Result<usize, SdIoError>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
{
    check_path(path)?;
    let mut fat = Fat32::mount(card)?;
    let mut file = fat.open(path)?;
    let needed = file.size() as usize;
    if out.len() < needed {
        fat.close(file)?;
        return Err(SdIoError::Fat(FatError::BufferTooSmall { needed }));
    }
    let read = fat.read(&mut file, &mut out[..needed])?;
    fat.close(file)?;
    Ok(read)
}

pub fn list_dir<SPI, CS, CLK, F>(
    card: &mut SdCard<SPI, CS, CLK>,
    path: &str,
    visitor: F,
) -> Result<usize, SdIoError>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
    F: FnMut(&DirListing<'_>),
{
    check_path(path)?;
    let mut fat = Fat32::mount(card)?;
    Ok(fat.list_dir(path, visitor)?)
}

fn check_path(path: &str) -> Result<(), SdIoError> {
    if path.is_empty() || path.len() > SD_PATH_MAX {
        return Err(SdIoError::Fat(FatError::InvalidPath));
    }
    Ok(())
}
