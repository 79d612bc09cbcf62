use embedded_hal::{digital::OutputPin, spi::SpiBus};

use super::{
    Partition, PartitionTypeMatch, SdCard, SdCardError, MBR_PARTITION_RECORD_SIZE,
    MBR_PARTITION_TABLE_OFFSET, MBR_SIGNATURE_OFFSET, SD_SECTOR_SIZE,
};
use crate::clock::Clock;

impl<SPI, CS, CLK> SdCard<SPI, CS, CLK>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CLK: Clock,
{
    /// Reads the MBR and remembers the first active FAT32 LBA partition.
    pub fn scan_partition_table(&mut self) -> Result<Partition, SdCardError> {
        let policy = self.config.partition_match;
        let sector = self.read_sector(0)?;
        let partition = parse_partition_table(sector, policy)?;
        log::debug!(
            "sd: found FAT32 (with LBA) type 0x{:02X} at sector {} of size {} MiB",
            partition.partition_type,
            partition.first_sector,
            partition.sector_count / 0x800
        );
        self.partition = Some(partition);
        Ok(partition)
    }
}

fn read_le_u32(sector: &[u8; SD_SECTOR_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([
        sector[offset],
        sector[offset + 1],
        sector[offset + 2],
        sector[offset + 3],
    ])
}

/// Picks the first record whose status has the active bit set and whose
/// type the policy accepts.
pub fn parse_partition_table(
    sector: &[u8; SD_SECTOR_SIZE],
    policy: PartitionTypeMatch,
) -> Result<Partition, SdCardError> {
    if sector[MBR_SIGNATURE_OFFSET] != 0x55 || sector[MBR_SIGNATURE_OFFSET + 1] != 0xAA {
        log::debug!("sd: invalid signature in MBR");
        return Err(SdCardError::InvalidMbrSignature);
    }

    for idx in 0..4usize {
        let base = MBR_PARTITION_TABLE_OFFSET + idx * MBR_PARTITION_RECORD_SIZE;
        let status = sector[base];
        if status & 0x80 == 0 {
            continue;
        }
        let partition_type = sector[base + 4];
        if !policy.accepts(partition_type) {
            log::debug!(
                "sd: unsupported partition type 0x{:02X}, looking for FAT32 with LBA",
                partition_type
            );
            continue;
        }
        return Ok(Partition {
            partition_type,
            first_sector: read_le_u32(sector, base + 8),
            sector_count: read_le_u32(sector, base + 12),
        });
    }

    Err(SdCardError::PartitionNotFound)
}
