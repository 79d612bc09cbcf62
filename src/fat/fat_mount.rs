use super::{BlockDevice, FatError};
use crate::probe::SD_SECTOR_SIZE;

const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
const EXTENDED_BOOT_SIGNATURE_OFFSET: usize = 0x42;
const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;

/// Layout constants of a mounted FAT32 volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatVolume {
    pub partition_first_sector: u32,
    pub sectors_per_cluster: u8,
    pub fat_count: u8,
    pub fat_offset_sectors: u16,
    pub fat_size_sectors: u32,
    pub total_sectors: u32,
    pub root_dir_cluster: u32,
    /// `partition_first_sector + fat_offset_sectors + fat_size_sectors * fat_count`.
    pub cluster_region_start_sector: u32,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
}

impl FatVolume {
    pub fn fat_start_sector(&self) -> u32 {
        self.partition_first_sector
            .wrapping_add(self.fat_offset_sectors as u32)
    }

    pub fn cluster_to_sector(&self, cluster: u32, sector_within_cluster: u8) -> u32 {
        self.cluster_region_start_sector
            .wrapping_add(
                cluster
                    .wrapping_sub(2)
                    .wrapping_mul(self.sectors_per_cluster as u32),
            )
            .wrapping_add(sector_within_cluster as u32)
    }

    /// Label with its space padding removed.
    pub fn label(&self) -> &str {
        let end = self
            .volume_label
            .iter()
            .rposition(|&b| b != b' ' && b != 0)
            .map_or(0, |idx| idx + 1);
        core::str::from_utf8(&self.volume_label[..end]).unwrap_or("")
    }
}

fn read_le_u16(sector: &[u8; SD_SECTOR_SIZE], offset: usize) -> u16 {
    u16::from_le_bytes([sector[offset], sector[offset + 1]])
}

fn read_le_u32(sector: &[u8; SD_SECTOR_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([
        sector[offset],
        sector[offset + 1],
        sector[offset + 2],
        sector[offset + 3],
    ])
}

/// Reads the boot sector at the start of the device's partition.
pub fn mount<D: BlockDevice>(dev: &mut D) -> Result<FatVolume, FatError<D::Error>> {
    let first_sector = dev.partition_first_sector().ok_or(FatError::NoPartition)?;
    let boot = dev.read_sector(first_sector)?;
    let volume = parse_boot_sector(boot, first_sector)?;

    log::debug!(
        "fat: {} sectors per cluster, {} FATs of {} sectors, root cluster {}",
        volume.sectors_per_cluster,
        volume.fat_count,
        volume.fat_size_sectors,
        volume.root_dir_cluster
    );
    log::debug!(
        "fat: volume {:04X}-{:04X} label {:?}",
        volume.volume_id >> 16,
        volume.volume_id & 0xFFFF,
        volume.label()
    );
    Ok(volume)
}

pub fn parse_boot_sector<E>(
    boot: &[u8; SD_SECTOR_SIZE],
    partition_first_sector: u32,
) -> Result<FatVolume, FatError<E>> {
    if boot[BOOT_SIGNATURE_OFFSET] != 0x55 || boot[BOOT_SIGNATURE_OFFSET + 1] != 0xAA {
        log::debug!("fat: invalid signature in boot sector");
        return Err(FatError::InvalidSignature);
    }
    if boot[EXTENDED_BOOT_SIGNATURE_OFFSET] != EXTENDED_BOOT_SIGNATURE {
        log::debug!("fat: invalid extended boot signature");
        return Err(FatError::InvalidSignature);
    }

    let bytes_per_sector = read_le_u16(boot, 0x0B);
    if bytes_per_sector != SD_SECTOR_SIZE as u16 {
        log::debug!("fat: bytes per sector {} != 512", bytes_per_sector);
        return Err(FatError::UnsupportedSectorSize(bytes_per_sector));
    }

    let sectors_per_cluster = boot[0x0D];
    let fat_count = boot[0x10];
    if sectors_per_cluster == 0 || fat_count == 0 {
        return Err(FatError::InvalidBootSector);
    }
    let fat_offset_sectors = read_le_u16(boot, 0x0E);

    // FAT32 always fills the 32-bit fields; the 16-bit ones win when set.
    let total_sectors = match read_le_u16(boot, 0x13) {
        0 => read_le_u32(boot, 0x20),
        total => total as u32,
    };
    let fat_size_sectors = match read_le_u16(boot, 0x16) {
        0 => read_le_u32(boot, 0x24),
        size => size as u32,
    };

    let root_dir_cluster = read_le_u32(boot, 0x2C);
    let volume_id = read_le_u32(boot, 0x43);
    let mut volume_label = [0u8; 11];
    volume_label.copy_from_slice(&boot[0x47..0x47 + 11]);

    let cluster_region_start_sector = partition_first_sector
        .wrapping_add(fat_offset_sectors as u32)
        .wrapping_add(fat_size_sectors.wrapping_mul(fat_count as u32));

    Ok(FatVolume {
        partition_first_sector,
        sectors_per_cluster,
        fat_count,
        fat_offset_sectors,
        fat_size_sectors,
        total_sectors,
        root_dir_cluster,
        cluster_region_start_sector,
        volume_id,
        volume_label,
    })
}
