use super::{
    source::SectorSource, BlockDevice, FatError, FatVolume, FAT32_ENTRY_MASK, FAT32_EOC,
    FAT_ENTRIES_PER_SECTOR,
};

/// Any value in the reserved end-of-chain range terminates a chain.
pub fn is_end_of_chain(value: u32) -> bool {
    (value & FAT32_ENTRY_MASK) >= FAT32_EOC
}

/// Returns the FAT entry for `cluster`, masked to its 28 significant bits.
pub fn lookup_cluster<D: BlockDevice>(
    dev: &mut D,
    volume: &FatVolume,
    cluster: u32,
) -> Result<u32, FatError<D::Error>> {
    if cluster < 2 {
        return Err(FatError::InvalidCluster(cluster));
    }
    let fat_sector = cluster / FAT_ENTRIES_PER_SECTOR;
    if fat_sector >= volume.fat_size_sectors {
        log::debug!(
            "fat: cluster {} lies past the FAT ({} sectors)",
            cluster,
            volume.fat_size_sectors
        );
        return Err(FatError::InvalidCluster(cluster));
    }
    let offset = ((cluster % FAT_ENTRIES_PER_SECTOR) * 4) as usize;
    let sector = dev.read_sector(volume.fat_start_sector() + fat_sector)?;
    let raw = u32::from_le_bytes([
        sector[offset],
        sector[offset + 1],
        sector[offset + 2],
        sector[offset + 3],
    ]);
    Ok(raw & FAT32_ENTRY_MASK)
}

/// Position inside a cluster chain, one sector at a time.
///
/// `next_cluster` is always the FAT entry of `current_cluster`, looked up
/// when the chain entered that cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterChain {
    current_cluster: u32,
    next_cluster: u32,
    sector_within_cluster: u8,
}

impl ClusterChain {
    /// Enters `start_cluster` and primes `source` with its first sector.
    pub fn init<D: BlockDevice, S: SectorSource>(
        dev: &mut D,
        volume: &FatVolume,
        source: &mut S,
        start_cluster: u32,
    ) -> Result<Self, FatError<D::Error>> {
        let next_cluster = match lookup_cluster(dev, volume, start_cluster) {
            Ok(0) | Err(FatError::InvalidCluster(_)) => {
                log::debug!("fat: cannot start chain at cluster {}", start_cluster);
                return Err(FatError::ChainInit(start_cluster));
            }
            Ok(next) => next,
            Err(err) => return Err(err),
        };
        let chain = Self {
            current_cluster: start_cluster,
            next_cluster,
            sector_within_cluster: 0,
        };
        source.prime(dev, chain.current_sector(volume))?;
        Ok(chain)
    }

    pub fn current_cluster(&self) -> u32 {
        self.current_cluster
    }

    pub fn next_cluster(&self) -> u32 {
        self.next_cluster
    }

    pub fn sector_within_cluster(&self) -> u8 {
        self.sector_within_cluster
    }

    pub fn current_sector(&self, volume: &FatVolume) -> u32 {
        volume.cluster_to_sector(self.current_cluster, self.sector_within_cluster)
    }

    /// Moves to the following sector, crossing into the next cluster when
    /// the current one is used up.
    ///
    /// Fails with [`FatError::EndOfChain`] past the last sector of the last
    /// cluster; the chain is left unchanged in that case.
    pub fn advance<D: BlockDevice, S: SectorSource>(
        &mut self,
        dev: &mut D,
        volume: &FatVolume,
        source: &mut S,
    ) -> Result<(), FatError<D::Error>> {
        // The FAT lookup below needs the bus.
        source.release(dev)?;
        if self.sector_within_cluster + 1 < volume.sectors_per_cluster {
            self.sector_within_cluster += 1;
        } else {
            if is_end_of_chain(self.next_cluster) {
                return Err(FatError::EndOfChain);
            }
            let cluster = self.next_cluster;
            let next_cluster = match lookup_cluster(dev, volume, cluster) {
                Ok(0) | Err(FatError::InvalidCluster(_)) => {
                    log::debug!("fat: chain broken at cluster {}", cluster);
                    return Err(FatError::BrokenChain(cluster));
                }
                Ok(next) => next,
                Err(err) => return Err(err),
            };
            self.current_cluster = cluster;
            self.next_cluster = next_cluster;
            self.sector_within_cluster = 0;
        }
        source.prime(dev, self.current_sector(volume))
    }
}
