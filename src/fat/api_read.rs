use super::{
    cluster_utils, dir_scan, fat_mount, BlockDevice, Buffered, ClusterChain, DirListing,
    FatError, FatVolume, ResolvedFile, SectorSource, Streamed,
};
use crate::probe::SD_SECTOR_SIZE;

const SECTOR_BYTES: u32 = SD_SECTOR_SIZE as u32;

/// A file opened for sequential reading.
///
/// `position` counts bytes into the current sector and `remaining` the bytes
/// left from the start of that sector, so the end of the file is reached
/// when the two meet.
#[derive(Debug)]
pub struct OpenFile<S> {
    chain: Option<ClusterChain>,
    source: S,
    position: u32,
    remaining: u32,
    size: u32,
}

impl<S: SectorSource> OpenFile<S> {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn bytes_read(&self) -> u32 {
        self.size - self.remaining + self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.remaining
    }

    /// Cluster the next sector comes from; `None` for an empty file.
    pub fn current_cluster(&self) -> Option<u32> {
        self.chain.as_ref().map(ClusterChain::current_cluster)
    }

    /// Next byte, or `None` once `size` bytes were returned.
    ///
    /// Running out of chain before the declared size is
    /// [`FatError::ChainShorterThanFile`], never a quiet end of file.
    pub fn read_byte<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        volume: &FatVolume,
    ) -> Result<Option<u8>, FatError<D::Error>> {
        if self.position >= self.remaining {
            self.source.release(dev)?;
            return Ok(None);
        }
        let Some(chain) = self.chain.as_mut() else {
            return Ok(None);
        };

        if self.position >= SECTOR_BYTES {
            self.remaining -= SECTOR_BYTES;
            self.position -= SECTOR_BYTES;
            match chain.advance(dev, volume, &mut self.source) {
                Ok(()) => {}
                Err(FatError::EndOfChain) => {
                    log::warn!("fat: chain ends before the file's {} bytes", self.size);
                    return Err(FatError::ChainShorterThanFile);
                }
                Err(err) => return Err(err),
            }
        }

        let byte = self.source.byte(dev, self.position as usize)?;
        self.position += 1;
        if self.position >= self.remaining {
            self.source.release(dev)?;
        }
        Ok(Some(byte))
    }

    /// Releases a streaming transaction the file may still hold.
    pub fn close<D: BlockDevice>(mut self, dev: &mut D) -> Result<(), FatError<D::Error>> {
        self.source.release(dev)
    }
}

/// A mounted FAT32 volume on a borrowed block device.
pub struct Fat32<'d, D: BlockDevice> {
    device: &'d mut D,
    volume: FatVolume,
}

impl<'d, D: BlockDevice> Fat32<'d, D> {
    pub fn mount(device: &'d mut D) -> Result<Self, FatError<D::Error>> {
        let volume = fat_mount::mount(device)?;
        Ok(Self { device, volume })
    }

    pub fn volume(&self) -> &FatVolume {
        &self.volume
    }

    pub fn device(&mut self) -> &mut D {
        self.device
    }

    pub fn lookup_cluster(&mut self, cluster: u32) -> Result<u32, FatError<D::Error>> {
        cluster_utils::lookup_cluster(self.device, &self.volume, cluster)
    }

    pub fn resolve(&mut self, path: &str) -> Result<ResolvedFile, FatError<D::Error>> {
        dir_scan::resolve(self.device, &self.volume, path)
    }

    /// Opens `path` for buffered reads.
    pub fn open(&mut self, path: &str) -> Result<OpenFile<Buffered>, FatError<D::Error>> {
        self.open_with(path, Buffered::new())
    }

    /// Opens `path` for reads straight off the device. The first sector's
    /// transaction starts right away; nothing else may use the device until
    /// the file reaches its end or is closed.
    pub fn open_streaming(&mut self, path: &str) -> Result<OpenFile<Streamed>, FatError<D::Error>> {
        self.open_with(path, Streamed::new())
    }

    pub fn open_with<S: SectorSource>(
        &mut self,
        path: &str,
        mut source: S,
    ) -> Result<OpenFile<S>, FatError<D::Error>> {
        let file = self.resolve(path)?;
        let chain = if file.size == 0 {
            None
        } else {
            Some(ClusterChain::init(
                self.device,
                &self.volume,
                &mut source,
                file.cluster,
            )?)
        };
        log::debug!(
            "fat: opened {:?}, cluster {}, {} bytes",
            path,
            file.cluster,
            file.size
        );
        Ok(OpenFile {
            chain,
            source,
            position: 0,
            remaining: file.size,
            size: file.size,
        })
    }

    pub fn read_byte<S: SectorSource>(
        &mut self,
        file: &mut OpenFile<S>,
    ) -> Result<Option<u8>, FatError<D::Error>> {
        file.read_byte(self.device, &self.volume)
    }

    /// Fills `buf` from `file` and returns how many bytes were written; less
    /// than `buf.len()` only at the end of the file.
    pub fn read<S: SectorSource>(
        &mut self,
        file: &mut OpenFile<S>,
        buf: &mut [u8],
    ) -> Result<usize, FatError<D::Error>> {
        let mut written = 0usize;
        for slot in buf.iter_mut() {
            match file.read_byte(self.device, &self.volume)? {
                Some(byte) => *slot = byte,
                None => break,
            }
            written += 1;
        }
        Ok(written)
    }

    pub fn close<S: SectorSource>(&mut self, file: OpenFile<S>) -> Result<(), FatError<D::Error>> {
        file.close(self.device)
    }

    pub fn list_dir<F>(&mut self, path: &str, visitor: F) -> Result<usize, FatError<D::Error>>
    where
        F: FnMut(&DirListing<'_>),
    {
        dir_scan::list_dir(self.device, &self.volume, path, visitor)
    }
}
