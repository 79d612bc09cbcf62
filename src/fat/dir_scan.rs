use core::ops::ControlFlow;

use super::{
    names_lfn::{segment_matches, short_name_to_text, LongNameAccumulator},
    source::Buffered,
    BlockDevice, ClusterChain, FatError, FatVolume, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME,
    DIR_ENTRIES_PER_SECTOR, DIR_ENTRY_SIZE,
};

const ENTRY_END_OF_DIRECTORY: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;
const ENTRY_KANJI_E5: u8 = 0x05;

/// One decoded short (8.3) directory record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Name bytes exactly as stored; long-name checksums cover these.
    pub raw_name: [u8; 11],
    /// Name with a leading `0x05` turned back into `0xE5`.
    pub name: [u8; 11],
    pub attributes: u8,
    pub start_cluster: u32,
    pub size: u32,
}

impl DirectoryEntry {
    pub fn parse(record: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut raw_name = [0u8; 11];
        raw_name.copy_from_slice(&record[..11]);
        let mut name = raw_name;
        if name[0] == ENTRY_KANJI_E5 {
            name[0] = ENTRY_DELETED;
        }
        let cluster_hi = u16::from_le_bytes([record[0x14], record[0x15]]);
        let cluster_lo = u16::from_le_bytes([record[0x1A], record[0x1B]]);
        Self {
            raw_name,
            name,
            attributes: record[0x0B],
            start_cluster: ((cluster_hi as u32) << 16) | cluster_lo as u32,
            size: u32::from_le_bytes([record[0x1C], record[0x1D], record[0x1E], record[0x1F]]),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes & ATTR_VOLUME != 0
    }
}

/// Start cluster and size of a file found by [`resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedFile {
    pub cluster: u32,
    pub size: u32,
}

/// What [`list_dir`] reports for each live entry.
#[derive(Clone, Copy, Debug)]
pub struct DirListing<'a> {
    /// Long name when one validated, `NAME.EXT` otherwise.
    pub name: &'a [u8],
    pub short_name: [u8; 11],
    pub is_dir: bool,
    pub start_cluster: u32,
    pub size: u32,
}

/// Finds the file at `path`, an absolute `/`-separated path whose last
/// segment names a file and every earlier one a directory.
pub fn resolve<D: BlockDevice>(
    dev: &mut D,
    volume: &FatVolume,
    path: &str,
) -> Result<ResolvedFile, FatError<D::Error>> {
    let rest = path.strip_prefix('/').ok_or(FatError::InvalidPath)?;
    if rest.is_empty() {
        return Err(FatError::InvalidPath);
    }

    let mut dir_cluster = volume.root_dir_cluster;
    let mut segments = rest.split('/').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(FatError::InvalidPath);
        }
        let last = segments.peek().is_none();
        let Some(entry) = find_in_directory(dev, volume, dir_cluster, segment.as_bytes())? else {
            log::debug!("fat: {:?} not found in {:?}", segment, path);
            return Err(FatError::NotFound);
        };
        match (entry.is_dir(), last) {
            (false, true) => {
                return Ok(ResolvedFile {
                    cluster: entry.start_cluster,
                    size: entry.size,
                })
            }
            (true, false) => dir_cluster = directory_cluster(volume, entry.start_cluster),
            _ => {
                log::debug!("fat: {:?} in {:?} has the wrong type", segment, path);
                return Err(FatError::NotFound);
            }
        }
    }
    Err(FatError::NotFound)
}

/// First cluster of the directory at `path`; `/` is the root.
pub fn resolve_directory<D: BlockDevice>(
    dev: &mut D,
    volume: &FatVolume,
    path: &str,
) -> Result<u32, FatError<D::Error>> {
    let rest = path.strip_prefix('/').ok_or(FatError::InvalidPath)?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    let mut dir_cluster = volume.root_dir_cluster;
    if rest.is_empty() {
        return Ok(dir_cluster);
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(FatError::InvalidPath);
        }
        let entry = find_in_directory(dev, volume, dir_cluster, segment.as_bytes())?
            .ok_or(FatError::NotFound)?;
        if !entry.is_dir() {
            return Err(FatError::NotDirectory);
        }
        dir_cluster = directory_cluster(volume, entry.start_cluster);
    }
    Ok(dir_cluster)
}

/// Calls `visitor` for every live entry of the directory at `path` and
/// returns how many were reported.
pub fn list_dir<D, F>(
    dev: &mut D,
    volume: &FatVolume,
    path: &str,
    mut visitor: F,
) -> Result<usize, FatError<D::Error>>
where
    D: BlockDevice,
    F: FnMut(&DirListing<'_>),
{
    let dir_cluster = resolve_directory(dev, volume, path)?;
    let mut count = 0usize;
    walk_directory(dev, volume, dir_cluster, |entry, long_name| {
        let short_text = short_name_to_text(&entry.name);
        visitor(&DirListing {
            name: long_name.unwrap_or(short_text.as_slice()),
            short_name: entry.name,
            is_dir: entry.is_dir(),
            start_cluster: entry.start_cluster,
            size: entry.size,
        });
        count += 1;
        ControlFlow::Continue(())
    })?;
    Ok(count)
}

/// `..` entries that point at the root store cluster 0.
fn directory_cluster(volume: &FatVolume, start_cluster: u32) -> u32 {
    if start_cluster == 0 {
        volume.root_dir_cluster
    } else {
        start_cluster
    }
}

fn find_in_directory<D: BlockDevice>(
    dev: &mut D,
    volume: &FatVolume,
    dir_cluster: u32,
    segment: &[u8],
) -> Result<Option<DirectoryEntry>, FatError<D::Error>> {
    let mut found = None;
    walk_directory(dev, volume, dir_cluster, |entry, long_name| {
        if segment_matches(segment, long_name, &entry.name) {
            found = Some(*entry);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(found)
}

/// Visits each short entry of a directory together with the long name that
/// validated against it. Stops at the end marker, at the end of the chain,
/// or when `visit` breaks.
fn walk_directory<D, F>(
    dev: &mut D,
    volume: &FatVolume,
    dir_cluster: u32,
    mut visit: F,
) -> Result<(), FatError<D::Error>>
where
    D: BlockDevice,
    F: FnMut(&DirectoryEntry, Option<&[u8]>) -> ControlFlow<()>,
{
    let mut source = Buffered::new();
    let mut chain = ClusterChain::init(dev, volume, &mut source, dir_cluster)?;
    let mut long_name = LongNameAccumulator::new();

    loop {
        let sector = chain.current_sector(volume);
        for slot in 0..DIR_ENTRIES_PER_SECTOR {
            let base = slot * DIR_ENTRY_SIZE;
            let mut record = [0u8; DIR_ENTRY_SIZE];
            record.copy_from_slice(&dev.read_sector(sector)?[base..base + DIR_ENTRY_SIZE]);

            match record[0] {
                ENTRY_END_OF_DIRECTORY => return Ok(()),
                ENTRY_DELETED => {
                    long_name.clear();
                    continue;
                }
                _ => {}
            }

            let attributes = record[0x0B];
            if attributes == ATTR_LONG_NAME {
                long_name.push(&record);
                continue;
            }

            let entry = DirectoryEntry::parse(&record);
            if entry.is_volume_label() {
                long_name.clear();
                continue;
            }

            let flow = visit(&entry, long_name.name_for(&entry.raw_name));
            long_name.clear();
            if flow.is_break() {
                return Ok(());
            }
        }

        match chain.advance(dev, volume, &mut source) {
            Ok(()) => {}
            Err(FatError::EndOfChain) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
