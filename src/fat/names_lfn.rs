use heapless::Vec;

use super::DIR_ENTRY_SIZE;

const LFN_CHARS_PER_ENTRY: usize = 13;
const LFN_MAX_ENTRIES: usize = 20;
pub const LFN_NAME_MAX: usize = LFN_CHARS_PER_ENTRY * LFN_MAX_ENTRIES;
const LFN_LAST_ENTRY: u8 = 0x40;
const LFN_SEQUENCE_MASK: u8 = 0x1F;
const LFN_CHECKSUM_OFFSET: usize = 0x0D;
const LFN_CHAR_OFFSETS: [usize; LFN_CHARS_PER_ENTRY] =
    [0x01, 0x03, 0x05, 0x07, 0x09, 0x0E, 0x10, 0x12, 0x14, 0x16, 0x18, 0x1C, 0x1E];

/// Collects VFAT name fragments that precede a short entry.
///
/// Fragments arrive last-first on disk, so the buffer fills back to front
/// and the assembled name starts at `cursor`.
pub struct LongNameAccumulator {
    buf: [u8; LFN_NAME_MAX],
    cursor: usize,
    checksum: u8,
    expected_seq: u8,
    valid: bool,
}

impl Default for LongNameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl LongNameAccumulator {
    pub const fn new() -> Self {
        Self {
            buf: [0; LFN_NAME_MAX],
            cursor: LFN_NAME_MAX,
            checksum: 0,
            expected_seq: 0,
            valid: false,
        }
    }

    pub fn clear(&mut self) {
        self.cursor = LFN_NAME_MAX;
        self.checksum = 0;
        self.expected_seq = 0;
        self.valid = false;
    }

    pub fn is_pending(&self) -> bool {
        self.valid
    }

    /// Takes one 32-byte long-name directory record.
    pub fn push(&mut self, entry: &[u8]) {
        if entry.len() < DIR_ENTRY_SIZE {
            self.clear();
            return;
        }
        let order = entry[0];
        let seq = order & LFN_SEQUENCE_MASK;
        let checksum = entry[LFN_CHECKSUM_OFFSET];

        if order & LFN_LAST_ENTRY != 0 {
            self.clear();
            if seq == 0 || seq as usize > LFN_MAX_ENTRIES {
                return;
            }
            self.valid = true;
            self.checksum = checksum;
        } else {
            if !self.valid {
                return;
            }
            if seq == 0 || seq + 1 != self.expected_seq || checksum != self.checksum {
                log::trace!("fat: dropping long name, fragment {} out of order", seq);
                self.clear();
                return;
            }
        }

        self.expected_seq = seq;
        self.cursor -= LFN_CHARS_PER_ENTRY;
        for (slot, &offset) in LFN_CHAR_OFFSETS.iter().enumerate() {
            self.buf[self.cursor + slot] = narrow_char(entry[offset], entry[offset + 1]);
        }
    }

    /// The assembled name, if every fragment arrived and the checksum they
    /// carry belongs to `short_name` as stored on disk.
    pub fn name_for(&self, short_name: &[u8; 11]) -> Option<&[u8]> {
        if !self.valid || self.expected_seq != 1 {
            return None;
        }
        if self.checksum != short_name_checksum(short_name) {
            log::trace!("fat: long name checksum mismatch, using short name");
            return None;
        }
        let name = &self.buf[self.cursor..];
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        if len == 0 {
            return None;
        }
        Some(&name[..len])
    }
}

/// UCS-2 to a single byte: plain ASCII survives, anything wider becomes `_`.
fn narrow_char(low: u8, high: u8) -> u8 {
    if high == 0 {
        low
    } else {
        b'_'
    }
}

pub fn short_name_checksum(short: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for byte in short.iter() {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*byte);
    }
    sum
}

/// Converts a path segment into the padded, upper-case 11-byte form stored in
/// short entries. Returns `None` for anything that cannot be an 8.3 name.
pub fn short_name_from_segment(segment: &[u8]) -> Option<[u8; 11]> {
    if segment == b"." || segment == b".." {
        let mut out = [b' '; 11];
        out[..segment.len()].copy_from_slice(segment);
        return Some(out);
    }

    let (name, ext) = match segment.iter().position(|&b| b == b'.') {
        Some(dot_idx) => {
            let after = &segment[dot_idx + 1..];
            if after.contains(&b'.') {
                return None;
            }
            (&segment[..dot_idx], after)
        }
        None => (segment, &[][..]),
    };

    if name.is_empty() || name.len() > 8 || ext.len() > 3 {
        return None;
    }

    let mut out = [b' '; 11];
    for (i, b) in name.iter().enumerate() {
        out[i] = normalize_short_char(*b)?;
    }
    for (i, b) in ext.iter().enumerate() {
        out[8 + i] = normalize_short_char(*b)?;
    }
    Some(out)
}

fn normalize_short_char(byte: u8) -> Option<u8> {
    let up = byte.to_ascii_uppercase();
    if up.is_ascii_alphanumeric()
        || matches!(
            up,
            b'_' | b'-' | b'$' | b'~' | b'!' | b'#' | b'%' | b'&' | b'\'' | b'(' | b')' | b'@'
                | b'^' | b'`' | b'{' | b'}'
        )
        || up >= 0x80
    {
        Some(up)
    } else {
        None
    }
}

/// `NAME.EXT` form of a stored short name, padding removed.
pub fn short_name_to_text(raw: &[u8; 11]) -> Vec<u8, 12> {
    let mut out = Vec::new();
    for &b in raw[..8].iter().take_while(|&&b| b != b' ') {
        let _ = out.push(b);
    }
    if raw[8..].iter().any(|&b| b != b' ') {
        let _ = out.push(b'.');
        for &b in raw[8..].iter().take_while(|&&b| b != b' ') {
            let _ = out.push(b);
        }
    }
    out
}

fn ascii_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Long name first, then the 8.3 form of `segment` against the raw short
/// name bytes.
pub(super) fn segment_matches(segment: &[u8], long_name: Option<&[u8]>, short_name: &[u8; 11]) -> bool {
    if let Some(long_name) = long_name {
        if ascii_eq_ignore_case(segment, long_name) {
            return true;
        }
    }
    short_name_from_segment(segment).is_some_and(|short| &short == short_name)
}
