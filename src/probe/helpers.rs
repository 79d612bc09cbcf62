/// Reads `width` (at most 32) bits starting `start` bits into `bytes`,
/// counting from the most significant bit of `bytes[0]`.
pub fn extract_bits(bytes: &[u8], start: u16, width: u8) -> u32 {
    let mut value = 0u32;
    for i in 0..width.min(32) as u16 {
        let bit = start + i;
        let byte = bytes.get((bit / 8) as usize).copied().unwrap_or(0);
        value = (value << 1) | ((byte >> (7 - bit % 8)) & 1) as u32;
    }
    value
}

/// CSD_STRUCTURE, the top two bits of the register.
pub fn csd_structure(csd: &[u8; 16]) -> u8 {
    extract_bits(csd, 0, 2) as u8
}

/// Sector count of a structure-version-1 (SDHC/SDXC) card:
/// `(C_SIZE + 1) * 1024`. Other structure versions yield `None`.
pub fn decode_sector_count(csd: &[u8; 16]) -> Option<u32> {
    if csd_structure(csd) != 1 {
        return None;
    }
    let c_size = extract_bits(csd, 58, 22);
    c_size.checked_add(1)?.checked_mul(1024)
}
