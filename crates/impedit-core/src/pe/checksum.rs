//! The optional-header `CheckSum` algorithm (as computed by `imagehlp`).

use byteorder::{ByteOrder, LittleEndian};

/// Compute the PE checksum of `data`, treating the four bytes at
/// `checksum_offset` as zero.
pub fn pe_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    for (i, chunk) in data.chunks(2).enumerate() {
        let at = i * 2;
        if at >= checksum_offset && at < checksum_offset + 4 {
            continue;
        }
        let word = if chunk.len() == 2 {
            LittleEndian::read_u16(chunk)
        } else {
            u16::from(chunk[0])
        };
        sum += u64::from(word);
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    (sum as u32).wrapping_add(data.len() as u32)
}
