/// True iff every byte of `buf` is zero, bailing at the first nonzero 64-bit
/// lane.
pub fn is_all_zero(buf: &[u8]) -> bool {
    let mut chunks = buf.chunks_exact(8);
    for chunk in &mut chunks {
        let lane = u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk"));
        if lane != 0 {
            return false;
        }
    }
    chunks.remainder().iter().all(|&b| b == 0)
}

pub fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes"))
}

pub fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"))
}

pub fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes"))
}
