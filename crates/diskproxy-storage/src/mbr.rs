use tracing::{info, warn};

use crate::util::le_u32;
use crate::{Backing, ImageIo, ProxyError, Result, SECTOR_SIZE};

const SIGNATURE_OFFSET: usize = 0x1FE;
const TABLE_OFFSET: usize = 0x1BE;
const ENTRY_SIZE: usize = 16;

const TYPE_EMPTY: u8 = 0x00;
const TYPE_EXTENDED_CHS: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0F;

/// Byte extent of a partition on the logical image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartitionExtent {
    pub offset: u64,
    pub len: u64,
}

/// A sector holds an MBR/EBR iff it carries the 0x55AA signature and none of
/// the four entry status bytes has a bit other than the bootable bit set.
fn table_valid(sector: &[u8; SECTOR_SIZE]) -> bool {
    sector[SIGNATURE_OFFSET] == 0x55
        && sector[SIGNATURE_OFFSET + 1] == 0xAA
        && (0..4).all(|i| sector[TABLE_OFFSET + i * ENTRY_SIZE] & 0x7F == 0)
}

fn entry(sector: &[u8; SECTOR_SIZE], i: usize) -> &[u8] {
    &sector[TABLE_OFFSET + i * ENTRY_SIZE..TABLE_OFFSET + (i + 1) * ENTRY_SIZE]
}

fn rel_start_bytes(e: &[u8]) -> u64 {
    (le_u32(&e[8..12]) as u64) << 9
}

fn len_bytes(e: &[u8]) -> u64 {
    (le_u32(&e[12..16]) as u64) << 9
}

/// Resolve partition `index` (1-based, counted across primaries and logical
/// partitions in table order) to a byte extent on the logical image.
///
/// Returns `Ok(None)` when sector 0 carries no valid MBR — the caller then
/// serves the whole image. A matched partition must be non-empty and must fit
/// inside `current_size`.
///
/// Reads go through [`ImageIo`] so that a partition table inside a VHD image
/// resolves against the virtual disk contents.
pub fn resolve_partition<B: Backing>(
    image: &mut ImageIo<B>,
    current_size: u64,
    index: u32,
) -> Result<Option<PartitionExtent>> {
    let mut mbr = [0u8; SECTOR_SIZE];
    if image.read_at(&mut mbr, 0)? < SECTOR_SIZE {
        warn!("could not read a full boot sector; serving whole image");
        return Ok(None);
    }
    if !table_valid(&mbr) {
        return Ok(None);
    }

    info!("master boot record detected at sector 0");

    let mut count = 0u32;
    let mut offset = 0u64;
    let mut len = 0u64;

    for i in 0..4 {
        let e = entry(&mbr, i);
        let ptype = e[4];
        if ptype == TYPE_EMPTY {
            continue;
        }

        if ptype == TYPE_EXTENDED_CHS || ptype == TYPE_EXTENDED_LBA {
            // Walk the chain of extended boot records. Each EBR names at most
            // one logical partition (relative to the EBR itself) and at most
            // one link to the next EBR (relative to the first EBR).
            let first_ebr = rel_start_bytes(e);
            offset = first_ebr;

            loop {
                info!(offset, "reading extended partition table");

                let mut ebr = [0u8; SECTOR_SIZE];
                let ok = image.read_at(&mut ebr, offset)? == SECTOR_SIZE && table_valid(&ebr);
                if !ok {
                    warn!(offset, "invalid extended partition table; chain ends");
                    break;
                }

                let mut next_ebr = None;
                for j in 0..4 {
                    let le = entry(&ebr, j);
                    let ltype = le[4];
                    if ltype == TYPE_EMPTY {
                        continue;
                    }
                    if ltype == TYPE_EXTENDED_CHS || ltype == TYPE_EXTENDED_LBA {
                        next_ebr = Some(first_ebr + rel_start_bytes(le));
                        break;
                    }

                    count += 1;
                    if count == index {
                        offset += rel_start_bytes(le);
                        len = len_bytes(le);
                        break;
                    }
                }

                match next_ebr {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        } else {
            count += 1;
            if count == index {
                offset = rel_start_bytes(e);
                len = len_bytes(e);
                break;
            }
        }
    }

    let end = offset.checked_add(len).ok_or(ProxyError::OffsetOverflow)?;
    if len == 0 || (current_size != 0 && end > current_size) {
        return Err(ProxyError::PartitionNotFound { index });
    }

    Ok(Some(PartitionExtent { offset, len }))
}
