use tracing::debug;

use crate::util::{be_u32, be_u64, is_all_zero};
use crate::{Backing, ProxyError, Result};

pub const SECTOR_SIZE: usize = 512;
const SECTOR_SHIFT: u32 = 9;

pub const FOOTER_SIZE: usize = 512;
const SPARSE_HEADER_SIZE: usize = 1024;
const PROBE_SIZE: usize = FOOTER_SIZE + SPARSE_HEADER_SIZE;

const FOOTER_COOKIE: [u8; 8] = *b"conectix";
const HEADER_COOKIE: [u8; 8] = *b"cxsparse";
const DISK_TYPE_DYNAMIC: u32 = 3;

/// Raw BAT value marking an unallocated block. All-ones, so no endian
/// conversion is needed for the comparison.
const BAT_UNALLOCATED: u32 = 0xFFFF_FFFF;

/// CHS geometry advertised in the footer; only used for the startup log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VhdGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// Translator for dynamically expanding Microsoft VHD images.
///
/// The on-disk layout is: footer copy (512 bytes), sparse header (1024
/// bytes), block allocation table, data blocks, footer mirror as the last 512
/// bytes of the file. Each allocated block is prefixed by one sector of
/// sector-allocation bitmap.
///
/// Virtual offsets are translated per request; nothing is cached beyond the
/// decoded header fields, so the image stays byte-exact for other readers
/// after every call.
#[derive(Debug)]
pub struct VhdDisk<B> {
    backing: B,
    /// Verbatim footer image, rewritten at the new end of file whenever a
    /// block is allocated.
    footer: [u8; FOOTER_SIZE],
    current_size: u64,
    table_offset: u64,
    block_size: u64,
    block_shift: u32,
    /// Byte offset of the footer mirror; always end-of-file minus 512.
    footer_offset: u64,
    geometry: VhdGeometry,
    scratch: Vec<u8>,
}

impl<B: Backing> VhdDisk<B> {
    /// Cheap cookie probe: does the backing start with a dynamic-VHD footer
    /// copy and sparse header? Short files and foreign formats report
    /// `false`; structural problems beyond the cookies are left for
    /// [`VhdDisk::open`] to diagnose.
    pub fn probe(backing: &mut B) -> Result<bool> {
        let mut head = [0u8; PROBE_SIZE];
        if backing.read_at(&mut head, 0)? != PROBE_SIZE {
            return Ok(false);
        }
        Ok(head[..8] == FOOTER_COOKIE
            && head[FOOTER_SIZE..FOOTER_SIZE + 8] == HEADER_COOKIE
            && be_u32(&head[60..64]) == DISK_TYPE_DYNAMIC)
    }

    /// Decode the footer copy and sparse header and take ownership of the
    /// backing. Structural problems (a non-power-of-two block size in
    /// particular) are hard errors, not something to limp along with.
    pub fn open(mut backing: B) -> Result<Self> {
        let physical_size = backing.len()?;
        if physical_size < (PROBE_SIZE + FOOTER_SIZE) as u64 {
            return Err(ProxyError::BadFormat("vhd image truncated"));
        }

        let mut head = [0u8; PROBE_SIZE];
        backing.read_exact_at(&mut head, 0)?;

        let footer: [u8; FOOTER_SIZE] = head[..FOOTER_SIZE].try_into().expect("footer slice");
        let header = &head[FOOTER_SIZE..];

        if footer[..8] != FOOTER_COOKIE {
            return Err(ProxyError::BadFormat("vhd footer cookie mismatch"));
        }
        if header[..8] != HEADER_COOKIE {
            return Err(ProxyError::BadFormat("vhd sparse header cookie mismatch"));
        }
        if be_u32(&footer[60..64]) != DISK_TYPE_DYNAMIC {
            return Err(ProxyError::BadFormat("vhd disk type is not dynamic"));
        }

        let current_size = be_u64(&footer[48..56]);
        let table_offset = be_u64(&header[16..24]);
        let block_size = be_u32(&header[32..36]) as u64;

        if block_size < SECTOR_SIZE as u64 || !block_size.is_power_of_two() {
            return Err(ProxyError::BadFormat(
                "vhd block size must be a power of two of at least one sector",
            ));
        }
        if current_size == 0 {
            return Err(ProxyError::BadFormat("vhd virtual size is zero"));
        }
        if table_offset >= physical_size {
            return Err(ProxyError::BadFormat("vhd block table outside image"));
        }

        let geometry = VhdGeometry {
            cylinders: u16::from_be_bytes(footer[56..58].try_into().expect("2 bytes")),
            heads: footer[58],
            sectors_per_track: footer[59],
        };

        Ok(Self {
            backing,
            footer,
            current_size,
            table_offset,
            block_size,
            block_shift: block_size.trailing_zeros(),
            footer_offset: physical_size - FOOTER_SIZE as u64,
            geometry,
            scratch: Vec::new(),
        })
    }

    /// Virtual disk size decoded from the footer.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn geometry(&self) -> VhdGeometry {
        self.geometry
    }

    pub fn into_backing(self) -> B {
        self.backing
    }

    fn bat_entry(&mut self, block_no: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        let entry_offset = self
            .table_offset
            .checked_add(block_no.checked_mul(4).ok_or(ProxyError::OffsetOverflow)?)
            .ok_or(ProxyError::OffsetOverflow)?;
        self.backing.read_exact_at(&mut raw, entry_offset)?;
        Ok(u32::from_be_bytes(raw))
    }

    /// Place a new block where the footer mirror currently sits: point the
    /// BAT at it, then write one composite of zeroed bitmap sector + zeroed
    /// data + the footer at its new home. Returns the block's sector pointer.
    fn allocate_block(&mut self, block_no: u64) -> Result<u32> {
        let start = self.footer_offset;
        let sector = start >> SECTOR_SHIFT;
        let entry =
            u32::try_from(sector).map_err(|_| ProxyError::BadFormat("vhd file too large"))?;

        debug!(block_no, start, "allocating vhd block");

        let entry_offset = self
            .table_offset
            .checked_add(block_no.checked_mul(4).ok_or(ProxyError::OffsetOverflow)?)
            .ok_or(ProxyError::OffsetOverflow)?;
        self.backing.write_all_at(&entry.to_be_bytes(), entry_offset)?;

        let block_len: usize = self
            .block_size
            .try_into()
            .map_err(|_| ProxyError::AllocFailure("vhd block size"))?;
        let mut composite = Vec::new();
        composite
            .try_reserve_exact(SECTOR_SIZE + block_len + FOOTER_SIZE)
            .map_err(|_| ProxyError::AllocFailure("vhd block composite"))?;
        composite.resize(SECTOR_SIZE + block_len, 0);
        composite.extend_from_slice(&self.footer);
        self.backing.write_all_at(&composite, start)?;

        self.footer_offset = start + (SECTOR_SIZE as u64) + self.block_size;
        Ok(entry)
    }

    /// Read `buf.len()` bytes at virtual `offset`. Unallocated ranges read
    /// as zeros. A request past the virtual size reads zero bytes.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(ProxyError::OffsetOverflow)?;
        if end > self.current_size {
            return Ok(0);
        }

        let block_mask = self.block_size - 1;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_no = abs >> self.block_shift;
            let in_block = (abs & block_mask) as usize;
            let chunk = (self.block_size as usize - in_block).min(buf.len() - pos);

            let entry = self.bat_entry(block_no)?;
            if entry == BAT_UNALLOCATED {
                buf[pos..pos + chunk].fill(0);
            } else {
                let data_offset = ((entry as u64) << SECTOR_SHIFT)
                    + SECTOR_SIZE as u64
                    + in_block as u64;
                self.backing
                    .read_exact_at(&mut buf[pos..pos + chunk], data_offset)?;
            }

            pos += chunk;
        }

        Ok(buf.len())
    }

    /// Write `buf` at virtual `offset`, allocating blocks as needed. An
    /// all-zero span aimed at an unallocated block is reported as written
    /// without allocating anything. A request past the virtual size writes
    /// zero bytes.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(ProxyError::OffsetOverflow)?;
        if end > self.current_size {
            return Ok(0);
        }

        let block_mask = self.block_size - 1;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block_no = abs >> self.block_shift;
            let in_block = (abs & block_mask) as usize;
            let chunk = (self.block_size as usize - in_block).min(buf.len() - pos);
            let payload = &buf[pos..pos + chunk];

            let mut entry = self.bat_entry(block_no)?;
            if entry == BAT_UNALLOCATED {
                if is_all_zero(payload) {
                    debug!(block_no, chunk, "zero write to unallocated block suppressed");
                    pos += chunk;
                    continue;
                }
                entry = self.allocate_block(block_no)?;
            }

            let block_start = (entry as u64) << SECTOR_SHIFT;
            let data_offset = block_start + SECTOR_SIZE as u64 + in_block as u64;
            self.backing.write_all_at(payload, data_offset)?;

            // Coarse byte-granular bitmap update: every sector the span
            // touches is marked allocated, and whole bytes are written, so
            // neighbouring sectors in the same byte get marked too. They
            // physically exist in the allocated block, so reads stay correct.
            let bitmap_offset = block_start + ((in_block >> SECTOR_SHIFT >> 3) as u64);
            let touched_sectors = chunk.div_ceil(SECTOR_SIZE);
            let bitmap_len = touched_sectors.div_ceil(8);
            if self.scratch.len() < bitmap_len {
                self.scratch.resize(bitmap_len, 0);
            }
            self.scratch[..bitmap_len].fill(0xFF);
            let Self {
                backing, scratch, ..
            } = self;
            backing.write_all_at(&scratch[..bitmap_len], bitmap_offset)?;

            pos += chunk;
        }

        Ok(buf.len())
    }
}
