use crate::{Backing, Result, VhdDisk};

/// Logical image I/O: either straight positional access to the backing, or
/// translated through the VHD block table. Offsets are absolute image
/// coordinates; the protocol engine adds the configured image base offset
/// before calling in.
pub enum ImageIo<B> {
    Raw(B),
    Vhd(VhdDisk<B>),
}

impl<B: Backing> ImageIo<B> {
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Self::Raw(backing) => backing.read_at(buf, offset),
            Self::Vhd(vhd) => vhd.read_at(buf, offset),
        }
    }

    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        match self {
            Self::Raw(backing) => backing.write_at(buf, offset),
            Self::Vhd(vhd) => vhd.write_at(buf, offset),
        }
    }

    pub fn is_vhd(&self) -> bool {
        matches!(self, Self::Vhd(_))
    }
}
