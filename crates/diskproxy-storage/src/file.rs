use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use crate::{Backing, ProxyError, Result};

/// File- or device-backed store.
///
/// Opened with `O_SYNC` so completed writes are durable before the response
/// goes back on the wire. `O_DIRECT` is deliberately not requested: the proxy
/// protocol puts no alignment constraints on client buffers.
pub struct FileBacking {
    file: File,
}

impl FileBacking {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| ProxyError::io("open image", &e))?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl Backing for FileBacking {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file
            .read_at(buf, offset)
            .map_err(|e| ProxyError::io("image read", &e))
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.file
            .write_at(buf, offset)
            .map_err(|e| ProxyError::io("image write", &e))
    }

    fn len(&mut self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| ProxyError::io("image stat", &e))?;
        if meta.len() > 0 {
            return Ok(meta.len());
        }

        // Block and character devices report st_size 0; ask the fd instead.
        let end = unsafe { libc::lseek(self.file.as_raw_fd(), 0, libc::SEEK_END) };
        if end < 0 {
            return Err(ProxyError::last_os("image seek-end"));
        }
        Ok(end as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_write_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();

        let mut backing = FileBacking::open(tmp.path(), false).unwrap();
        backing.write_all_at(b"sector payload", 512).unwrap();

        let mut back = [0u8; 14];
        backing.read_exact_at(&mut back, 512).unwrap();
        assert_eq!(&back, b"sector payload");
        assert_eq!(backing.len().unwrap(), 4096);
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 512]).unwrap();

        let mut backing = FileBacking::open(tmp.path(), true).unwrap();
        let err = backing.write_at(b"x", 0).unwrap_err();
        assert!(matches!(err, ProxyError::BackingIo { .. }));
    }
}
