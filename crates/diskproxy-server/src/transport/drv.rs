use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::{Result, Transport, TransportError};
use crate::proto::{REQ_TAG_INFO, SHM_HEADER_SIZE};

/// Directory the client driver exposes its rendezvous device nodes under.
const DEVICE_DIR: &str = "/dev/deviodrv";

/// Driver-owned slot at the front of the mapping: the request tag the client
/// posted, plus a flags word. Header field serialization starts after it.
const DRV_HEADER_SIZE: usize = 16;

/// Largest mapping the grow protocol will negotiate.
const MAX_BUFFER_SIZE: u64 = (usize::MAX >> 1) as u64;

#[repr(C)]
struct BufferDesc {
    addr: u64,
    len: u64,
}

// ioctl encoding: dir in the top bits, argument size, magic, command number.
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'D' as libc::c_ulong) << 8) | nr
}

/// Register the current mapping with the driver.
const IOC_LOCK_BUFFER: libc::c_ulong = ioc(IOC_WRITE, 0xD0, std::mem::size_of::<BufferDesc>());
/// Release the registration before the mapping goes away.
const IOC_UNLOCK_BUFFER: libc::c_ulong = ioc(IOC_WRITE, 0xD1, std::mem::size_of::<BufferDesc>());
/// Deliver the response in the buffer and block until the client posts the
/// next request (or detaches).
const IOC_EXCHANGE_IO: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 0xD2, std::mem::size_of::<BufferDesc>());

/// Kernel-driver transport.
///
/// The mapping is private to this process; the driver reaches it through the
/// lock registration. Exchange completions order all access: the client only
/// sees the region between our exchange calls, and we never touch a mapping
/// after unlocking it for replacement.
pub struct DrvTransport {
    file: File,
    map: *mut u8,
    map_len: usize,
    buffer_size: usize,
    read_cursor: usize,
    write_cursor: usize,
    detached: bool,
}

unsafe impl Send for DrvTransport {}

impl DrvTransport {
    pub fn open(device: &str, buffer_size: usize) -> Result<Self> {
        info!(device, "driver mode");

        if device.is_empty() || device.contains('/') {
            return Err(TransportError::Setup(format!(
                "invalid driver object name '{device}'"
            )));
        }

        let path: PathBuf = [DEVICE_DIR, device].iter().collect();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.raw_os_error() == Some(libc::EBUSY) {
                    TransportError::Setup(format!("a service named '{device}' is already running"))
                } else {
                    TransportError::Setup(format!("open {}: {e}", path.display()))
                }
            })?;

        let mut transport = Self {
            file,
            map: std::ptr::null_mut(),
            map_len: 0,
            buffer_size,
            read_cursor: DRV_HEADER_SIZE,
            write_cursor: DRV_HEADER_SIZE,
            detached: false,
        };
        transport.map_and_lock(buffer_size)?;
        Ok(transport)
    }

    /// Prime the request slot with an INFO tag so the session's first
    /// response is the unsolicited INFO push the client expects on connect.
    pub fn prime_info(&mut self) {
        unsafe {
            std::ptr::copy_nonoverlapping(REQ_TAG_INFO.to_le_bytes().as_ptr(), self.map, 8);
        }
    }

    /// Allocate and register a fresh mapping of `buffer_size` payload bytes.
    fn map_and_lock(&mut self, buffer_size: usize) -> Result<()> {
        let map_len = SHM_HEADER_SIZE + buffer_size;
        info!(bytes = buffer_size, "allocating request buffer");

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(TransportError::last_os("driver buffer mmap"));
        }

        let desc = BufferDesc {
            addr: map as u64,
            len: map_len as u64,
        };
        if unsafe { libc::ioctl(self.file.as_raw_fd(), IOC_LOCK_BUFFER, &desc) } != 0 {
            let err = TransportError::last_os("driver buffer lock");
            unsafe { libc::munmap(map, map_len) };
            return Err(err);
        }

        self.map = map.cast();
        self.map_len = map_len;
        self.buffer_size = buffer_size;
        Ok(())
    }

    /// Drop the driver's registration of the current mapping. The mapping
    /// must not be handed to the client again until re-locked.
    fn unlock(&mut self) {
        let desc = BufferDesc {
            addr: self.map as u64,
            len: self.map_len as u64,
        };
        if unsafe { libc::ioctl(self.file.as_raw_fd(), IOC_UNLOCK_BUFFER, &desc) } != 0 {
            warn!(
                errno = last_errno(),
                "error releasing driver buffer registration"
            );
        }
    }

    /// The client asked for more than the mapping holds: renegotiate with a
    /// doubled buffer and retry the exchange.
    fn renegotiate(&mut self) -> Result<()> {
        let doubled = ((self.buffer_size as u64) << 1).min(MAX_BUFFER_SIZE) as usize;
        debug!(doubled, "client request needs a larger buffer");

        self.unlock();
        unsafe { libc::munmap(self.map.cast(), self.map_len) };
        self.map = std::ptr::null_mut();
        self.map_len = 0;
        self.map_and_lock(doubled)
    }
}

impl Transport for DrvTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.detached {
            return Err(TransportError::Closed);
        }
        let end = self.read_cursor + buf.len();
        if end > SHM_HEADER_SIZE {
            return Err(TransportError::TooLarge {
                wanted: end,
                capacity: SHM_HEADER_SIZE,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.add(self.read_cursor),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        self.read_cursor = end;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.write_cursor + buf.len();
        if end > SHM_HEADER_SIZE {
            return Err(TransportError::TooLarge {
                wanted: end,
                capacity: SHM_HEADER_SIZE,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.map.add(self.write_cursor), buf.len());
        }
        self.write_cursor = end;
        Ok(())
    }

    fn read_payload(&mut self, len: usize) -> Result<()> {
        if len > self.buffer_size {
            return Err(TransportError::TooLarge {
                wanted: len,
                capacity: self.buffer_size,
            });
        }
        Ok(())
    }

    fn write_payload(&mut self, len: usize) -> Result<()> {
        if len > self.buffer_size {
            return Err(TransportError::TooLarge {
                wanted: len,
                capacity: self.buffer_size,
            });
        }
        Ok(())
    }

    fn payload(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map.add(SHM_HEADER_SIZE), self.buffer_size) }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Server-initiated grow (oversized READ): replace the mapping, carrying
    /// the already-serialized header over. Keeps the old buffer on failure
    /// so the session can still answer with a clamped transfer.
    fn grow(&mut self, wanted: u64) -> Result<()> {
        let wanted = wanted.min(MAX_BUFFER_SIZE) as usize;
        if wanted <= self.buffer_size {
            return Ok(());
        }

        let old_map = self.map;
        let old_map_len = self.map_len;
        let old_buffer_size = self.buffer_size;

        self.unlock();
        match self.map_and_lock(wanted) {
            Ok(()) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(old_map, self.map, SHM_HEADER_SIZE);
                    libc::munmap(old_map.cast(), old_map_len);
                }
                Ok(())
            }
            Err(err) => {
                warn!(%err, "buffer grow failed; keeping current buffer");
                self.map = old_map;
                self.map_len = old_map_len;
                self.buffer_size = old_buffer_size;
                let desc = BufferDesc {
                    addr: self.map as u64,
                    len: self.map_len as u64,
                };
                if unsafe { libc::ioctl(self.file.as_raw_fd(), IOC_LOCK_BUFFER, &desc) } != 0 {
                    return Err(TransportError::last_os("driver buffer re-lock"));
                }
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.read_cursor = DRV_HEADER_SIZE;
        self.write_cursor = DRV_HEADER_SIZE;

        if self.detached {
            return Ok(());
        }

        loop {
            let mut desc = BufferDesc {
                addr: self.map as u64,
                len: self.map_len as u64,
            };
            if unsafe { libc::ioctl(self.file.as_raw_fd(), IOC_EXCHANGE_IO, &mut desc) } == 0 {
                return Ok(());
            }

            match last_errno() {
                libc::ENOBUFS => self.renegotiate()?,
                libc::ENODEV => {
                    // Client detached; the next request read ends the session
                    // cleanly.
                    self.detached = true;
                    return Ok(());
                }
                _ => return Err(TransportError::last_os("driver request exchange")),
            }
        }
    }
}

impl Drop for DrvTransport {
    fn drop(&mut self) {
        if !self.map.is_null() {
            self.unlock();
            unsafe { libc::munmap(self.map.cast(), self.map_len) };
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
