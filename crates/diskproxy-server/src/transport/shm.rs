use std::ffi::CString;

use tracing::info;

use super::{Result, Transport, TransportError};
use crate::proto::SHM_HEADER_SIZE;

/// Shared-memory transport: one named mapping plus three named objects.
///
/// The mapping is `SHM_HEADER_SIZE + buffer_size` bytes; request and response
/// header fields are serialized cursor-style into the header region and the
/// payload slot starts at `SHM_HEADER_SIZE`. The client and server take turns
/// touching the region, handing the baton over with the request/response
/// semaphores. The server semaphore is held for the whole process lifetime as
/// a single-instance guard.
pub struct ShmTransport {
    map: *mut u8,
    map_len: usize,
    buffer_size: usize,
    read_cursor: usize,
    write_cursor: usize,
    shm_name: CString,
    _server_sem: NamedSem,
    request_sem: NamedSem,
    response_sem: NamedSem,
}

// Raw pointers into the mapping; the transport is used from one thread and
// region ownership is arbitrated by the semaphore pair.
unsafe impl Send for ShmTransport {}

impl ShmTransport {
    /// Create the named mapping and its auxiliary objects. Fails if another
    /// server already owns the name.
    pub fn create(device: &str, buffer_size: usize) -> Result<Self> {
        info!(device, "shared memory operation");

        let shm_name = object_name(device, "")?;
        let map_len = SHM_HEADER_SIZE + buffer_size;

        let fd = unsafe {
            libc::shm_open(
                shm_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            if last_errno() == libc::EEXIST {
                return Err(TransportError::Setup(format!(
                    "a service named '{device}' is already running"
                )));
            }
            return Err(TransportError::last_os("shm_open"));
        }

        if unsafe { libc::ftruncate(fd, map_len as libc::off_t) } != 0 {
            let err = TransportError::last_os("shm ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(shm_name.as_ptr());
            }
            return Err(err);
        }

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if map == libc::MAP_FAILED {
            let err = TransportError::last_os("shm mmap");
            unsafe { libc::shm_unlink(shm_name.as_ptr()) };
            return Err(err);
        }

        let cleanup_map = |err: TransportError| {
            unsafe {
                libc::munmap(map, map_len);
                libc::shm_unlink(shm_name.as_ptr());
            }
            err
        };

        // Single-instance guard: the semaphore is created released and held
        // non-blocking; a second server finds it taken.
        let server_sem = NamedSem::create(object_name(device, "_Server")?, 1)
            .map_err(cleanup_map)?;
        if !server_sem.try_wait() {
            return Err(cleanup_map(TransportError::Setup(format!(
                "a service named '{device}' is already running"
            ))));
        }

        let request_sem =
            NamedSem::create(object_name(device, "_Request")?, 0).map_err(cleanup_map)?;
        let response_sem =
            NamedSem::create(object_name(device, "_Response")?, 0).map_err(cleanup_map)?;

        Ok(Self {
            map: map.cast(),
            map_len,
            buffer_size,
            read_cursor: 0,
            write_cursor: 0,
            shm_name,
            _server_sem: server_sem,
            request_sem,
            response_sem,
        })
    }

    /// Block until the client posts its first request.
    pub fn wait_for_client(&mut self, device: &str) -> Result<()> {
        info!(device, "waiting for connection on shared memory object");
        self.request_sem.wait()?;
        info!(device, "connection on shared memory object");
        Ok(())
    }
}

impl Transport for ShmTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
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
        // The client already wrote into the shared payload slot.
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

    fn grow(&mut self, _wanted: u64) -> Result<()> {
        // The mapping was sized at creation and is shared with the client;
        // oversized requests get clamped to the existing payload slot.
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.read_cursor = 0;
        self.write_cursor = 0;
        self.response_sem.post()?;
        self.request_sem.wait()
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.cast(), self.map_len);
            libc::shm_unlink(self.shm_name.as_ptr());
        }
    }
}

/// Named POSIX semaphore, closed and unlinked on drop.
struct NamedSem {
    name: CString,
    sem: *mut libc::sem_t,
}

unsafe impl Send for NamedSem {}

impl NamedSem {
    fn create(name: CString, initial: u32) -> Result<Self> {
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(TransportError::last_os("sem_open"));
        }
        Ok(Self { name, sem })
    }

    fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(TransportError::last_os("sem_post"));
        }
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            if last_errno() != libc::EINTR {
                return Err(TransportError::last_os("sem_wait"));
            }
        }
    }

    fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }
}

impl Drop for NamedSem {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            libc::sem_unlink(self.name.as_ptr());
        }
    }
}

/// POSIX object names live in one flat namespace rooted at `/`.
fn object_name(device: &str, suffix: &str) -> Result<CString> {
    if device.is_empty() || device.contains('/') {
        return Err(TransportError::Setup(format!(
            "invalid shared memory object name '{device}'"
        )));
    }
    CString::new(format!("/{device}{suffix}"))
        .map_err(|_| TransportError::Setup(format!("invalid shared memory object name '{device}'")))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
