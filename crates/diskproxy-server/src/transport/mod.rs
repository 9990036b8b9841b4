//! Transports carry framed requests and responses between the proxy and its
//! single client, and own the payload buffer the protocol engine works in.
//!
//! Header fields move through `read`/`write`; bulk data lives in the payload
//! buffer and moves through `read_payload`/`write_payload`, which are real
//! wire I/O for the socket transport and no-ops for the mapped transports
//! (the client writes straight into the shared payload slot).

use thiserror::Error;

mod socket;

#[cfg(unix)]
mod drv;
#[cfg(unix)]
mod shm;

pub use socket::{PendingTcp, SocketTransport};

#[cfg(unix)]
pub use drv::DrvTransport;
#[cfg(unix)]
pub use shm::ShmTransport;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer went away. On a request-tag boundary this is a clean shutdown.
    #[error("transport closed by peer")]
    Closed,

    #[error("transport i/o failed: {context}: {}", errno_string(.errno))]
    Io { context: &'static str, errno: i32 },

    #[error("message does not fit the transport buffer ({wanted} > {capacity})")]
    TooLarge { wanted: usize, capacity: usize },

    #[error("transport setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    #[cfg(unix)]
    pub(crate) fn last_os(context: &'static str) -> Self {
        TransportError::Io {
            context,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    pub(crate) fn io(context: &'static str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return TransportError::Closed;
        }
        TransportError::Io {
            context,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

/// Platform error description, the way the system formats it.
fn errno_string(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}

pub trait Transport {
    /// Read exactly `buf.len()` header bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write exactly `buf.len()` header bytes.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Make the first `len` payload bytes valid (wire read or no-op).
    fn read_payload(&mut self, len: usize) -> Result<()>;

    /// Emit the first `len` payload bytes (wire write or no-op).
    fn write_payload(&mut self, len: usize) -> Result<()>;

    /// The payload buffer the engine fills and drains.
    fn payload(&mut self) -> &mut [u8];

    fn buffer_size(&self) -> usize;

    /// Try to make the payload buffer at least `wanted` bytes. Transports
    /// with a fixed mapping may keep their current size; the engine clamps
    /// oversized requests to whatever `buffer_size` ends up being.
    fn grow(&mut self, wanted: u64) -> Result<()>;

    /// Complete the current round trip: push the response to the client and
    /// (for rendezvous transports) block until the next request arrives.
    fn flush(&mut self) -> Result<()>;
}
