use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Backing store I/O failed; carries the platform errno so the protocol
    /// engine can surface it in the response header.
    #[error("backing i/o failed: {context}: {}", errno_string(.errno))]
    BackingIo { context: &'static str, errno: i32 },

    /// Backing store transferred fewer bytes than a structural operation
    /// (BAT entry, bitmap run, block composite) requires.
    #[error("short i/o: {context}: got {got}, wanted {wanted}")]
    ShortIo {
        context: &'static str,
        got: usize,
        wanted: usize,
    },

    #[error("malformed image: {0}")]
    BadFormat(&'static str),

    #[error("partition {index} not found")]
    PartitionNotFound { index: u32 },

    #[error("write rejected: {0}")]
    PolicyViolation(&'static str),

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("allocation failed: {0}")]
    AllocFailure(&'static str),

    #[error("provider plugin error: {0}")]
    Plugin(String),
}

impl ProxyError {
    /// errno to report on the wire for this failure.
    pub fn wire_errno(&self) -> i32 {
        match self {
            ProxyError::BackingIo { errno, .. } if *errno != 0 => *errno,
            ProxyError::PolicyViolation(_) => libc::EBADF,
            // Structural failures have no errno of their own; E2BIG stands in.
            _ => libc::E2BIG,
        }
    }

    pub(crate) fn last_os(context: &'static str) -> Self {
        ProxyError::BackingIo {
            context,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    pub(crate) fn io(context: &'static str, err: &std::io::Error) -> Self {
        ProxyError::BackingIo {
            context,
            errno: err.raw_os_error().unwrap_or(0),
        }
    }
}

/// Platform error description, the way the system formats it.
fn errno_string(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}
