//! Wire protocol: little-endian packed request/response messages.
//!
//! Every request starts with a 64-bit tag. INFO has no further fields; READ
//! and WRITE carry `{offset, length}`, and WRITE is followed by `length`
//! payload bytes. Responses to READ/WRITE are `{errorno, length}` with the
//! READ payload trailing a successful response.

/// Tag family: high bits are a protocol magic, the low byte selects the
/// operation.
pub const REQ_TAG_INFO: u64 = 0x8474495900000001;
pub const REQ_TAG_READ: u64 = 0x8474495900000002;
pub const REQ_TAG_WRITE: u64 = 0x8474495900000003;

/// INFO response flag: image is served read-only.
pub const FLAG_READ_ONLY: u64 = 1;

/// Reserved header region at the front of shared-memory style transports;
/// request/response fields are serialized here, the payload slot follows.
pub const SHM_HEADER_SIZE: usize = 4096;

pub const TAG_SIZE: usize = 8;
pub const IO_REQUEST_SIZE: usize = 16;
pub const IO_RESPONSE_SIZE: usize = 16;
pub const INFO_RESPONSE_SIZE: usize = 24;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestTag {
    Info,
    Read,
    Write,
    Unknown(u64),
}

impl From<u64> for RequestTag {
    fn from(raw: u64) -> Self {
        match raw {
            REQ_TAG_INFO => Self::Info,
            REQ_TAG_READ => Self::Read,
            REQ_TAG_WRITE => Self::Write,
            other => Self::Unknown(other),
        }
    }
}

/// Geometry advertised to the client on INFO.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InfoResponse {
    pub file_size: u64,
    pub req_alignment: u64,
    pub flags: u64,
}

impl InfoResponse {
    pub fn encode(&self) -> [u8; INFO_RESPONSE_SIZE] {
        let mut out = [0u8; INFO_RESPONSE_SIZE];
        out[0..8].copy_from_slice(&self.file_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.req_alignment.to_le_bytes());
        out[16..24].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; INFO_RESPONSE_SIZE]) -> Self {
        Self {
            file_size: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            req_alignment: u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
            flags: u64::from_le_bytes(bytes[16..24].try_into().expect("8 bytes")),
        }
    }
}

/// Fields of a READ or WRITE request after the tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoRequest {
    pub offset: u64,
    pub length: u64,
}

impl IoRequest {
    pub fn decode(bytes: &[u8; IO_REQUEST_SIZE]) -> Self {
        Self {
            offset: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            length: u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
        }
    }

    pub fn encode(&self) -> [u8; IO_REQUEST_SIZE] {
        let mut out = [0u8; IO_REQUEST_SIZE];
        out[0..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// READ/WRITE response header. `length` is the number of bytes actually
/// transferred; for READ a successful response is followed by that many
/// payload bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoResponse {
    pub errorno: u64,
    pub length: u64,
}

impl IoResponse {
    pub fn ok(length: u64) -> Self {
        Self { errorno: 0, length }
    }

    pub fn error(errno: i32) -> Self {
        Self {
            errorno: errno as u64,
            length: 0,
        }
    }

    pub fn encode(&self) -> [u8; IO_RESPONSE_SIZE] {
        let mut out = [0u8; IO_RESPONSE_SIZE];
        out[0..8].copy_from_slice(&self.errorno.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; IO_RESPONSE_SIZE]) -> Self {
        Self {
            errorno: u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
            length: u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_map_to_operations() {
        assert_eq!(RequestTag::from(REQ_TAG_INFO), RequestTag::Info);
        assert_eq!(RequestTag::from(REQ_TAG_READ), RequestTag::Read);
        assert_eq!(RequestTag::from(REQ_TAG_WRITE), RequestTag::Write);
        assert_eq!(
            RequestTag::from(0xDEADBEEF),
            RequestTag::Unknown(0xDEADBEEF)
        );
    }

    #[test]
    fn info_response_layout_is_little_endian() {
        let info = InfoResponse {
            file_size: 0x0102030405060708,
            req_alignment: 1,
            flags: FLAG_READ_ONLY,
        };
        let bytes = info.encode();
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[7], 0x01);
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[16], 1);
        assert_eq!(InfoResponse::decode(&bytes), info);
    }

    #[test]
    fn io_messages_roundtrip() {
        let req = IoRequest {
            offset: 512,
            length: 4096,
        };
        assert_eq!(IoRequest::decode(&req.encode()), req);

        let resp = IoResponse::ok(4096);
        assert_eq!(IoResponse::decode(&resp.encode()), resp);
        assert_eq!(IoResponse::error(libc::EBADF).errorno, libc::EBADF as u64);
    }
}
