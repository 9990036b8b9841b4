use diskproxy_storage::{Backing, ImageIo};
use tracing::{debug, error, info, warn};

use crate::proto::{
    InfoResponse, IoRequest, IoResponse, RequestTag, IO_REQUEST_SIZE, TAG_SIZE,
};
use crate::transport::{Transport, TransportError};

/// Byte range of the backing exposed to the client, plus the INFO fields
/// advertising it.
#[derive(Copy, Clone, Debug)]
pub struct ServeGeometry {
    /// Base added to every client offset.
    pub image_offset: u64,
    /// Bytes exposed starting at `image_offset`.
    pub file_size: u64,
    pub req_alignment: u64,
    pub read_only: bool,
}

impl ServeGeometry {
    fn info(&self) -> InfoResponse {
        InfoResponse {
            file_size: self.file_size,
            req_alignment: self.req_alignment,
            flags: if self.read_only {
                crate::proto::FLAG_READ_ONLY
            } else {
                0
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session failed: {0}")]
pub struct SessionFailed(#[from] pub TransportError);

/// Serve requests until the client goes away.
///
/// Strictly serial: one request is consumed, answered and flushed before the
/// next is read. Errors inside a request are packaged into the response;
/// transport errors mid-request fail the session; the client disappearing
/// between requests is a clean shutdown.
pub fn run<B: Backing, T: Transport>(
    image: &mut ImageIo<B>,
    transport: &mut T,
    geometry: ServeGeometry,
) -> Result<(), SessionFailed> {
    loop {
        let mut raw_tag = [0u8; TAG_SIZE];
        if transport.read(&mut raw_tag).is_err() {
            info!("connection closed");
            return Ok(());
        }

        match RequestTag::from(u64::from_le_bytes(raw_tag)) {
            RequestTag::Info => send_info(transport, &geometry)?,
            RequestTag::Read => handle_read(image, transport, &geometry)?,
            RequestTag::Write => handle_write(image, transport, &geometry)?,
            RequestTag::Unknown(tag) => {
                warn!(tag = %format_args!("{tag:#018x}"), "unknown request");
                let reply = (libc::ENODEV as u64).to_le_bytes();
                transport.write(&reply)?;
                transport.flush()?;
            }
        }
    }
}

pub fn send_info<T: Transport>(
    transport: &mut T,
    geometry: &ServeGeometry,
) -> Result<(), SessionFailed> {
    transport.write(&geometry.info().encode())?;
    transport.flush()?;
    Ok(())
}

fn read_io_request<T: Transport>(transport: &mut T) -> Result<IoRequest, SessionFailed> {
    let mut raw = [0u8; IO_REQUEST_SIZE];
    transport.read(&mut raw)?;
    Ok(IoRequest::decode(&raw))
}

fn handle_read<B: Backing, T: Transport>(
    image: &mut ImageIo<B>,
    transport: &mut T,
    geometry: &ServeGeometry,
) -> Result<(), SessionFailed> {
    let req = read_io_request(transport)?;

    if req.length > transport.buffer_size() as u64 {
        if let Err(err) = transport.grow(req.length) {
            warn!(%err, wanted = req.length, "buffer grow failed; clamping transfer");
        }
    }

    let size = (req.length).min(transport.buffer_size() as u64) as usize;
    debug!(offset = req.offset, length = req.length, size, "read request");

    let response = match geometry.image_offset.checked_add(req.offset) {
        None => IoResponse::error(libc::EINVAL),
        Some(offset) => {
            let buf = &mut transport.payload()[..size];
            buf.fill(0);
            match image.read_at(buf, offset) {
                Ok(got) => {
                    if got as u64 != req.length {
                        warn!(
                            offset,
                            got,
                            requested = req.length,
                            "partial read"
                        );
                    }
                    IoResponse::ok(got as u64)
                }
                Err(err) => {
                    error!(%err, offset, "device read failed");
                    IoResponse::error(err.wire_errno())
                }
            }
        }
    };

    transport.write(&response.encode())?;
    if response.errorno == 0 {
        transport.write_payload(response.length as usize)?;
    }
    transport.flush()?;
    Ok(())
}

fn handle_write<B: Backing, T: Transport>(
    image: &mut ImageIo<B>,
    transport: &mut T,
    geometry: &ServeGeometry,
) -> Result<(), SessionFailed> {
    let req = read_io_request(transport)?;
    debug!(offset = req.offset, length = req.length, "write request");

    if req.length > transport.buffer_size() as u64 {
        // The kernel transport renegotiates oversized writes before the
        // request ever reaches us; anywhere else this is a broken client.
        error!(length = req.length, "write request exceeds buffer");
        return Err(TransportError::TooLarge {
            wanted: req.length as usize,
            capacity: transport.buffer_size(),
        }
        .into());
    }

    let len = req.length as usize;
    transport.read_payload(len)?;

    let response = if geometry.read_only {
        warn!("write attempt on read-only device");
        IoResponse::error(libc::EBADF)
    } else {
        match geometry.image_offset.checked_add(req.offset) {
            None => IoResponse::error(libc::EINVAL),
            Some(offset) => {
                let buf = &transport.payload()[..len];
                match image.write_at(buf, offset) {
                    Ok(got) => {
                        if got as u64 != req.length {
                            warn!(
                                offset,
                                got,
                                requested = req.length,
                                "partial write"
                            );
                        }
                        IoResponse::ok(got as u64)
                    }
                    Err(err) => {
                        error!(%err, offset, "device write failed");
                        IoResponse::error(err.wire_errno())
                    }
                }
            }
        }
    };

    transport.write(&response.encode())?;
    transport.flush()?;
    Ok(())
}
