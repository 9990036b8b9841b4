use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::path::Path;

use tracing::{info, warn};

use super::{Result, Transport, TransportError};

/// Largest payload buffer the heap transport will allocate.
const MAX_BUFFER_SIZE: u64 = (usize::MAX >> 1) as u64;

enum Stream {
    Tcp(TcpStream),
    Stdio {
        stdin: std::io::Stdin,
        stdout: std::io::Stdout,
    },
    Device(File),
}

impl Stream {
    fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        let res = match self {
            Stream::Tcp(s) => s.read_exact(buf),
            Stream::Stdio { stdin, .. } => stdin.read_exact(buf),
            Stream::Device(f) => f.read_exact(buf),
        };
        res.map_err(|e| TransportError::io("stream read", &e))
    }

    fn write_full(&mut self, buf: &[u8]) -> Result<()> {
        let res = match self {
            Stream::Tcp(s) => s.write_all(buf).and_then(|()| s.flush()),
            Stream::Stdio { stdout, .. } => stdout.write_all(buf).and_then(|()| stdout.flush()),
            Stream::Device(f) => f.write_all(buf).and_then(|()| f.flush()),
        };
        res.map_err(|e| TransportError::io("stream write", &e))
    }
}

/// A TCP listener waiting for its single client. Splitting bind from accept
/// lets the caller learn the bound port (and tests use an ephemeral one).
pub struct PendingTcp {
    listener: TcpListener,
}

impl PendingTcp {
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| TransportError::Setup(format!("bind port {port}: {e}")))?;
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Block for the client, then stop listening: the proxy serves exactly
    /// one session.
    pub fn accept(self, buffer_size: usize) -> Result<SocketTransport> {
        info!(port = self.local_port(), "waiting for connection");

        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| TransportError::Setup(format!("accept: {e}")))?;
        info!(%peer, "got connection");

        if let Err(err) = stream.set_nodelay(true) {
            warn!(%err, "could not set TCP_NODELAY");
        }

        SocketTransport::new(Stream::Tcp(stream), buffer_size)
    }
}

/// Byte-stream transport: TCP connection, stdio, or a local device path.
/// The payload buffer is an ordinary heap allocation.
pub struct SocketTransport {
    stream: Stream,
    payload: Vec<u8>,
}

impl SocketTransport {
    fn new(stream: Stream, buffer_size: usize) -> Result<Self> {
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(buffer_size)
            .map_err(|_| TransportError::Setup("payload buffer allocation failed".into()))?;
        payload.resize(buffer_size, 0);
        Ok(Self { stream, payload })
    }

    /// Serve over the process's standard input/output.
    pub fn stdio(buffer_size: usize) -> Result<Self> {
        Self::new(
            Stream::Stdio {
                stdin: std::io::stdin(),
                stdout: std::io::stdout(),
            },
            buffer_size,
        )
    }

    /// Serve over a named byte-stream device (pipe, character device).
    pub fn device(path: &Path, buffer_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TransportError::Setup(format!("open {}: {e}", path.display())))?;
        info!(path = %path.display(), "waiting for requests on device");
        Self::new(Stream::Device(file), buffer_size)
    }
}

impl Transport for SocketTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_full(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_full(buf)
    }

    fn read_payload(&mut self, len: usize) -> Result<()> {
        if len > self.payload.len() {
            return Err(TransportError::TooLarge {
                wanted: len,
                capacity: self.payload.len(),
            });
        }
        self.stream.read_full(&mut self.payload[..len])
    }

    fn write_payload(&mut self, len: usize) -> Result<()> {
        if len > self.payload.len() {
            return Err(TransportError::TooLarge {
                wanted: len,
                capacity: self.payload.len(),
            });
        }
        self.stream.write_full(&self.payload[..len])
    }

    fn payload(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    fn buffer_size(&self) -> usize {
        self.payload.len()
    }

    fn grow(&mut self, wanted: u64) -> Result<()> {
        let wanted = wanted.min(MAX_BUFFER_SIZE) as usize;
        if wanted <= self.payload.len() {
            return Ok(());
        }
        let extra = wanted - self.payload.len();
        self.payload
            .try_reserve_exact(extra)
            .map_err(|_| TransportError::Setup("payload buffer reallocation failed".into()))?;
        self.payload.resize(wanted, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
