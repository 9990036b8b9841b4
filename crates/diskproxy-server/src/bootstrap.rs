use std::path::Path;

use diskproxy_storage::{
    resolve_partition, Backing, FileBacking, ImageIo, PluginBacking, ProxyError, VhdDisk,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{
    classify_comm, parse_scaled, Cli, CommEndpoint, SizeArg, DEFAULT_ALIGNMENT,
    DEFAULT_BUFFER_SIZE, EXIT_IMAGE, EXIT_TRANSPORT, EXIT_USAGE, EXIT_VOLUME_PREP,
};
use crate::session::{self, ServeGeometry, SessionFailed};
use crate::transport::{PendingTcp, SocketTransport, TransportError};

#[cfg(unix)]
use crate::transport::{DrvTransport, ShmTransport};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Image(#[from] ProxyError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot determine size of read-write volume '{0}'")]
    VolumePrep(String),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Session(#[from] SessionFailed),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Image(_) => EXIT_IMAGE,
            StartupError::Transport(_) => EXIT_TRANSPORT,
            StartupError::VolumePrep(_) => EXIT_VOLUME_PREP,
            StartupError::Usage(_) => EXIT_USAGE,
            StartupError::Session(_) => EXIT_IMAGE,
        }
    }
}

type DynBacking = Box<dyn Backing + Send>;

/// Full server lifecycle: open the backing, work out the exposed geometry,
/// stand up the transport and run the session until the client goes away.
pub fn serve(cli: Cli) -> Result<(), StartupError> {
    // ----- backing -----
    let mut plugin_reported_size = 0u64;
    let mut backing: DynBacking = match &cli.plugin {
        Some(spec) => {
            let (library, entry) = diskproxy_storage::split_plugin_spec(spec)?;
            let plugin = PluginBacking::open(library, entry, &cli.image, cli.read_only)?;
            plugin_reported_size = plugin.reported_size();
            Box::new(plugin)
        }
        None => Box::new(FileBacking::open(Path::new(&cli.image), cli.read_only)?),
    };
    info!(image = %cli.image, "successfully opened image");

    // ----- VHD probe -----
    let mut file_size = plugin_reported_size;
    let mut current_size = 0u64;

    let mut image: ImageIo<DynBacking> = if !cli.no_vhd && VhdDisk::probe(&mut backing)? {
        let vhd = VhdDisk::open(backing)?;
        let geom = vhd.geometry();
        info!("detected dynamically expanding Microsoft VHD image file format");
        info!(
            block_size = vhd.block_size(),
            cylinders = geom.cylinders,
            heads = geom.heads,
            sectors_per_track = geom.sectors_per_track,
            "vhd geometry"
        );
        current_size = vhd.current_size();
        file_size = current_size;
        ImageIo::Vhd(vhd)
    } else {
        ImageIo::Raw(backing)
    };

    // ----- size / partition argument -----
    let mut partition_number = 0u32;
    match &cli.size_or_partition {
        Some(raw) => match parse_scaled(raw).map_err(StartupError::Usage)? {
            SizeArg::Bytes(bytes) => file_size = bytes,
            SizeArg::Bare(n) if n < 512 => partition_number = n as u32,
            SizeArg::Bare(sectors) => file_size = sectors << 9,
        },
        None => partition_number = 1,
    }

    // ----- size discovery -----
    if file_size == 0 {
        file_size = match &mut image {
            ImageIo::Raw(backing) => backing.len()?,
            ImageIo::Vhd(_) => 0,
        };
        if file_size == 0 {
            if !cli.read_only && image_is_device(&cli.image) {
                return Err(StartupError::VolumePrep(cli.image.clone()));
            }
            warn!("cannot determine size of image; the client must know it");
        }
    }
    if current_size == 0 {
        current_size = file_size;
    }
    if file_size != 0 {
        info!(bytes = file_size, "image size used");
    }

    // ----- partition selection -----
    let mut image_offset = 0u64;
    if (1..512).contains(&partition_number) {
        match resolve_partition(&mut image, current_size, partition_number)? {
            Some(extent) => {
                image_offset = extent.offset;
                file_size = extent.len;
                info!(partition = partition_number, "using partition");
            }
            None => info!("no master boot record detected; using entire image"),
        }
    }

    // ----- offset / alignment / buffer size arguments -----
    let mut tuning = cli.tuning.iter();
    if image_offset == 0 {
        if let Some(raw) = tuning.next() {
            image_offset = match parse_scaled(raw).map_err(StartupError::Usage)? {
                SizeArg::Bytes(bytes) => bytes,
                SizeArg::Bare(sectors) => sectors << 9,
            };
        }
    }

    let req_alignment = match tuning.next() {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| StartupError::Usage(format!("invalid alignment: '{raw}'")))?,
        None => DEFAULT_ALIGNMENT,
    };

    let buffer_size = match tuning.next() {
        Some(raw) => match parse_scaled(raw).map_err(StartupError::Usage)? {
            SizeArg::Bytes(bytes) | SizeArg::Bare(bytes) => usize::try_from(bytes)
                .map_err(|_| StartupError::Usage(format!("buffer size too large: '{raw}'")))?,
        },
        None => DEFAULT_BUFFER_SIZE,
    };

    info!(
        total = current_size,
        exposed = file_size,
        offset = image_offset,
        alignment = req_alignment,
        buffer = buffer_size,
        "serving image"
    );

    let geometry = ServeGeometry {
        image_offset,
        file_size,
        req_alignment,
        read_only: cli.read_only,
    };

    // ----- transport + session -----
    match classify_comm(&cli.comm, cli.force_driver) {
        CommEndpoint::Tcp(port) => {
            let pending = PendingTcp::bind(port)?;
            let mut transport = pending.accept(buffer_size)?;
            session::run(&mut image, &mut transport, geometry)?;
        }
        CommEndpoint::Stdio => {
            let mut transport = SocketTransport::stdio(buffer_size)?;
            session::run(&mut image, &mut transport, geometry)?;
        }
        CommEndpoint::Device(path) => {
            let mut transport = SocketTransport::device(&path, buffer_size)?;
            session::run(&mut image, &mut transport, geometry)?;
        }
        #[cfg(unix)]
        CommEndpoint::Shm(name) => {
            let mut transport = ShmTransport::create(&name, buffer_size)?;
            transport.wait_for_client(&name)?;
            session::run(&mut image, &mut transport, geometry)?;
        }
        #[cfg(unix)]
        CommEndpoint::Drv(name) => {
            let mut transport = DrvTransport::open(&name, buffer_size)?;
            info!(device = %name, "waiting for client connection on driver object");
            // The driver delivers an INFO push to the connecting client; the
            // flush inside blocks until the first real request arrives.
            transport.prime_info();
            session::send_info(&mut transport, &geometry)
                .map_err(|err| StartupError::Transport(err.0))?;
            info!(device = %name, "connection on driver object");
            session::run(&mut image, &mut transport, geometry)?;
        }
        #[cfg(not(unix))]
        CommEndpoint::Shm(_) | CommEndpoint::Drv(_) => {
            return Err(StartupError::Transport(TransportError::Setup(
                "shared memory and driver transports are only supported on unix".into(),
            )));
        }
    }

    Ok(())
}

#[cfg(unix)]
fn image_is_device(path: &str) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device() || m.file_type().is_char_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn image_is_device(_path: &str) -> bool {
    false
}
