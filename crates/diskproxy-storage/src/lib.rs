//! Disk image plumbing for the diskproxy server.
//!
//! The proxy exposes a byte range of some backing store to a remote client.
//! This crate provides everything between the wire protocol and the bytes on
//! disk:
//!
//! - [`Backing`]: positional read/write over a file, a loaded provider
//!   plugin, or an in-memory buffer
//! - [`VhdDisk`]: translator for dynamically expanding Microsoft VHD images
//!   (block allocation table, sector bitmaps, footer mirror)
//! - [`resolve_partition`]: MBR / extended-partition walk mapping a partition
//!   index to a byte extent
//! - [`ImageIo`]: dispatcher routing logical I/O either straight to the
//!   backing or through the VHD translator
//!
//! Transports and the request loop live in the `diskproxy-server` crate.

mod backing;
mod error;
mod file;
mod image;
mod mbr;
mod plugin;
mod util;
mod vhd;

pub use backing::{Backing, MemBacking};
pub use error::{ProxyError, Result};
pub use file::FileBacking;
pub use image::ImageIo;
pub use mbr::{resolve_partition, PartitionExtent};
pub use plugin::{split_plugin_spec, PluginBacking};
pub use vhd::{VhdDisk, VhdGeometry, SECTOR_SIZE};
