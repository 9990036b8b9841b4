//! Block-device proxy server.
//!
//! One backing image, one client, one request in flight. The crate splits
//! into: the wire [`proto`], the [`transport`] layer (TCP/stdio/device,
//! shared memory, kernel driver), the [`session`] request loop, and the
//! [`bootstrap`] sequence wiring a parsed [`config::Cli`] into a running
//! server. Disk formats and partition handling live in `diskproxy-storage`.

pub mod bootstrap;
pub mod config;
pub mod fatal;
pub mod proto;
pub mod session;
pub mod transport;
