//! `std::io` flavoured byte streams over RDMA.
//!
//! ```no_run
//! use std::io::{Read, Write};
//!
//! use rdma_stream::{Loopback, RdmaListener, RdmaStream};
//!
//! # fn main() -> std::io::Result<()> {
//! let fabric = Loopback::new();
//! let listener = RdmaListener::bind(fabric.clone(), "127.0.0.1:7471")?;
//! let echo = std::thread::spawn(move || -> std::io::Result<()> {
//!     let (mut stream, _peer) = listener.accept()?;
//!     let mut buf = [0u8; 4];
//!     stream.read_exact(&mut buf)?;
//!     stream.write_all(&buf)
//! });
//!
//! let mut client = RdmaStream::connect(fabric, "127.0.0.1:7471")?;
//! client.write_all(b"ping")?;
//! let mut buf = [0u8; 4];
//! client.read_exact(&mut buf)?;
//! echo.join().unwrap()?;
//! # Ok(())
//! # }
//! ```

mod listener;
mod stream;

pub use listener::{Incoming, RdmaListener};
pub use stream::RdmaStream;

pub use rdma_stream_core::fabric::Fabric;
pub use rdma_stream_core::{Config, Connection, Error, Loopback, Stats};
#[cfg(feature = "verbs")]
pub use rdma_stream_core::Verbs;
