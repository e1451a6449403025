use std::io;

use thiserror::Error;

use crate::connection::State;
use crate::fabric::CmEventKind;
use crate::flow_control::CreditError;
use crate::message_buffer::PoolError;
use crate::ring_ptr::RingError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid connection state {0:?}")]
    State(State),
    #[error("invalid configuration, {0}")]
    Config(String),
    #[error("failed to look up address {0}")]
    Lookup(String),
    #[error("failed to resolve {what}, {reason}")]
    Resolve { what: &'static str, reason: String },
    #[error("protocol mismatch, magic {magic:#04x}, version {version:#04x}")]
    ProtocolMismatch { magic: u8, version: u8 },
    #[error("peer proposed queue depth {0}, out of range")]
    DepthOutOfRange(i32),
    #[error("connection rejected by peer, status {0}")]
    Rejected(i32),
    #[error("unexpected connection manager event {got:?}, expected {expected:?}")]
    UnexpectedEvent {
        got: CmEventKind,
        expected: CmEventKind,
    },
    #[error("{op} failed, {source}")]
    Device {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("work completion {wr_id:#x} failed, {status}")]
    Completion { wr_id: u64, status: String },
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("peer disconnected")]
    Disconnected,
    #[error("end of stream")]
    EndOfStream,
    #[error("ring pointer violation, {0}")]
    Ring(#[from] RingError),
    #[error("flow control violation, {0}")]
    Credit(#[from] CreditError),
    #[error("message buffer pool, {0}")]
    Pool(#[from] PoolError),
    #[error("failed to encode or decode control message, {0}")]
    Codec(#[from] bincode::Error),
    #[error("invalid control message, {0}")]
    Message(String),
    #[error("internal error, {0}")]
    Internal(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Wraps the calling thread's last OS error.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Error::Device {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn device(op: &'static str, source: io::Error) -> Self {
        Error::Device { op, source }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::State(_) => io::ErrorKind::NotConnected,
            Error::Config(_) => io::ErrorKind::InvalidInput,
            Error::Lookup(_) | Error::Resolve { .. } => io::ErrorKind::AddrNotAvailable,
            Error::ProtocolMismatch { .. }
            | Error::DepthOutOfRange(_)
            | Error::Message(_)
            | Error::Codec(_) => {
                io::ErrorKind::InvalidData
            }
            Error::Rejected(_) => io::ErrorKind::ConnectionRefused,
            Error::Timeout(_) => io::ErrorKind::TimedOut,
            Error::Disconnected => io::ErrorKind::ConnectionReset,
            Error::EndOfStream => io::ErrorKind::UnexpectedEof,
            Error::Device { source, .. } => source.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
