use core::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const PROTOCOL_MAGIC: u8 = 0xC0;
pub const PROTOCOL_VERSION: u8 = 0x03;

/// Bytes one RDMA write may report in its immediate data (28 bits).
pub const MAX_BYTES_PER_WRITE: u32 = (1 << 28) - 1;
/// FC messages one RDMA write may acknowledge in its immediate data (4 bits).
pub const MAX_FCS_PER_WRITE: u32 = (1 << 4) - 1;

/// Size of one registered control-message buffer.
pub const MESSAGE_BUFFER_SIZE: usize = 32;

const HEADER_SIZE: usize = 2;
const SETUP_PAYLOAD_SIZE: u8 = 24;
const FC_PAYLOAD_SIZE: u8 = 8;

/// Private data carried by the connect request and the accept.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParamData {
    pub magic: u8,
    pub version: u8,
    reserved: u16,
    pub depth: i32,
}

impl ConnParamData {
    pub const SIZE: usize = 8;

    pub fn new(depth: i32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            reserved: 0,
            depth,
        }
    }

    /// Builds private data with arbitrary magic and version.
    pub fn with_protocol(magic: u8, version: u8, depth: i32) -> Self {
        Self {
            magic,
            version,
            ..Self::new(depth)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes the private data of a connection event.
    ///
    /// Transports may deliver more bytes than were sent; anything shorter than
    /// [`ConnParamData::SIZE`] decodes to all zeroes, which never matches.
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.len() < Self::SIZE {
            return Self::with_protocol(0, 0, 0);
        }
        bincode::deserialize(&data[..Self::SIZE]).unwrap_or(Self::with_protocol(0, 0, 0))
    }

    pub fn is_compatible(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }

    /// Fails with [`Error::ProtocolMismatch`] unless magic and version match.
    pub fn check(&self) -> Result<()> {
        if self.is_compatible() {
            Ok(())
        } else {
            Err(Error::ProtocolMismatch {
                magic: self.magic,
                version: self.version,
            })
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Setup = 1 << 0,
    Fc = 1 << 1,
}

#[derive(Serialize, Deserialize)]
struct Header {
    opcode: u8,
    length: u8,
}

/// Describes the sink ring buffer a peer may RDMA write into.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPayload {
    pub rbase: u64,
    pub rlen: u64,
    pub rkey: u64,
}

/// Receive progress, sent after the reader drains its sink.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FcPayload {
    pub bytes_received: u32,
    pub writes_received: u32,
}

/// Control messages carried by two-sided sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Setup(SetupPayload),
    Fc(FcPayload),
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Setup(_) => OpCode::Setup,
            Message::Fc(_) => OpCode::Fc,
        }
    }

    /// Serializes into `buf`, returning the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let capacity = buf.len();
        let mut writer = &mut *buf;
        let (length, payload) = match self {
            Message::Setup(setup) => (SETUP_PAYLOAD_SIZE, bincode::serialize(setup)?),
            Message::Fc(fc) => (FC_PAYLOAD_SIZE, bincode::serialize(fc)?),
        };
        let header = Header {
            opcode: self.opcode() as u8,
            length,
        };
        bincode::serialize_into(&mut writer, &header)?;
        std::io::Write::write_all(&mut writer, &payload)
            .map_err(|err| Error::Codec(Box::new(bincode::ErrorKind::Io(err))))?;
        Ok(capacity - writer.len())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Message(format!("{} byte message", buf.len())));
        }
        let header: Header = bincode::deserialize(&buf[..HEADER_SIZE])?;
        let payload = &buf[HEADER_SIZE..];
        let expect = |len: u8, what: &str| {
            if header.length == len && payload.len() >= len as usize {
                Ok(&payload[..len as usize])
            } else {
                Err(Error::Message(format!(
                    "{what} message with {} byte payload",
                    header.length
                )))
            }
        };
        match header.opcode {
            op if op == OpCode::Setup as u8 => Ok(Message::Setup(bincode::deserialize(
                expect(SETUP_PAYLOAD_SIZE, "setup")?,
            )?)),
            op if op == OpCode::Fc as u8 => Ok(Message::Fc(bincode::deserialize(expect(
                FC_PAYLOAD_SIZE,
                "flow control",
            )?)?)),
            op => Err(Error::Message(format!("unknown opcode {op:#x}"))),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Progress piggybacked on every RDMA write as immediate data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Imm {
    pub bytes_sent: u32,
    pub fcs_received: u32,
}

impl Imm {
    /// Packs into the network-order value stored in the work request.
    pub fn to_wire(self) -> u32 {
        debug_assert!(self.bytes_sent <= MAX_BYTES_PER_WRITE);
        debug_assert!(self.fcs_received <= MAX_FCS_PER_WRITE);
        let val = (self.bytes_sent & MAX_BYTES_PER_WRITE) | (self.fcs_received << 28);
        val.to_be()
    }

    pub fn from_wire(imm_data: u32) -> Self {
        let val = u32::from_be(imm_data);
        Self {
            bytes_sent: val & MAX_BYTES_PER_WRITE,
            fcs_received: val >> 28,
        }
    }
}
