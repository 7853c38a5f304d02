//! Identifiers and the wire-format address header.
//!
//! Every frame that crosses a channel starts with one address buffer. Its
//! first byte announces the endianness of the sender so the receiver can
//! pick the matching byte order before touching the remaining fields.
//! Responses are encoded in the endianness of the original caller, which
//! makes a mixed-endian conversation symmetric from each end's view.
//!
//! ## Header layout
//!
//! ```text
//! byte 0       endianness       (0 = little, 1 = big)
//! bytes 1..5   protocol version (u32)
//! bytes 5..21  proxy id         (4 x u32)
//! bytes 21..37 stub id          (4 x u32)
//! bytes 37..45 call index       (u64)
//! byte 45      interpretation   (0 = input data, 1 = output data)
//! ```
//!
//! Payload buffers after the header are opaque to the core.

use crate::error::{ComError, ComResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rand::Rng;
use std::collections::VecDeque;

/// Version stamped into every address header.
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// A single wire buffer.
pub type Buffer = Vec<u8>;

/// A movable sequence of wire buffers. The head buffer carries the address
/// header; the tail buffers carry the encoded payload.
pub type FrameSeq = VecDeque<Buffer>;

/// Produce a random non-zero control discriminator.
pub(crate) fn nonzero_control() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let value: u32 = rng.gen();
        if value != 0 {
            return value;
        }
    }
}

/// Byte order of a peer, announced in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Endian {
    Little = 0,
    Big = 1,
}

impl Endian {
    /// Byte order of this platform.
    pub fn native() -> Endian {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    fn from_byte(value: u8) -> Option<Endian> {
        match value {
            0 => Some(Endian::Little),
            1 => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Whether a frame carries an invocation or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataInterpret {
    InputData = 0,
    OutputData = 1,
}

impl DataInterpret {
    fn from_byte(value: u8) -> Option<DataInterpret> {
        match value {
            0 => Some(DataInterpret::InputData),
            1 => Some(DataInterpret::OutputData),
            _ => None,
        }
    }
}

/// Stable identity of a proxy or stub marshall object.
///
/// The index locates the object in the process-local marshall vector; the
/// control value is a random non-zero discriminator that guards against
/// stale or forged identifiers. An identifier with `control == 0` is the
/// empty sentinel, used by clients to address the object bound to the far
/// end of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MarshallId {
    pub reserved: u32,
    pub process: u32,
    pub index: u32,
    pub control: u32,
}

impl MarshallId {
    /// Build a fresh identifier for the given slot.
    pub(crate) fn new(process: u32, index: u32) -> MarshallId {
        MarshallId {
            reserved: 0,
            process,
            index,
            control: nonzero_control(),
        }
    }

    /// The empty sentinel addresses the initial marshall object of a channel.
    pub fn is_empty(&self) -> bool {
        self.control == 0
    }

    /// Fixed little-endian form used inside payload encodings.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        LittleEndian::write_u32(&mut bytes[0..4], self.reserved);
        LittleEndian::write_u32(&mut bytes[4..8], self.process);
        LittleEndian::write_u32(&mut bytes[8..12], self.index);
        LittleEndian::write_u32(&mut bytes[12..16], self.control);
        bytes
    }

    /// Inverse of [`MarshallId::to_le_bytes`].
    pub fn from_le_bytes(bytes: &[u8]) -> Option<MarshallId> {
        if bytes.len() < 16 {
            return None;
        }
        Some(MarshallId {
            reserved: LittleEndian::read_u32(&bytes[0..4]),
            process: LittleEndian::read_u32(&bytes[4..8]),
            index: LittleEndian::read_u32(&bytes[8..12]),
            control: LittleEndian::read_u32(&bytes[12..16]),
        })
    }
}

/// Identity of an established connection inside the communication control.
///
/// Connection slots are nulled on removal, never compacted, so the index
/// stays valid for the lifetime of the control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub index: u32,
    pub control: u32,
}

impl ConnectionId {
    pub(crate) fn new(index: u32) -> ConnectionId {
        ConnectionId {
            index,
            control: nonzero_control(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.control == 0
    }
}

/// The address header prepended to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshallAddress {
    pub endian: Endian,
    pub version: u32,
    pub proxy_id: MarshallId,
    pub stub_id: MarshallId,
    pub call_index: u64,
    pub interpret: DataInterpret,
}

impl MarshallAddress {
    /// Exact size of an encoded header.
    pub const ENCODED_LEN: usize = 46;

    /// Serialize the header in its own byte order.
    pub fn encode(&self) -> Buffer {
        let mut buffer = vec![0u8; Self::ENCODED_LEN];
        buffer[0] = self.endian as u8;
        match self.endian {
            Endian::Little => self.encode_fields::<LittleEndian>(&mut buffer),
            Endian::Big => self.encode_fields::<BigEndian>(&mut buffer),
        }
        buffer[45] = self.interpret as u8;
        buffer
    }

    fn encode_fields<E: ByteOrder>(&self, buffer: &mut [u8]) {
        E::write_u32(&mut buffer[1..5], self.version);
        Self::encode_id::<E>(&mut buffer[5..21], &self.proxy_id);
        Self::encode_id::<E>(&mut buffer[21..37], &self.stub_id);
        E::write_u64(&mut buffer[37..45], self.call_index);
    }

    fn encode_id<E: ByteOrder>(buffer: &mut [u8], id: &MarshallId) {
        E::write_u32(&mut buffer[0..4], id.reserved);
        E::write_u32(&mut buffer[4..8], id.process);
        E::write_u32(&mut buffer[8..12], id.index);
        E::write_u32(&mut buffer[12..16], id.control);
    }

    /// Deserialize a header, choosing the byte order announced by the
    /// leading byte.
    pub fn decode(buffer: &[u8]) -> ComResult<MarshallAddress> {
        if buffer.len() < Self::ENCODED_LEN {
            return Err(ComError::Marshalling(format!(
                "address header too short: {} bytes",
                buffer.len()
            )));
        }
        let endian = Endian::from_byte(buffer[0])
            .ok_or_else(|| ComError::Marshalling(format!("invalid endian byte {}", buffer[0])))?;
        let interpret = DataInterpret::from_byte(buffer[45]).ok_or_else(|| {
            ComError::Marshalling(format!("invalid interpretation byte {}", buffer[45]))
        })?;
        let mut address = match endian {
            Endian::Little => Self::decode_fields::<LittleEndian>(buffer),
            Endian::Big => Self::decode_fields::<BigEndian>(buffer),
        };
        address.endian = endian;
        address.interpret = interpret;
        Ok(address)
    }

    fn decode_fields<E: ByteOrder>(buffer: &[u8]) -> MarshallAddress {
        MarshallAddress {
            endian: Endian::Little,
            version: E::read_u32(&buffer[1..5]),
            proxy_id: Self::decode_id::<E>(&buffer[5..21]),
            stub_id: Self::decode_id::<E>(&buffer[21..37]),
            call_index: E::read_u64(&buffer[37..45]),
            interpret: DataInterpret::InputData,
        }
    }

    fn decode_id<E: ByteOrder>(buffer: &[u8]) -> MarshallId {
        MarshallId {
            reserved: E::read_u32(&buffer[0..4]),
            process: E::read_u32(&buffer[4..8]),
            index: E::read_u32(&buffer[8..12]),
            control: E::read_u32(&buffer[12..16]),
        }
    }
}
