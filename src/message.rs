// src/message.rs
//! STUN message codec as defined in RFC 5389 Section 6.
//!
//! A [`Message`] keeps its serialized form in the `raw` backing buffer at
//! all times. Attribute writers append TLVs directly to `raw` and
//! [`Message::write_header`] patches the header afterwards, so a message
//! that has been built is already wire-ready. Inbound messages are read
//! into `raw` and parsed in place by [`Message::decode`].

use std::fmt;

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::attributes::{AttributeType, Attributes, RawAttribute, ATTRIBUTE_HEADER_SIZE};
use crate::error::{StunError, StunResult};

/// STUN magic cookie, header bytes 4..8.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of the fixed STUN message header.
pub const HEADER_SIZE: usize = 20;

/// Size of the transaction ID.
pub const TRANSACTION_ID_SIZE: usize = 12;

/// Initial capacity of the backing buffer, sized for a typical MTU.
const DEFAULT_RAW_CAPACITY: usize = 1500;

/// 96-bit transaction ID linking a response to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// Generate a fresh random transaction ID.
    pub fn new() -> Self {
        let mut id = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; TRANSACTION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get as byte slice.
    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// STUN message class, the C1/C0 bits of the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request = 0b00,
    Indication = 0b01,
    SuccessResponse = 0b10,
    ErrorResponse = 0b11,
}

impl MessageClass {
    fn from_value(value: u16) -> Self {
        match value & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Indication => "indication",
            Self::SuccessResponse => "success response",
            Self::ErrorResponse => "error response",
        };
        write!(f, "{}", name)
    }
}

/// STUN method, the 12 method bits of the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Binding,
    /// Method value this crate does not interpret.
    Raw(u16),
}

impl Method {
    /// Get the numeric method value.
    pub fn value(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Raw(value) => value,
        }
    }

    /// Create from a numeric method value.
    pub fn from_value(value: u16) -> Self {
        match value {
            0x001 => Self::Binding,
            _ => Self::Raw(value),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binding => write!(f, "binding"),
            Self::Raw(value) => write!(f, "0x{:03x}", value),
        }
    }
}

// Message type bit layout, least significant first:
// M3..M0 | C0 | M6..M4 | C1 | M11..M7 | two zero bits.
const METHOD_A_BITS: u16 = 0x000F;
const METHOD_B_BITS: u16 = 0x0070;
const METHOD_D_BITS: u16 = 0x0F80;
const METHOD_B_SHIFT: u16 = 1;
const METHOD_D_SHIFT: u16 = 2;
const CLASS_C0_SHIFT: u16 = 4;
const CLASS_C1_SHIFT: u16 = 7;
const FIRST_BIT: u16 = 0x1;
const SECOND_BIT: u16 = 0x2;

/// 14-bit encoding of method and class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    /// Encode to the 16-bit wire value, interleaving the class bits into
    /// the method bits per RFC 5389 Section 6.
    pub fn value(self) -> u16 {
        let method = self.method.value();
        let a = method & METHOD_A_BITS;
        let b = (method & METHOD_B_BITS) << METHOD_B_SHIFT;
        let d = (method & METHOD_D_BITS) << METHOD_D_SHIFT;

        let class = self.class as u16;
        let c0 = (class & FIRST_BIT) << CLASS_C0_SHIFT;
        let c1 = (class & SECOND_BIT) << CLASS_C1_SHIFT;

        a | b | d | c0 | c1
    }

    /// Decode from the 16-bit wire value. The two most significant bits
    /// must be zero.
    pub fn from_value(value: u16) -> StunResult<Self> {
        if value & 0xC000 != 0 {
            return Err(StunError::InvalidMessageType);
        }
        let class = ((value >> CLASS_C0_SHIFT) & FIRST_BIT)
            | ((value >> CLASS_C1_SHIFT) & SECOND_BIT);
        let method = (value & METHOD_A_BITS)
            | ((value >> METHOD_B_SHIFT) & METHOD_B_BITS)
            | ((value >> METHOD_D_SHIFT) & METHOD_D_BITS);
        Ok(Self {
            method: Method::from_value(method),
            class: MessageClass::from_value(class),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.class)
    }
}

/// A STUN message with its serialized backing buffer.
///
/// `length` is the attribute section length in bytes, always a multiple
/// of four. It is maintained by the attribute writers and stamped into
/// `raw` by [`Message::write_header`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub typ: MessageType,
    pub transaction_id: TransactionId,
    pub length: u16,
    pub attributes: Attributes,
    pub raw: BytesMut,
}

impl Message {
    /// Create an empty binding request with a fresh transaction ID and a
    /// pre-sized backing buffer. The header is written on the first call
    /// to [`Message::write_header`].
    pub fn new() -> Self {
        let mut raw = BytesMut::with_capacity(DEFAULT_RAW_CAPACITY);
        raw.resize(HEADER_SIZE, 0);
        Self {
            typ: MessageType::new(Method::Binding, MessageClass::Request),
            transaction_id: TransactionId::new(),
            length: 0,
            attributes: Attributes::default(),
            raw,
        }
    }

    /// Append a TLV to the attribute list and the backing buffer. The
    /// value is padded to a 4-byte boundary; the padding is excluded from
    /// the attribute length but counted in the message length.
    pub fn add_raw(&mut self, typ: AttributeType, value: &[u8]) {
        let attr = RawAttribute {
            typ,
            length: value.len() as u16,
            value: value.to_vec(),
        };
        self.raw.put_u16(typ.value());
        self.raw.put_u16(attr.length);
        self.raw.put_slice(value);

        let padded = padded_len(value.len());
        for _ in value.len()..padded {
            self.raw.put_u8(0);
        }
        self.length += (ATTRIBUTE_HEADER_SIZE + padded) as u16;
        self.attributes.push(attr);
    }

    /// Write type, length, magic cookie and transaction ID into the first
    /// 20 bytes of `raw`.
    pub fn write_header(&mut self) {
        self.raw[0..2].copy_from_slice(&self.typ.value().to_be_bytes());
        self.raw[2..4].copy_from_slice(&self.length.to_be_bytes());
        self.raw[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        self.raw[8..HEADER_SIZE].copy_from_slice(self.transaction_id.as_bytes());
    }

    /// Drop all attributes, keeping the buffer capacity.
    pub fn reset(&mut self) {
        self.length = 0;
        self.attributes.clear();
        self.raw.truncate(HEADER_SIZE);
    }

    /// Parse `raw` into the message fields.
    ///
    /// Rejects a truncated header, a missing magic cookie, non-zero
    /// reserved type bits and any attribute that overruns the declared
    /// message length. Attribute order and duplicates are preserved.
    pub fn decode(&mut self) -> StunResult<()> {
        if self.raw.len() < HEADER_SIZE {
            return Err(unexpected_eof());
        }
        let typ = u16::from_be_bytes([self.raw[0], self.raw[1]]);
        let length = u16::from_be_bytes([self.raw[2], self.raw[3]]);
        let cookie = u32::from_be_bytes([self.raw[4], self.raw[5], self.raw[6], self.raw[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }
        self.typ = MessageType::from_value(typ)?;
        if self.raw.len() < HEADER_SIZE + length as usize {
            return Err(unexpected_eof());
        }

        let mut id = [0u8; TRANSACTION_ID_SIZE];
        id.copy_from_slice(&self.raw[8..HEADER_SIZE]);
        self.transaction_id = TransactionId::from_bytes(id);

        self.attributes.clear();
        let section = &self.raw[HEADER_SIZE..HEADER_SIZE + length as usize];
        let mut offset = 0;
        while offset < section.len() {
            if section.len() - offset < ATTRIBUTE_HEADER_SIZE {
                return Err(unexpected_eof());
            }
            let attr_type = u16::from_be_bytes([section[offset], section[offset + 1]]);
            let attr_length =
                u16::from_be_bytes([section[offset + 2], section[offset + 3]]) as usize;
            offset += ATTRIBUTE_HEADER_SIZE;

            if section.len() - offset < padded_len(attr_length) {
                return Err(StunError::AttributeSizeInvalid);
            }
            self.attributes.push(RawAttribute {
                typ: AttributeType::from_value(attr_type),
                length: attr_length as u16,
                value: section[offset..offset + attr_length].to_vec(),
            });
            offset += padded_len(attr_length);
        }
        self.length = length;
        Ok(())
    }

    /// Serialize the message to `writer`, returning the number of bytes
    /// written.
    pub async fn write_to<W>(&self, writer: &mut W) -> StunResult<usize>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.raw).await?;
        Ok(self.raw.len())
    }

    /// Read one message from `reader`: exactly 20 header bytes, then
    /// `length` attribute bytes. Works over stream transports since the
    /// header length field frames the body.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> StunResult<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let cookie = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;

        self.raw.clear();
        self.raw.extend_from_slice(&header);
        self.raw.resize(HEADER_SIZE + length, 0);
        reader.read_exact(&mut self.raw[HEADER_SIZE..]).await?;

        self.decode()?;
        Ok(HEADER_SIZE + length)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} l={} attrs={} id={}",
            self.typ,
            self.length,
            self.attributes.len(),
            self.transaction_id,
        )
    }
}

/// Attribute value length rounded up to the 4-byte boundary.
pub(crate) fn padded_len(length: usize) -> usize {
    (length + 3) & !3
}

fn unexpected_eof() -> StunError {
    StunError::Io(std::io::ErrorKind::UnexpectedEof.into())
}
