// src/attributes.rs
//! STUN attributes: the raw TLV list and the typed codecs used by the
//! client core (SOFTWARE, XOR-MAPPED-ADDRESS, ERROR-CODE).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{StunError, StunResult};
use crate::message::{Message, MAGIC_COOKIE};

/// Size of the attribute type and length prefix.
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// Maximum SOFTWARE value length in bytes (RFC 5389 Section 15.10).
pub const MAX_SOFTWARE_LEN: usize = 763;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Attribute type registry entries the client core interprets. Unknown
/// types are carried verbatim as [`AttributeType::Raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// ERROR-CODE, 0x0009.
    ErrorCode,
    /// XOR-MAPPED-ADDRESS, 0x0020.
    XorMappedAddress,
    /// SOFTWARE, 0x8022.
    Software,
    /// Attribute type this crate does not interpret.
    Raw(u16),
}

impl AttributeType {
    /// Get the numeric value of the attribute type.
    pub fn value(self) -> u16 {
        match self {
            Self::ErrorCode => 0x0009,
            Self::XorMappedAddress => 0x0020,
            Self::Software => 0x8022,
            Self::Raw(value) => value,
        }
    }

    /// Create from a numeric value.
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0009 => Self::ErrorCode,
            0x0020 => Self::XorMappedAddress,
            0x8022 => Self::Software,
            _ => Self::Raw(value),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ErrorCode => write!(f, "ERROR-CODE"),
            Self::XorMappedAddress => write!(f, "XOR-MAPPED-ADDRESS"),
            Self::Software => write!(f, "SOFTWARE"),
            Self::Raw(value) => write!(f, "0x{:04x}", value),
        }
    }
}

/// One attribute as it appears on the wire. `length` is the declared
/// value length, without padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub typ: AttributeType,
    pub length: u16,
    pub value: Vec<u8>,
}

/// Ordered attribute list. Duplicates are preserved; lookups return the
/// first match, mirroring on-the-wire semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<RawAttribute>);

impl Attributes {
    /// First attribute of the given type, if present.
    pub fn get(&self, typ: AttributeType) -> Option<&RawAttribute> {
        self.0.iter().find(|attr| attr.typ == typ)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawAttribute> {
        self.0.iter()
    }

    pub(crate) fn push(&mut self, attr: RawAttribute) {
        self.0.push(attr);
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

impl Message {
    /// Append a SOFTWARE attribute. Fails when the value exceeds the
    /// 763-byte cap.
    pub fn add_software(&mut self, software: &str) -> StunResult<()> {
        if software.len() > MAX_SOFTWARE_LEN {
            return Err(StunError::AttributeSizeInvalid);
        }
        self.add_raw(AttributeType::Software, software.as_bytes());
        Ok(())
    }

    /// SOFTWARE value, or an empty string when the attribute is absent.
    pub fn get_software(&self) -> String {
        self.attributes
            .get(AttributeType::Software)
            .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
            .unwrap_or_default()
    }

    /// Append an XOR-MAPPED-ADDRESS attribute for `addr`, obfuscated with
    /// the magic cookie and this message's transaction ID.
    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
        let mut value = Vec::with_capacity(ATTRIBUTE_HEADER_SIZE + 16);
        value.push(0);
        match addr.ip() {
            IpAddr::V4(ip) => {
                value.push(FAMILY_IPV4);
                value.extend_from_slice(&xor_port.to_be_bytes());
                let mut octets = ip.octets();
                xor_in_place(&mut octets, &MAGIC_COOKIE.to_be_bytes());
                value.extend_from_slice(&octets);
            }
            IpAddr::V6(ip) => {
                value.push(FAMILY_IPV6);
                value.extend_from_slice(&xor_port.to_be_bytes());
                let mut octets = ip.octets();
                xor_in_place(&mut octets[..4], &MAGIC_COOKIE.to_be_bytes());
                xor_in_place(&mut octets[4..], self.transaction_id.as_bytes());
                value.extend_from_slice(&octets);
            }
        }
        self.add_raw(AttributeType::XorMappedAddress, &value);
    }

    /// Decode the XOR-MAPPED-ADDRESS attribute.
    ///
    /// Fails with [`StunError::AttributeNotFound`] when absent,
    /// [`StunError::AttributeSizeInvalid`] when the payload is shorter
    /// than its fixed prefix, and [`StunError::BadIpLength`] when the
    /// address bytes match neither family layout.
    pub fn get_xor_mapped_address(&self) -> StunResult<SocketAddr> {
        let attr = self
            .attributes
            .get(AttributeType::XorMappedAddress)
            .ok_or(StunError::AttributeNotFound)?;
        let value = &attr.value;
        if value.len() < ATTRIBUTE_HEADER_SIZE {
            return Err(StunError::AttributeSizeInvalid);
        }
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        match value[1] {
            FAMILY_IPV4 => {
                if value.len() != ATTRIBUTE_HEADER_SIZE + 4 {
                    return Err(StunError::BadIpLength);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&value[4..8]);
                xor_in_place(&mut octets, &MAGIC_COOKIE.to_be_bytes());
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            FAMILY_IPV6 => {
                if value.len() != ATTRIBUTE_HEADER_SIZE + 16 {
                    return Err(StunError::BadIpLength);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&value[4..20]);
                xor_in_place(&mut octets[..4], &MAGIC_COOKIE.to_be_bytes());
                xor_in_place(&mut octets[4..], self.transaction_id.as_bytes());
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => Err(StunError::BadIpLength),
        }
    }

    /// Append an ERROR-CODE attribute. The numeric code is split into a
    /// class (hundreds) and a number (0..99) on the wire.
    pub fn add_error_code(&mut self, code: u16, reason: &str) {
        let mut value = Vec::with_capacity(4 + reason.len());
        value.extend_from_slice(&[0, 0]);
        value.push((code / 100) as u8);
        value.push((code % 100) as u8);
        value.extend_from_slice(reason.as_bytes());
        self.add_raw(AttributeType::ErrorCode, &value);
    }

    /// Append an ERROR-CODE attribute with the standard reason phrase for
    /// `code`. Unknown codes get an empty reason.
    pub fn add_error_code_default(&mut self, code: u16) {
        self.add_error_code(code, default_error_reason(code));
    }

    /// Decode the ERROR-CODE attribute into its numeric code and reason
    /// phrase.
    pub fn get_error_code(&self) -> StunResult<(u16, String)> {
        let attr = self
            .attributes
            .get(AttributeType::ErrorCode)
            .ok_or(StunError::AttributeNotFound)?;
        let value = &attr.value;
        if value.len() < 4 {
            return Err(StunError::AttributeSizeInvalid);
        }
        let class = (value[2] & 0x07) as u16;
        let number = value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Ok((class * 100 + number, reason))
    }
}

/// Standard reason phrases from RFC 5389 and RFC 5766.
fn default_error_reason(code: u16) -> &'static str {
    match code {
        300 => "Try Alternate",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        420 => "Unknown Attribute",
        438 => "Stale Nonce",
        500 => "Server Error",
        508 => "Insufficient Capacity",
        _ => "",
    }
}

fn xor_in_place(bytes: &mut [u8], key: &[u8]) {
    for (byte, k) in bytes.iter_mut().zip(key) {
        *byte ^= k;
    }
}
