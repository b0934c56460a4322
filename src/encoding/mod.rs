//! BACnet Encoding and Decoding
//!
//! This module implements the BACnet tag-length-value format of ASHRAE 135
//! Clause 20: application and context tags, the thirteen application
//! primitives, context-tagged helpers, and constructed-value extraction.
//!
//! # Overview
//!
//! Every encoded value carries a tag identifying its class (application or
//! context) and number, followed by either a length field, an opening-tag
//! marker, or a closing-tag marker. Tag numbers 15 and above use an extended
//! encoding (4-bit sentinel plus one extra octet); lengths of 5 and above use
//! an extended length field (sentinel plus one, two, or four octets,
//! big-endian).
//!
//! # Application Tags
//!
//! | Tag | Type | Content |
//! |-----|------|---------|
//! | 0 | Null | none |
//! | 1 | Boolean | value carried in the length field |
//! | 2 | Unsigned | minimum-octet magnitude |
//! | 3 | Signed | minimum-octet two's complement |
//! | 4 | Real | IEEE-754 single, big-endian |
//! | 5 | Double | IEEE-754 double, big-endian |
//! | 6 | Octet String | raw octets |
//! | 7 | Character String | charset octet + text |
//! | 8 | Bit String | unused-bits octet + packed bits |
//! | 9 | Enumerated | minimum-octet magnitude |
//! | 10 | Date | year-1900, month, day, weekday (0xFF wildcard) |
//! | 11 | Time | hour, minute, second, hundredths (0xFF wildcard) |
//! | 12 | Object Identifier | packed 32-bit type/instance |
//!
//! # Example
//!
//! ```
//! use bacstack::encoding::{encode_application_unsigned, decode_application_unsigned};
//!
//! let mut buffer = Vec::new();
//! encode_application_unsigned(&mut buffer, 42);
//! let (value, consumed) = decode_application_unsigned(&buffer).unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(consumed, 2);
//! ```
//!
//! Decoders are hardened against crafted input: tag lengths above 1 MiB are
//! rejected outright and constructed-value extraction enforces a maximum
//! nesting depth. Inbound frames that fail to decode are dropped by the
//! receive path, never answered.

pub mod apdu;

use thiserror::Error;

use crate::object::{BitString, Date, ObjectIdentifier, PropertyValue, Time};

/// Result type for encoding operations.
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Upper bound on any decoded tag length. A length field above this is
/// treated as hostile input.
pub const MAX_TAG_LENGTH: u32 = 1 << 20;

/// Upper bound on opening/closing tag nesting in constructed values.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Errors that can occur during encoding/decoding operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// Tag octets are malformed or truncated.
    #[error("invalid tag")]
    InvalidTag,
    /// Buffer ended before the announced content.
    #[error("truncated data: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    /// Character string uses a charset this core does not support.
    #[error("unsupported character set {0}")]
    UnsupportedCharset(u8),
    /// Constructed value nests deeper than [`MAX_NESTING_DEPTH`].
    #[error("constructed value nests too deep")]
    NestingTooDeep,
    /// Length field exceeds [`MAX_TAG_LENGTH`].
    #[error("tag length {0} exceeds limit")]
    LengthExceedsLimit(u32),
    /// Content length is invalid for the announced type.
    #[error("invalid length {0} for type")]
    InvalidLength(usize),
    /// Value cannot be represented in the target encoding.
    #[error("value out of range")]
    ValueOutOfRange,
    /// Catch-all for structurally invalid input.
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
}

/// BACnet application tag numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            _ => Err(EncodingError::InvalidTag),
        }
    }
}

/// Tag class: application-wide or context-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Application,
    Context,
}

/// What follows a tag octet: plain content, or a constructed-value marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagContent {
    /// Primitive content of the given octet length.
    Length(u32),
    /// Opening marker of a constructed value.
    Opening,
    /// Closing marker of a constructed value.
    Closing,
}

/// A decoded BACnet tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub class: TagClass,
    pub content: TagContent,
}

impl Tag {
    pub fn application(number: ApplicationTag, length: u32) -> Self {
        Self {
            number: number as u8,
            class: TagClass::Application,
            content: TagContent::Length(length),
        }
    }

    pub fn context(number: u8, length: u32) -> Self {
        Self {
            number,
            class: TagClass::Context,
            content: TagContent::Length(length),
        }
    }

    pub fn is_opening(&self) -> bool {
        self.content == TagContent::Opening
    }

    pub fn is_closing(&self) -> bool {
        self.content == TagContent::Closing
    }

    /// Content length, zero for opening/closing markers.
    pub fn length(&self) -> usize {
        match self.content {
            TagContent::Length(len) => len as usize,
            _ => 0,
        }
    }

    /// True if this is an application tag of the given number.
    pub fn is_application(&self, tag: ApplicationTag) -> bool {
        self.class == TagClass::Application && self.number == tag as u8
    }

    /// True if this is a context tag of the given number.
    pub fn is_context(&self, number: u8) -> bool {
        self.class == TagClass::Context && self.number == number
    }
}

/// Encode a tag with the given number, class, and content descriptor.
pub fn encode_tag(buffer: &mut Vec<u8>, number: u8, class: TagClass, content: TagContent) {
    let mut initial = match class {
        TagClass::Application => 0u8,
        TagClass::Context => 0x08,
    };

    if number < 15 {
        initial |= number << 4;
    } else {
        initial |= 0xF0;
    }

    let lvt = match content {
        TagContent::Length(len) if len < 5 => len as u8,
        TagContent::Length(_) => 5,
        TagContent::Opening => 6,
        TagContent::Closing => 7,
    };
    buffer.push(initial | lvt);

    if number >= 15 {
        buffer.push(number);
    }

    if let TagContent::Length(len) = content {
        if len >= 5 {
            if len < 254 {
                buffer.push(len as u8);
            } else if len <= 0xFFFF {
                buffer.push(254);
                buffer.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                buffer.push(255);
                buffer.extend_from_slice(&len.to_be_bytes());
            }
        }
    }
}

/// Decode the tag at `offset`, returning the tag and the offset of its
/// content (or of the next tag, for opening/closing markers).
pub fn decode_tag(data: &[u8], offset: usize) -> Result<(Tag, usize)> {
    let initial = *data.get(offset).ok_or(EncodingError::InvalidTag)?;
    let mut pos = offset + 1;

    let class = if initial & 0x08 != 0 {
        TagClass::Context
    } else {
        TagClass::Application
    };

    let mut number = initial >> 4;
    if number == 0x0F {
        number = *data.get(pos).ok_or(EncodingError::InvalidTag)?;
        pos += 1;
    }

    let content = match initial & 0x07 {
        6 => TagContent::Opening,
        7 => TagContent::Closing,
        lvt if lvt < 5 => TagContent::Length(lvt as u32),
        _ => {
            // Extended length: one, two, or four octets.
            let first = *data.get(pos).ok_or(EncodingError::InvalidTag)?;
            pos += 1;
            let length = match first {
                254 => {
                    let bytes = data.get(pos..pos + 2).ok_or(EncodingError::InvalidTag)?;
                    pos += 2;
                    u16::from_be_bytes([bytes[0], bytes[1]]) as u32
                }
                255 => {
                    let bytes = data.get(pos..pos + 4).ok_or(EncodingError::InvalidTag)?;
                    pos += 4;
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                }
                len => len as u32,
            };
            if length > MAX_TAG_LENGTH {
                return Err(EncodingError::LengthExceedsLimit(length));
            }
            TagContent::Length(length)
        }
    };

    Ok((Tag { number, class, content }, pos))
}

fn content_slice(data: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    data.get(offset..offset + length).ok_or(EncodingError::Truncated {
        needed: length,
        available: data.len().saturating_sub(offset),
    })
}

// ---------------------------------------------------------------------------
// Unsigned / signed content encoding
// ---------------------------------------------------------------------------

/// Minimum-octet big-endian magnitude encoding of an unsigned value.
pub fn unsigned_content(value: u32) -> Vec<u8> {
    if value <= 0xFF {
        vec![value as u8]
    } else if value <= 0xFFFF {
        (value as u16).to_be_bytes().to_vec()
    } else if value <= 0xFF_FFFF {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// Minimum-octet big-endian two's-complement encoding of a signed value.
pub fn signed_content(value: i32) -> Vec<u8> {
    if (-128..=127).contains(&value) {
        vec![value as u8]
    } else if (-32768..=32767).contains(&value) {
        (value as i16).to_be_bytes().to_vec()
    } else if (-8_388_608..=8_388_607).contains(&value) {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

fn decode_unsigned_content(content: &[u8]) -> Result<u32> {
    match content.len() {
        1 => Ok(content[0] as u32),
        2 => Ok(u16::from_be_bytes([content[0], content[1]]) as u32),
        3 => Ok(u32::from_be_bytes([0, content[0], content[1], content[2]])),
        4 => Ok(u32::from_be_bytes([content[0], content[1], content[2], content[3]])),
        len => Err(EncodingError::InvalidLength(len)),
    }
}

fn decode_signed_content(content: &[u8]) -> Result<i32> {
    match content.len() {
        1 => Ok(content[0] as i8 as i32),
        2 => Ok(i16::from_be_bytes([content[0], content[1]]) as i32),
        3 => {
            let fill = if content[0] & 0x80 != 0 { 0xFF } else { 0 };
            Ok(i32::from_be_bytes([fill, content[0], content[1], content[2]]))
        }
        4 => Ok(i32::from_be_bytes([content[0], content[1], content[2], content[3]])),
        len => Err(EncodingError::InvalidLength(len)),
    }
}

// ---------------------------------------------------------------------------
// Application primitives
// ---------------------------------------------------------------------------

/// Encode an application Null.
pub fn encode_application_null(buffer: &mut Vec<u8>) {
    encode_tag(buffer, ApplicationTag::Null as u8, TagClass::Application, TagContent::Length(0));
}

/// Encode an application Boolean. The value rides in the length field; no
/// content octet follows.
pub fn encode_application_boolean(buffer: &mut Vec<u8>, value: bool) {
    encode_tag(
        buffer,
        ApplicationTag::Boolean as u8,
        TagClass::Application,
        TagContent::Length(u32::from(value)),
    );
}

/// Decode an application Boolean.
pub fn decode_application_boolean(data: &[u8]) -> Result<(bool, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::Boolean) {
        return Err(EncodingError::InvalidTag);
    }
    match tag.length() {
        0 => Ok((false, pos)),
        1 => Ok((true, pos)),
        len => Err(EncodingError::InvalidLength(len)),
    }
}

/// Encode an application Unsigned.
pub fn encode_application_unsigned(buffer: &mut Vec<u8>, value: u32) {
    let content = unsigned_content(value);
    encode_tag(
        buffer,
        ApplicationTag::UnsignedInt as u8,
        TagClass::Application,
        TagContent::Length(content.len() as u32),
    );
    buffer.extend_from_slice(&content);
}

/// Decode an application Unsigned.
pub fn decode_application_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::UnsignedInt) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_unsigned_content(content)?, pos + tag.length()))
}

/// Encode an application Signed.
pub fn encode_application_signed(buffer: &mut Vec<u8>, value: i32) {
    let content = signed_content(value);
    encode_tag(
        buffer,
        ApplicationTag::SignedInt as u8,
        TagClass::Application,
        TagContent::Length(content.len() as u32),
    );
    buffer.extend_from_slice(&content);
}

/// Decode an application Signed.
pub fn decode_application_signed(data: &[u8]) -> Result<(i32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::SignedInt) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_signed_content(content)?, pos + tag.length()))
}

/// Encode an application Real (IEEE-754 single, big-endian).
pub fn encode_application_real(buffer: &mut Vec<u8>, value: f32) {
    encode_tag(buffer, ApplicationTag::Real as u8, TagClass::Application, TagContent::Length(4));
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Decode an application Real.
pub fn decode_application_real(data: &[u8]) -> Result<(f32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::Real) || tag.length() != 4 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 4)?;
    let value = f32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((value, pos + 4))
}

/// Encode an application Double (IEEE-754 double, big-endian).
pub fn encode_application_double(buffer: &mut Vec<u8>, value: f64) {
    encode_tag(buffer, ApplicationTag::Double as u8, TagClass::Application, TagContent::Length(8));
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Decode an application Double.
pub fn decode_application_double(data: &[u8]) -> Result<(f64, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::Double) || tag.length() != 8 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(content);
    Ok((f64::from_be_bytes(bytes), pos + 8))
}

/// Encode an application Octet String.
pub fn encode_application_octet_string(buffer: &mut Vec<u8>, value: &[u8]) {
    encode_tag(
        buffer,
        ApplicationTag::OctetString as u8,
        TagClass::Application,
        TagContent::Length(value.len() as u32),
    );
    buffer.extend_from_slice(value);
}

/// Decode an application Octet String.
pub fn decode_application_octet_string(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::OctetString) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((content.to_vec(), pos + tag.length()))
}

/// Character set octet for UTF-8 (ANSI X3.4 in the standard's terms).
pub const CHARSET_UTF8: u8 = 0;
/// Character set octet for ISO 8859-1.
pub const CHARSET_LATIN1: u8 = 5;

/// Encode an application Character String as UTF-8.
pub fn encode_application_character_string(buffer: &mut Vec<u8>, value: &str) {
    encode_tag(
        buffer,
        ApplicationTag::CharacterString as u8,
        TagClass::Application,
        TagContent::Length(value.len() as u32 + 1),
    );
    buffer.push(CHARSET_UTF8);
    buffer.extend_from_slice(value.as_bytes());
}

/// Decode a character string content block (charset octet + text).
pub fn decode_character_string_content(content: &[u8]) -> Result<String> {
    if content.is_empty() {
        return Err(EncodingError::InvalidLength(0));
    }
    let (charset, text) = (content[0], &content[1..]);
    match charset {
        CHARSET_UTF8 => std::str::from_utf8(text)
            .map(str::to_owned)
            .map_err(|_| EncodingError::InvalidFormat("invalid UTF-8 in character string")),
        CHARSET_LATIN1 => Ok(encoding_rs::mem::decode_latin1(text).into_owned()),
        other => Err(EncodingError::UnsupportedCharset(other)),
    }
}

/// Decode an application Character String.
pub fn decode_application_character_string(data: &[u8]) -> Result<(String, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::CharacterString) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_character_string_content(content)?, pos + tag.length()))
}

/// Encode an application Bit String (unused-bits octet + packed bits).
pub fn encode_application_bit_string(buffer: &mut Vec<u8>, value: &BitString) {
    encode_tag(
        buffer,
        ApplicationTag::BitString as u8,
        TagClass::Application,
        TagContent::Length(value.data.len() as u32 + 1),
    );
    buffer.push(value.unused_bits);
    buffer.extend_from_slice(&value.data);
}

/// Decode an application Bit String.
pub fn decode_application_bit_string(data: &[u8]) -> Result<(BitString, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::BitString) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    if content.is_empty() {
        return Err(EncodingError::InvalidLength(0));
    }
    if content[0] > 7 {
        return Err(EncodingError::InvalidFormat("bit string unused bits > 7"));
    }
    let bits = BitString {
        unused_bits: content[0],
        data: content[1..].to_vec(),
    };
    Ok((bits, pos + tag.length()))
}

/// Encode an application Enumerated.
pub fn encode_application_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let content = unsigned_content(value);
    encode_tag(
        buffer,
        ApplicationTag::Enumerated as u8,
        TagClass::Application,
        TagContent::Length(content.len() as u32),
    );
    buffer.extend_from_slice(&content);
}

/// Decode an application Enumerated.
pub fn decode_application_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::Enumerated) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_unsigned_content(content)?, pos + tag.length()))
}

/// Encode an application Date. Year is stored as `actual - 1900`; 0xFF in
/// any field is the wildcard.
pub fn encode_application_date(buffer: &mut Vec<u8>, value: &Date) {
    encode_tag(buffer, ApplicationTag::Date as u8, TagClass::Application, TagContent::Length(4));
    buffer.extend_from_slice(&value.to_wire());
}

/// Decode an application Date.
pub fn decode_application_date(data: &[u8]) -> Result<(Date, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::Date) || tag.length() != 4 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 4)?;
    Ok((Date::from_wire([content[0], content[1], content[2], content[3]]), pos + 4))
}

/// Encode an application Time.
pub fn encode_application_time(buffer: &mut Vec<u8>, value: &Time) {
    encode_tag(buffer, ApplicationTag::Time as u8, TagClass::Application, TagContent::Length(4));
    buffer.extend_from_slice(&value.to_wire());
}

/// Decode an application Time.
pub fn decode_application_time(data: &[u8]) -> Result<(Time, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::Time) || tag.length() != 4 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 4)?;
    Ok((Time::from_wire([content[0], content[1], content[2], content[3]]), pos + 4))
}

/// Encode an application Object Identifier (packed 32-bit).
pub fn encode_application_object_id(buffer: &mut Vec<u8>, value: ObjectIdentifier) {
    encode_tag(
        buffer,
        ApplicationTag::ObjectIdentifier as u8,
        TagClass::Application,
        TagContent::Length(4),
    );
    buffer.extend_from_slice(&value.to_raw().to_be_bytes());
}

/// Decode an application Object Identifier.
pub fn decode_application_object_id(data: &[u8]) -> Result<(ObjectIdentifier, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_application(ApplicationTag::ObjectIdentifier) || tag.length() != 4 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 4)?;
    let raw = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((ObjectIdentifier::from_raw(raw), pos + 4))
}

// ---------------------------------------------------------------------------
// Context-tagged helpers
// ---------------------------------------------------------------------------

/// Encode an opening tag for a constructed context value.
pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) {
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Opening);
}

/// Encode a closing tag for a constructed context value.
pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) {
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Closing);
}

/// Encode a context-tagged Unsigned.
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) {
    let content = unsigned_content(value);
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Length(content.len() as u32));
    buffer.extend_from_slice(&content);
}

/// Decode a context-tagged Unsigned with the expected tag number.
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_unsigned_content(content)?, pos + tag.length()))
}

/// Encode a context-tagged Signed.
pub fn encode_context_signed(buffer: &mut Vec<u8>, tag_number: u8, value: i32) {
    let content = signed_content(value);
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Length(content.len() as u32));
    buffer.extend_from_slice(&content);
}

/// Decode a context-tagged Signed with the expected tag number.
pub fn decode_context_signed(data: &[u8], tag_number: u8) -> Result<(i32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_signed_content(content)?, pos + tag.length()))
}

/// Encode a context-tagged Enumerated.
pub fn encode_context_enumerated(buffer: &mut Vec<u8>, tag_number: u8, value: u32) {
    encode_context_unsigned(buffer, tag_number, value);
}

/// Decode a context-tagged Enumerated with the expected tag number.
pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, tag_number)
}

/// Encode a context-tagged Boolean. Unlike the application form, a context
/// boolean carries one content octet.
pub fn encode_context_boolean(buffer: &mut Vec<u8>, tag_number: u8, value: bool) {
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Length(1));
    buffer.push(u8::from(value));
}

/// Decode a context-tagged Boolean with the expected tag number.
pub fn decode_context_boolean(data: &[u8], tag_number: u8) -> Result<(bool, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) || tag.length() != 1 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 1)?;
    Ok((content[0] != 0, pos + 1))
}

/// Encode a context-tagged Real.
pub fn encode_context_real(buffer: &mut Vec<u8>, tag_number: u8, value: f32) {
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Length(4));
    buffer.extend_from_slice(&value.to_be_bytes());
}

/// Decode a context-tagged Real with the expected tag number.
pub fn decode_context_real(data: &[u8], tag_number: u8) -> Result<(f32, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) || tag.length() != 4 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 4)?;
    Ok((f32::from_be_bytes([content[0], content[1], content[2], content[3]]), pos + 4))
}

/// Encode a context-tagged Object Identifier.
pub fn encode_context_object_id(buffer: &mut Vec<u8>, tag_number: u8, value: ObjectIdentifier) {
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Length(4));
    buffer.extend_from_slice(&value.to_raw().to_be_bytes());
}

/// Decode a context-tagged Object Identifier with the expected tag number.
pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<(ObjectIdentifier, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) || tag.length() != 4 {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, 4)?;
    let raw = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((ObjectIdentifier::from_raw(raw), pos + 4))
}

/// Encode a context-tagged Octet String.
pub fn encode_context_octet_string(buffer: &mut Vec<u8>, tag_number: u8, value: &[u8]) {
    encode_tag(buffer, tag_number, TagClass::Context, TagContent::Length(value.len() as u32));
    buffer.extend_from_slice(value);
}

/// Decode a context-tagged Octet String with the expected tag number.
pub fn decode_context_octet_string(data: &[u8], tag_number: u8) -> Result<(Vec<u8>, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((content.to_vec(), pos + tag.length()))
}

/// Encode a context-tagged Character String (UTF-8).
pub fn encode_context_character_string(buffer: &mut Vec<u8>, tag_number: u8, value: &str) {
    encode_tag(
        buffer,
        tag_number,
        TagClass::Context,
        TagContent::Length(value.len() as u32 + 1),
    );
    buffer.push(CHARSET_UTF8);
    buffer.extend_from_slice(value.as_bytes());
}

/// Decode a context-tagged Character String with the expected tag number.
pub fn decode_context_character_string(data: &[u8], tag_number: u8) -> Result<(String, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if !tag.is_context(tag_number) {
        return Err(EncodingError::InvalidTag);
    }
    let content = content_slice(data, pos, tag.length())?;
    Ok((decode_character_string_content(content)?, pos + tag.length()))
}

/// Given an opening tag with `tag_number` at `offset`, return the content
/// bytes up to the matching closing tag and the offset just past it.
///
/// Nested opening/closing pairs of any tag number are tolerated up to
/// [`MAX_NESTING_DEPTH`].
pub fn extract_context_value(
    data: &[u8],
    offset: usize,
    tag_number: u8,
) -> Result<(&[u8], usize)> {
    let (open, content_start) = decode_tag(data, offset)?;
    if !open.is_context(tag_number) || !open.is_opening() {
        return Err(EncodingError::InvalidTag);
    }

    let mut depth = 1usize;
    let mut pos = content_start;
    loop {
        let (tag, next) = decode_tag(data, pos)?;
        match tag.content {
            TagContent::Opening => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(EncodingError::NestingTooDeep);
                }
                pos = next;
            }
            TagContent::Closing => {
                depth -= 1;
                if depth == 0 {
                    if tag.number != tag_number {
                        return Err(EncodingError::InvalidTag);
                    }
                    return Ok((&data[content_start..pos], next));
                }
                pos = next;
            }
            TagContent::Length(len) => {
                let end = next + len as usize;
                if end > data.len() {
                    return Err(EncodingError::Truncated {
                        needed: len as usize,
                        available: data.len().saturating_sub(next),
                    });
                }
                pos = end;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property values
// ---------------------------------------------------------------------------

/// Encode a property value using its natural application tag. Relinquished
/// (`Null`) priority-array slots come through here as application Null.
pub fn encode_property_value(buffer: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Null => encode_application_null(buffer),
        PropertyValue::Boolean(v) => encode_application_boolean(buffer, *v),
        PropertyValue::Unsigned(v) => encode_application_unsigned(buffer, *v),
        PropertyValue::Signed(v) => encode_application_signed(buffer, *v),
        PropertyValue::Real(v) => encode_application_real(buffer, *v),
        PropertyValue::Double(v) => encode_application_double(buffer, *v),
        PropertyValue::OctetString(v) => encode_application_octet_string(buffer, v),
        PropertyValue::CharacterString(v) => encode_application_character_string(buffer, v),
        PropertyValue::BitString(v) => encode_application_bit_string(buffer, v),
        PropertyValue::Enumerated(v) => encode_application_enumerated(buffer, *v),
        PropertyValue::Date(v) => encode_application_date(buffer, v),
        PropertyValue::Time(v) => encode_application_time(buffer, v),
        PropertyValue::ObjectId(v) => encode_application_object_id(buffer, *v),
        PropertyValue::Array(items) | PropertyValue::List(items) => {
            for item in items {
                encode_property_value(buffer, item);
            }
        }
    }
}

/// Decode a single application-tagged property value.
pub fn decode_property_value(data: &[u8]) -> Result<(PropertyValue, usize)> {
    let (tag, pos) = decode_tag(data, 0)?;
    if tag.class != TagClass::Application {
        return Err(EncodingError::InvalidTag);
    }
    let app = ApplicationTag::try_from(tag.number)?;
    match app {
        ApplicationTag::Null => Ok((PropertyValue::Null, pos)),
        ApplicationTag::Boolean => {
            decode_application_boolean(data).map(|(v, n)| (PropertyValue::Boolean(v), n))
        }
        ApplicationTag::UnsignedInt => {
            decode_application_unsigned(data).map(|(v, n)| (PropertyValue::Unsigned(v), n))
        }
        ApplicationTag::SignedInt => {
            decode_application_signed(data).map(|(v, n)| (PropertyValue::Signed(v), n))
        }
        ApplicationTag::Real => {
            decode_application_real(data).map(|(v, n)| (PropertyValue::Real(v), n))
        }
        ApplicationTag::Double => {
            decode_application_double(data).map(|(v, n)| (PropertyValue::Double(v), n))
        }
        ApplicationTag::OctetString => {
            decode_application_octet_string(data).map(|(v, n)| (PropertyValue::OctetString(v), n))
        }
        ApplicationTag::CharacterString => decode_application_character_string(data)
            .map(|(v, n)| (PropertyValue::CharacterString(v), n)),
        ApplicationTag::BitString => {
            decode_application_bit_string(data).map(|(v, n)| (PropertyValue::BitString(v), n))
        }
        ApplicationTag::Enumerated => {
            decode_application_enumerated(data).map(|(v, n)| (PropertyValue::Enumerated(v), n))
        }
        ApplicationTag::Date => {
            decode_application_date(data).map(|(v, n)| (PropertyValue::Date(v), n))
        }
        ApplicationTag::Time => {
            decode_application_time(data).map(|(v, n)| (PropertyValue::Time(v), n))
        }
        ApplicationTag::ObjectIdentifier => {
            decode_application_object_id(data).map(|(v, n)| (PropertyValue::ObjectId(v), n))
        }
    }
}

/// Decode a run of application-tagged values to the end of `data`. A single
/// value decodes to itself; several decode to a [`PropertyValue::Array`].
pub fn decode_property_values(data: &[u8]) -> Result<PropertyValue> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (value, consumed) = decode_property_value(&data[pos..])?;
        values.push(value);
        pos += consumed;
    }
    match values.len() {
        0 => Ok(PropertyValue::Null),
        1 => Ok(values.pop().expect("len checked")),
        _ => Ok(PropertyValue::Array(values)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use proptest::prelude::*;

    #[test]
    fn context_tag_round_trip() {
        // Context tag 5, length 3, three content bytes.
        let mut buffer = Vec::new();
        encode_tag(&mut buffer, 5, TagClass::Context, TagContent::Length(3));
        buffer.extend_from_slice(&[0x01, 0x02, 0x03]);

        let (tag, pos) = decode_tag(&buffer, 0).unwrap();
        assert_eq!(tag.number, 5);
        assert_eq!(tag.class, TagClass::Context);
        assert_eq!(tag.content, TagContent::Length(3));
        assert_eq!(pos, 1);
    }

    #[test]
    fn extended_tag_number_and_length() {
        // Tag 20, context, length 300 encodes as FD 14 FE 01 2C.
        let mut buffer = Vec::new();
        encode_tag(&mut buffer, 20, TagClass::Context, TagContent::Length(300));
        assert_eq!(buffer, vec![0xFD, 20, 0xFE, 0x01, 0x2C]);

        buffer.extend_from_slice(&vec![0xAA; 300]);
        let (tag, pos) = decode_tag(&buffer, 0).unwrap();
        assert_eq!(tag.number, 20);
        assert_eq!(tag.content, TagContent::Length(300));
        assert_eq!(pos, 5);
    }

    #[test]
    fn four_byte_extended_length() {
        let mut buffer = Vec::new();
        encode_tag(&mut buffer, 6, TagClass::Application, TagContent::Length(0x12345));
        let (tag, _) = decode_tag(&buffer, 0).unwrap();
        assert_eq!(tag.content, TagContent::Length(0x12345));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buffer = Vec::new();
        encode_tag(&mut buffer, 6, TagClass::Application, TagContent::Length(MAX_TAG_LENGTH + 1));
        assert!(matches!(
            decode_tag(&buffer, 0),
            Err(EncodingError::LengthExceedsLimit(_))
        ));
    }

    #[test]
    fn truncated_tag_rejected() {
        assert_eq!(decode_tag(&[], 0), Err(EncodingError::InvalidTag));
        // Extended length sentinel with no follow-up octet.
        assert_eq!(decode_tag(&[0x65], 0), Err(EncodingError::InvalidTag));
    }

    #[test]
    fn boolean_value_in_length_field() {
        let mut buffer = Vec::new();
        encode_application_boolean(&mut buffer, true);
        assert_eq!(buffer, vec![0x11]);
        let (value, consumed) = decode_application_boolean(&buffer).unwrap();
        assert!(value);
        assert_eq!(consumed, 1);

        buffer.clear();
        encode_application_boolean(&mut buffer, false);
        assert_eq!(buffer, vec![0x10]);
    }

    #[test]
    fn unsigned_minimal_octets() {
        for (value, expected_len) in [(0u32, 1), (255, 1), (256, 2), (65536, 3), (0x1000000, 4)] {
            let mut buffer = Vec::new();
            encode_application_unsigned(&mut buffer, value);
            assert_eq!(buffer.len(), 1 + expected_len, "value {value}");
            let (decoded, _) = decode_application_unsigned(&buffer).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn signed_two_complement() {
        for value in [0i32, -1, 127, -128, 128, -32768, 8_388_607, -8_388_608, i32::MAX, i32::MIN] {
            let mut buffer = Vec::new();
            encode_application_signed(&mut buffer, value);
            let (decoded, _) = decode_application_signed(&buffer).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn character_string_latin1() {
        // Charset 5 content decodes as ISO-8859-1.
        let mut buffer = Vec::new();
        encode_tag(&mut buffer, 7, TagClass::Application, TagContent::Length(4));
        buffer.push(CHARSET_LATIN1);
        buffer.extend_from_slice(&[0x47, 0xE5, 0x72]); // "Går"
        let (text, _) = decode_application_character_string(&buffer).unwrap();
        assert_eq!(text, "Går");
    }

    #[test]
    fn character_string_unsupported_charset() {
        let mut buffer = Vec::new();
        encode_tag(&mut buffer, 7, TagClass::Application, TagContent::Length(3));
        buffer.push(2); // JIS X 0208
        buffer.extend_from_slice(&[0x41, 0x42]);
        assert_eq!(
            decode_application_character_string(&buffer),
            Err(EncodingError::UnsupportedCharset(2))
        );
    }

    #[test]
    fn object_id_round_trip() {
        let id = ObjectIdentifier::new(ObjectType::AnalogValue, 1234);
        let mut buffer = Vec::new();
        encode_application_object_id(&mut buffer, id);
        let (decoded, consumed) = decode_application_object_id(&buffer).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn extract_context_value_flat() {
        let mut buffer = Vec::new();
        encode_opening_tag(&mut buffer, 3);
        encode_application_unsigned(&mut buffer, 77);
        encode_closing_tag(&mut buffer, 3);

        let (inner, next) = extract_context_value(&buffer, 0, 3).unwrap();
        assert_eq!(next, buffer.len());
        let (value, _) = decode_application_unsigned(inner).unwrap();
        assert_eq!(value, 77);
    }

    #[test]
    fn extract_context_value_nested() {
        let mut buffer = Vec::new();
        encode_opening_tag(&mut buffer, 3);
        encode_opening_tag(&mut buffer, 0);
        encode_application_real(&mut buffer, 1.5);
        encode_closing_tag(&mut buffer, 0);
        encode_closing_tag(&mut buffer, 3);
        buffer.extend_from_slice(&[0xDE, 0xAD]); // trailing bytes stay untouched

        let (inner, next) = extract_context_value(&buffer, 0, 3).unwrap();
        assert_eq!(next, buffer.len() - 2);
        assert_eq!(inner.len(), buffer.len() - 4);
    }

    #[test]
    fn extract_context_value_depth_limit() {
        let mut buffer = Vec::new();
        for _ in 0..MAX_NESTING_DEPTH + 1 {
            encode_opening_tag(&mut buffer, 1);
        }
        for _ in 0..MAX_NESTING_DEPTH + 1 {
            encode_closing_tag(&mut buffer, 1);
        }
        assert_eq!(
            extract_context_value(&buffer, 0, 1),
            Err(EncodingError::NestingTooDeep)
        );
    }

    #[test]
    fn extract_context_value_unterminated() {
        let mut buffer = Vec::new();
        encode_opening_tag(&mut buffer, 2);
        encode_application_unsigned(&mut buffer, 9);
        assert!(extract_context_value(&buffer, 0, 2).is_err());
    }

    #[test]
    fn property_value_round_trip() {
        let values = [
            PropertyValue::Null,
            PropertyValue::Boolean(true),
            PropertyValue::Unsigned(1000),
            PropertyValue::Signed(-42),
            PropertyValue::Real(72.5),
            PropertyValue::Double(1.0e100),
            PropertyValue::OctetString(vec![1, 2, 3]),
            PropertyValue::CharacterString("zone-1".into()),
            PropertyValue::Enumerated(4),
            PropertyValue::ObjectId(ObjectIdentifier::new(ObjectType::Device, 99)),
        ];
        for value in values {
            let mut buffer = Vec::new();
            encode_property_value(&mut buffer, &value);
            let (decoded, consumed) = decode_property_value(&buffer).unwrap();
            assert_eq!(consumed, buffer.len());
            assert_eq!(decoded, value);
        }
    }

    proptest! {
        #[test]
        fn prop_unsigned_round_trip(value: u32) {
            let mut buffer = Vec::new();
            encode_application_unsigned(&mut buffer, value);
            let (decoded, consumed) = decode_application_unsigned(&buffer).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buffer.len());
        }

        #[test]
        fn prop_signed_round_trip(value: i32) {
            let mut buffer = Vec::new();
            encode_application_signed(&mut buffer, value);
            let (decoded, _) = decode_application_signed(&buffer).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_tag_round_trip(number in 0u8..=254, len in 0u32..=100_000) {
            let mut buffer = Vec::new();
            encode_tag(&mut buffer, number, TagClass::Context, TagContent::Length(len));
            let (tag, _) = decode_tag(&buffer, 0).unwrap();
            prop_assert_eq!(tag.number, number);
            prop_assert_eq!(tag.content, TagContent::Length(len));
        }

        #[test]
        fn prop_octet_string_round_trip(bytes: Vec<u8>) {
            let mut buffer = Vec::new();
            encode_application_octet_string(&mut buffer, &bytes);
            let (decoded, consumed) = decode_application_octet_string(&buffer).unwrap();
            prop_assert_eq!(decoded, bytes);
            prop_assert_eq!(consumed, buffer.len());
        }

        #[test]
        fn prop_decode_tag_never_panics(bytes: Vec<u8>) {
            let _ = decode_tag(&bytes, 0);
        }
    }
}
