//! BVLC-SC message codec (Annex AB.2).
//!
//! Wire format (minimum 4 octets):
//!
//! ```text
//! Function(1) | Control(1) | MessageID(2) | [OrigVMAC(6)] | [DestVMAC(6)]
//! | [DestOptions(var)] | [DataOptions(var)] | Payload(var)
//! ```
//!
//! Header options chain through a More-Options flag in each option marker.
//! All multi-octet values are big-endian.

use bitflags::bitflags;

use super::{DeviceUuid, ScVmac, SC_VMAC_LEN};
use crate::datalink::{DataLinkError, Result};

/// Minimum BVLC-SC message length (function, control, message id).
pub const SC_HEADER_MIN_LENGTH: usize = 4;

/// Error code carried in a Connect NAK when the proposed VMAC is in use.
pub const ERROR_NODE_DUPLICATE_VMAC: u16 = 0x0071;

/// BVLC-SC function codes (AB.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScFunction {
    Result = 0x00,
    EncapsulatedNpdu = 0x01,
    AddressResolution = 0x02,
    AddressResolutionAck = 0x03,
    Advertisement = 0x04,
    AdvertisementSolicitation = 0x05,
    ConnectRequest = 0x06,
    ConnectAccept = 0x07,
    DisconnectRequest = 0x08,
    DisconnectAck = 0x09,
    HeartbeatRequest = 0x0A,
    HeartbeatAck = 0x0B,
    ProprietaryMessage = 0x0C,
}

impl TryFrom<u8> for ScFunction {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ScFunction::Result),
            0x01 => Ok(ScFunction::EncapsulatedNpdu),
            0x02 => Ok(ScFunction::AddressResolution),
            0x03 => Ok(ScFunction::AddressResolutionAck),
            0x04 => Ok(ScFunction::Advertisement),
            0x05 => Ok(ScFunction::AdvertisementSolicitation),
            0x06 => Ok(ScFunction::ConnectRequest),
            0x07 => Ok(ScFunction::ConnectAccept),
            0x08 => Ok(ScFunction::DisconnectRequest),
            0x09 => Ok(ScFunction::DisconnectAck),
            0x0A => Ok(ScFunction::HeartbeatRequest),
            0x0B => Ok(ScFunction::HeartbeatAck),
            0x0C => Ok(ScFunction::ProprietaryMessage),
            _ => Err(DataLinkError::InvalidFrame),
        }
    }
}

bitflags! {
    /// Control octet flags (AB.2.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScControlFlags: u8 {
        const ORIGINATING_VMAC = 0x08;
        const DESTINATION_VMAC = 0x04;
        const DESTINATION_OPTIONS = 0x02;
        const DATA_OPTIONS = 0x01;
    }
}

// Header option marker bits (AB.2.3).
const MARKER_MORE_OPTIONS: u8 = 0x80;
const MARKER_MUST_UNDERSTAND: u8 = 0x40;
const MARKER_HAS_DATA: u8 = 0x20;
const MARKER_TYPE_MASK: u8 = 0x1F;

/// Header option type for Secure-Path (AB.2.3.1).
pub const OPTION_SECURE_PATH: u8 = 1;

/// One BVLC-SC header option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScHeaderOption {
    pub option_type: u8,
    pub must_understand: bool,
    pub data: Vec<u8>,
}

impl ScHeaderOption {
    pub fn new(option_type: u8, must_understand: bool, data: Vec<u8>) -> Self {
        Self {
            option_type: option_type & MARKER_TYPE_MASK,
            must_understand,
            data,
        }
    }

    fn encode(&self, buffer: &mut Vec<u8>, more: bool) {
        let mut marker = self.option_type & MARKER_TYPE_MASK;
        if more {
            marker |= MARKER_MORE_OPTIONS;
        }
        if self.must_understand {
            marker |= MARKER_MUST_UNDERSTAND;
        }
        if !self.data.is_empty() {
            marker |= MARKER_HAS_DATA;
        }
        buffer.push(marker);
        if !self.data.is_empty() {
            buffer.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            buffer.extend_from_slice(&self.data);
        }
    }

    /// Decode a chained option list, returning the options and octets
    /// consumed.
    pub fn decode_list(data: &[u8]) -> Result<(Vec<ScHeaderOption>, usize)> {
        let mut options = Vec::new();
        let mut offset = 0;
        loop {
            let marker = *data.get(offset).ok_or(DataLinkError::InvalidFrame)?;
            offset += 1;

            let mut option_data = Vec::new();
            if marker & MARKER_HAS_DATA != 0 {
                let len_bytes = data
                    .get(offset..offset + 2)
                    .ok_or(DataLinkError::InvalidFrame)?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                offset += 2;
                option_data = data
                    .get(offset..offset + len)
                    .ok_or(DataLinkError::InvalidFrame)?
                    .to_vec();
                offset += len;
            }

            options.push(ScHeaderOption {
                option_type: marker & MARKER_TYPE_MASK,
                must_understand: marker & MARKER_MUST_UNDERSTAND != 0,
                data: option_data,
            });

            if marker & MARKER_MORE_OPTIONS == 0 {
                return Ok((options, offset));
            }
        }
    }
}

fn encode_options(buffer: &mut Vec<u8>, options: &[ScHeaderOption]) {
    for (index, option) in options.iter().enumerate() {
        option.encode(buffer, index + 1 < options.len());
    }
}

/// A BVLC-SC message: the generic envelope for all thirteen functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScMessage {
    pub function: ScFunction,
    pub message_id: u16,
    pub originating: Option<ScVmac>,
    pub destination: Option<ScVmac>,
    pub dest_options: Vec<ScHeaderOption>,
    pub data_options: Vec<ScHeaderOption>,
    pub payload: Vec<u8>,
}

impl ScMessage {
    /// A message with no VMACs, options, or payload.
    pub fn plain(function: ScFunction, message_id: u16) -> Self {
        Self {
            function,
            message_id,
            originating: None,
            destination: None,
            dest_options: Vec::new(),
            data_options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// A message carrying only a payload.
    pub fn with_payload(function: ScFunction, message_id: u16, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::plain(function, message_id)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = ScControlFlags::empty();
        if self.originating.is_some() {
            flags |= ScControlFlags::ORIGINATING_VMAC;
        }
        if self.destination.is_some() {
            flags |= ScControlFlags::DESTINATION_VMAC;
        }
        if !self.dest_options.is_empty() {
            flags |= ScControlFlags::DESTINATION_OPTIONS;
        }
        if !self.data_options.is_empty() {
            flags |= ScControlFlags::DATA_OPTIONS;
        }

        let mut buffer = Vec::with_capacity(SC_HEADER_MIN_LENGTH + self.payload.len() + 12);
        buffer.push(self.function as u8);
        buffer.push(flags.bits());
        buffer.extend_from_slice(&self.message_id.to_be_bytes());
        if let Some(originating) = &self.originating {
            buffer.extend_from_slice(originating.as_bytes());
        }
        if let Some(destination) = &self.destination {
            buffer.extend_from_slice(destination.as_bytes());
        }
        encode_options(&mut buffer, &self.dest_options);
        encode_options(&mut buffer, &self.data_options);
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SC_HEADER_MIN_LENGTH {
            return Err(DataLinkError::InvalidFrame);
        }
        let function = ScFunction::try_from(data[0])?;
        let flags = ScControlFlags::from_bits_truncate(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);
        let mut offset = SC_HEADER_MIN_LENGTH;

        let mut read_vmac = |offset: &mut usize| -> Result<ScVmac> {
            let bytes = data
                .get(*offset..*offset + SC_VMAC_LEN)
                .ok_or(DataLinkError::InvalidFrame)?;
            *offset += SC_VMAC_LEN;
            ScVmac::try_from(bytes)
        };

        let originating = if flags.contains(ScControlFlags::ORIGINATING_VMAC) {
            Some(read_vmac(&mut offset)?)
        } else {
            None
        };
        let destination = if flags.contains(ScControlFlags::DESTINATION_VMAC) {
            Some(read_vmac(&mut offset)?)
        } else {
            None
        };

        let dest_options = if flags.contains(ScControlFlags::DESTINATION_OPTIONS) {
            let (options, consumed) = ScHeaderOption::decode_list(&data[offset..])?;
            offset += consumed;
            options
        } else {
            Vec::new()
        };
        let data_options = if flags.contains(ScControlFlags::DATA_OPTIONS) {
            let (options, consumed) = ScHeaderOption::decode_list(&data[offset..])?;
            offset += consumed;
            options
        } else {
            Vec::new()
        };

        Ok(Self {
            function,
            message_id,
            originating,
            destination,
            dest_options,
            data_options,
            payload: data[offset..].to_vec(),
        })
    }
}

/// Result codes carried by BVLC-Result (AB.2.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScResultCode {
    Ack = 0,
    Nak = 1,
}

/// Payload of a Connect-Request or Connect-Accept (AB.2.10, AB.2.11):
/// VMAC(6) + UUID(16) + MaxBvlc(2) + MaxNpdu(2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPayload {
    pub vmac: ScVmac,
    pub uuid: DeviceUuid,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
}

impl ConnectPayload {
    pub const LENGTH: usize = SC_VMAC_LEN + 16 + 2 + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH);
        out.extend_from_slice(self.vmac.as_bytes());
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&self.max_bvlc_length.to_be_bytes());
        out.extend_from_slice(&self.max_npdu_length.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH {
            return Err(DataLinkError::InvalidFrame);
        }
        let vmac = ScVmac::try_from(&data[..6])?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[6..22]);
        Ok(Self {
            vmac,
            uuid: DeviceUuid(uuid),
            max_bvlc_length: u16::from_be_bytes([data[22], data[23]]),
            max_npdu_length: u16::from_be_bytes([data[24], data[25]]),
        })
    }
}

/// Payload of a BVLC-Result (AB.2.4). NAKs carry an error header marker,
/// error class/code, and optional UTF-8 details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScResultPayload {
    pub for_function: ScFunction,
    pub result: ScResultCode,
    pub error_header_marker: u8,
    pub error_class: u16,
    pub error_code: u16,
    pub error_details: String,
}

impl ScResultPayload {
    pub fn ack(for_function: ScFunction) -> Self {
        Self {
            for_function,
            result: ScResultCode::Ack,
            error_header_marker: 0,
            error_class: 0,
            error_code: 0,
            error_details: String::new(),
        }
    }

    pub fn nak(for_function: ScFunction, error_class: u16, error_code: u16, details: &str) -> Self {
        Self {
            for_function,
            result: ScResultCode::Nak,
            error_header_marker: 0,
            error_class,
            error_code,
            error_details: details.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.for_function as u8, self.result as u8];
        if self.result == ScResultCode::Nak {
            out.push(self.error_header_marker);
            out.extend_from_slice(&self.error_class.to_be_bytes());
            out.extend_from_slice(&self.error_code.to_be_bytes());
            out.extend_from_slice(self.error_details.as_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(DataLinkError::InvalidFrame);
        }
        let for_function = ScFunction::try_from(data[0])?;
        let result = match data[1] {
            0 => ScResultCode::Ack,
            1 => ScResultCode::Nak,
            _ => return Err(DataLinkError::InvalidFrame),
        };
        if result == ScResultCode::Ack {
            return Ok(Self::ack(for_function));
        }
        if data.len() < 7 {
            return Err(DataLinkError::InvalidFrame);
        }
        Ok(Self {
            for_function,
            result,
            error_header_marker: data[2],
            error_class: u16::from_be_bytes([data[3], data[4]]),
            error_code: u16::from_be_bytes([data[5], data[6]]),
            error_details: String::from_utf8_lossy(&data[7..]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_round_trip() {
        let msg = ScMessage::plain(ScFunction::HeartbeatRequest, 0x1234);
        let wire = msg.encode();
        assert_eq!(wire, vec![0x0A, 0x00, 0x12, 0x34]);
        assert_eq!(ScMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn message_with_vmacs_round_trip() {
        let msg = ScMessage {
            function: ScFunction::EncapsulatedNpdu,
            message_id: 7,
            originating: Some(ScVmac([1, 2, 3, 4, 5, 6])),
            destination: Some(ScVmac::BROADCAST),
            dest_options: Vec::new(),
            data_options: Vec::new(),
            payload: vec![0x01, 0x00, 0xAA],
        };
        let wire = msg.encode();
        assert_eq!(wire[1], 0x0C);
        assert_eq!(ScMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn header_options_round_trip() {
        let msg = ScMessage {
            function: ScFunction::EncapsulatedNpdu,
            message_id: 1,
            originating: None,
            destination: None,
            dest_options: vec![ScHeaderOption::new(OPTION_SECURE_PATH, true, Vec::new())],
            data_options: vec![
                ScHeaderOption::new(31, false, vec![0xDE, 0xAD]),
                ScHeaderOption::new(2, true, Vec::new()),
            ],
            payload: vec![0x42],
        };
        let decoded = ScMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_option_rejected() {
        // Marker announces data, but the length bytes are missing.
        let wire = vec![0x01, 0x01, 0x00, 0x01, MARKER_HAS_DATA | 5];
        assert!(ScMessage::decode(&wire).is_err());
    }

    #[test]
    fn connect_payload_round_trip() {
        let payload = ConnectPayload {
            vmac: ScVmac([9; 6]),
            uuid: DeviceUuid([3; 16]),
            max_bvlc_length: 6000,
            max_npdu_length: 1497,
        };
        let wire = payload.encode();
        assert_eq!(wire.len(), ConnectPayload::LENGTH);
        assert_eq!(ConnectPayload::decode(&wire).unwrap(), payload);
    }

    #[test]
    fn result_payload_nak_round_trip() {
        let payload = ScResultPayload::nak(
            ScFunction::ConnectRequest,
            0,
            ERROR_NODE_DUPLICATE_VMAC,
            "duplicate vmac",
        );
        let decoded = ScResultPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.error_code, 0x0071);
    }

    #[test]
    fn result_payload_ack_is_two_bytes() {
        let payload = ScResultPayload::ack(ScFunction::ConnectRequest);
        assert_eq!(payload.encode().len(), 2);
    }
}
