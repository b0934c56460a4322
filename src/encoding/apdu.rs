//! APDU framing.
//!
//! The eight PDU types of ASHRAE 135 Clause 20.1, distinguished by the high
//! nibble of the first octet. ConfirmedRequest and ComplexACK carry optional
//! segmentation fields keyed off a bit in the header; decoders enforce the
//! minimum lengths those bits imply.

use super::{
    decode_application_enumerated, encode_application_enumerated, EncodingError, Result,
};

/// APDU type codes (high nibble of octet 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            _ => Err(EncodingError::InvalidFormat("unknown APDU type")),
        }
    }
}

/// Maximum segments accepted, encoded in bits 6-4 of the second
/// ConfirmedRequest octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MaxSegments {
    #[default]
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }

    /// Segment count this encoding admits, `None` for unspecified.
    pub fn count(&self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
            MaxSegments::GreaterThan64 => Some(256),
        }
    }
}

/// Maximum APDU length accepted, encoded in bits 3-0 of the second
/// ConfirmedRequest octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    #[default]
    Up1476 = 5,
}

impl MaxApduSize {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0 => MaxApduSize::Up50,
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            _ => MaxApduSize::Up1476,
        }
    }

    /// The largest encoding not exceeding `len` octets.
    pub fn for_length(len: usize) -> Self {
        if len >= 1476 {
            MaxApduSize::Up1476
        } else if len >= 1024 {
            MaxApduSize::Up1024
        } else if len >= 480 {
            MaxApduSize::Up480
        } else if len >= 206 {
            MaxApduSize::Up206
        } else if len >= 128 {
            MaxApduSize::Up128
        } else {
            MaxApduSize::Up50
        }
    }

    /// Size in octets.
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }
}

/// Application Protocol Data Unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request.
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_apdu: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request.
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment.
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment, possibly segmented.
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Segment acknowledgment.
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },

    /// Error PDU; class and code ride as application-tagged enumerateds.
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u16,
        error_code: u16,
    },

    /// Reject PDU.
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU.
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

impl Apdu {
    /// PDU type of this APDU.
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// Invoke id, when the PDU carries one.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_segments,
                max_apdu,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut first = (ApduType::ConfirmedRequest as u8) << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                if *segmented_response_accepted {
                    first |= 0x02;
                }
                buffer.push(first);
                buffer.push(((*max_segments as u8) << 4) | (*max_apdu as u8));
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((ApduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }

            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut first = (ApduType::ComplexAck as u8) << 4;
                if *segmented {
                    first |= 0x08;
                }
                if *more_follows {
                    first |= 0x04;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut first = (ApduType::SegmentAck as u8) << 4;
                if *negative {
                    first |= 0x02;
                }
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*actual_window_size);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.push((ApduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                encode_application_enumerated(&mut buffer, *error_class as u32);
                encode_application_enumerated(&mut buffer, *error_code as u32);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((ApduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*reject_reason);
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut first = (ApduType::Abort as u8) << 4;
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*abort_reason);
            }
        }
        buffer
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(EncodingError::Truncated {
                needed: 1,
                available: 0,
            });
        }
        let first = data[0];
        let apdu_type = ApduType::try_from(first >> 4)?;

        match apdu_type {
            ApduType::ConfirmedRequest => {
                let segmented = first & 0x08 != 0;
                // Segmented requests carry sequence and window octets before
                // the service choice.
                let min_len = if segmented { 6 } else { 4 };
                if data.len() < min_len {
                    return Err(EncodingError::Truncated {
                        needed: min_len,
                        available: data.len(),
                    });
                }
                let more_follows = first & 0x04 != 0;
                let segmented_response_accepted = first & 0x02 != 0;
                let max_segments = MaxSegments::from_bits(data[1] >> 4);
                let max_apdu = MaxApduSize::from_bits(data[1]);
                let invoke_id = data[2];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[3]), Some(data[4]), 5)
                } else {
                    (None, None, 3)
                };
                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments,
                    max_apdu,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }

            ApduType::UnconfirmedRequest => {
                if data.len() < 2 {
                    return Err(EncodingError::Truncated {
                        needed: 2,
                        available: data.len(),
                    });
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: data[2..].to_vec(),
                })
            }

            ApduType::SimpleAck => {
                if data.len() < 3 {
                    return Err(EncodingError::Truncated {
                        needed: 3,
                        available: data.len(),
                    });
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::ComplexAck => {
                let segmented = first & 0x08 != 0;
                let min_len = if segmented { 5 } else { 3 };
                if data.len() < min_len {
                    return Err(EncodingError::Truncated {
                        needed: min_len,
                        available: data.len(),
                    });
                }
                let more_follows = first & 0x04 != 0;
                let invoke_id = data[1];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[2]), Some(data[3]), 4)
                } else {
                    (None, None, 2)
                };
                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }

            ApduType::SegmentAck => {
                if data.len() < 4 {
                    return Err(EncodingError::Truncated {
                        needed: 4,
                        available: data.len(),
                    });
                }
                Ok(Apdu::SegmentAck {
                    negative: first & 0x02 != 0,
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    actual_window_size: data[3],
                })
            }

            ApduType::Error => {
                if data.len() < 5 {
                    return Err(EncodingError::Truncated {
                        needed: 5,
                        available: data.len(),
                    });
                }
                let invoke_id = data[1];
                let service_choice = data[2];
                let (class, consumed) = decode_application_enumerated(&data[3..])?;
                let (code, _) = decode_application_enumerated(&data[3 + consumed..])?;
                Ok(Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class: class as u16,
                    error_code: code as u16,
                })
            }

            ApduType::Reject => {
                if data.len() < 3 {
                    return Err(EncodingError::Truncated {
                        needed: 3,
                        available: data.len(),
                    });
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }

            ApduType::Abort => {
                if data.len() < 3 {
                    return Err(EncodingError::Truncated {
                        needed: 3,
                        available: data.len(),
                    });
                }
                Ok(Apdu::Abort {
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }
        }
    }
}
