//! BACnet application services.
//!
//! Service choice enumerations and typed request/response structures with
//! their wire codecs, for the services the core implements natively:
//! Who-Is/I-Am, Who-Has/I-Have, ReadProperty, WriteProperty,
//! ReadPropertyMultiple, SubscribeCOV(Property), and COVNotification.
//! Further services plug in through the application layer's raw handlers;
//! their byte layouts follow the same tagging conventions.

use crate::encoding::{
    decode_application_object_id, decode_application_unsigned, decode_context_enumerated,
    decode_property_values, decode_tag, encode_application_enumerated,
    encode_application_object_id, encode_application_unsigned, encode_closing_tag,
    encode_context_boolean, encode_context_enumerated, encode_context_object_id,
    encode_context_real, encode_context_unsigned, encode_opening_tag, encode_property_value,
    extract_context_value, EncodingError, Tag, TagContent,
};
use crate::error::{BacnetError, ErrorClass, ErrorCode};
use crate::object::{ObjectIdentifier, PropertyIdentifier, PropertyValue};

/// Result type for service codec operations.
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Confirmed service choices (Clause 21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
    AtomicReadFile = 6,
    AtomicWriteFile = 7,
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,
    ReadRange = 26,
    SubscribeCovProperty = 28,
    GetEventInformation = 29,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConfirmedServiceChoice::AcknowledgeAlarm),
            1 => Ok(ConfirmedServiceChoice::ConfirmedCovNotification),
            2 => Ok(ConfirmedServiceChoice::ConfirmedEventNotification),
            3 => Ok(ConfirmedServiceChoice::GetAlarmSummary),
            4 => Ok(ConfirmedServiceChoice::GetEnrollmentSummary),
            5 => Ok(ConfirmedServiceChoice::SubscribeCov),
            6 => Ok(ConfirmedServiceChoice::AtomicReadFile),
            7 => Ok(ConfirmedServiceChoice::AtomicWriteFile),
            8 => Ok(ConfirmedServiceChoice::AddListElement),
            9 => Ok(ConfirmedServiceChoice::RemoveListElement),
            10 => Ok(ConfirmedServiceChoice::CreateObject),
            11 => Ok(ConfirmedServiceChoice::DeleteObject),
            12 => Ok(ConfirmedServiceChoice::ReadProperty),
            14 => Ok(ConfirmedServiceChoice::ReadPropertyMultiple),
            15 => Ok(ConfirmedServiceChoice::WriteProperty),
            16 => Ok(ConfirmedServiceChoice::WritePropertyMultiple),
            17 => Ok(ConfirmedServiceChoice::DeviceCommunicationControl),
            18 => Ok(ConfirmedServiceChoice::ConfirmedPrivateTransfer),
            19 => Ok(ConfirmedServiceChoice::ConfirmedTextMessage),
            20 => Ok(ConfirmedServiceChoice::ReinitializeDevice),
            26 => Ok(ConfirmedServiceChoice::ReadRange),
            28 => Ok(ConfirmedServiceChoice::SubscribeCovProperty),
            29 => Ok(ConfirmedServiceChoice::GetEventInformation),
            _ => Err(EncodingError::InvalidFormat("unknown confirmed service")),
        }
    }
}

/// Unconfirmed service choices (Clause 21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(UnconfirmedServiceChoice::IAm),
            1 => Ok(UnconfirmedServiceChoice::IHave),
            2 => Ok(UnconfirmedServiceChoice::UnconfirmedCovNotification),
            3 => Ok(UnconfirmedServiceChoice::UnconfirmedEventNotification),
            4 => Ok(UnconfirmedServiceChoice::UnconfirmedPrivateTransfer),
            5 => Ok(UnconfirmedServiceChoice::UnconfirmedTextMessage),
            6 => Ok(UnconfirmedServiceChoice::TimeSynchronization),
            7 => Ok(UnconfirmedServiceChoice::WhoHas),
            8 => Ok(UnconfirmedServiceChoice::WhoIs),
            9 => Ok(UnconfirmedServiceChoice::UtcTimeSynchronization),
            _ => Err(EncodingError::InvalidFormat("unknown unconfirmed service")),
        }
    }
}

/// Sequential reader over service data, tracking the current offset.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek(&self) -> Option<Tag> {
        decode_tag(self.data, self.pos).ok().map(|(tag, _)| tag)
    }

    /// True when the next tag is a context tag (of any form) numbered `n`.
    fn at_context(&self, n: u8) -> bool {
        self.peek().is_some_and(|tag| tag.is_context(n))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn advance(&mut self, consumed: usize) {
        self.pos += consumed;
    }

    fn context_unsigned(&mut self, n: u8) -> Result<u32> {
        let (value, consumed) = crate::encoding::decode_context_unsigned(self.rest(), n)?;
        self.advance(consumed);
        Ok(value)
    }

    fn context_enumerated(&mut self, n: u8) -> Result<u32> {
        let (value, consumed) = decode_context_enumerated(self.rest(), n)?;
        self.advance(consumed);
        Ok(value)
    }

    fn context_boolean(&mut self, n: u8) -> Result<bool> {
        let (value, consumed) = crate::encoding::decode_context_boolean(self.rest(), n)?;
        self.advance(consumed);
        Ok(value)
    }

    fn context_real(&mut self, n: u8) -> Result<f32> {
        let (value, consumed) = crate::encoding::decode_context_real(self.rest(), n)?;
        self.advance(consumed);
        Ok(value)
    }

    fn context_object_id(&mut self, n: u8) -> Result<ObjectIdentifier> {
        let (value, consumed) = crate::encoding::decode_context_object_id(self.rest(), n)?;
        self.advance(consumed);
        Ok(value)
    }

    fn context_character_string(&mut self, n: u8) -> Result<String> {
        let (value, consumed) =
            crate::encoding::decode_context_character_string(self.rest(), n)?;
        self.advance(consumed);
        Ok(value)
    }

    /// Enter a constructed `[n] ... [/n]` region, returning its content.
    fn constructed(&mut self, n: u8) -> Result<&'a [u8]> {
        let (inner, next) = extract_context_value(self.data, self.pos, n)?;
        self.pos = next;
        Ok(inner)
    }
}

// ---------------------------------------------------------------------------
// Who-Is / I-Am
// ---------------------------------------------------------------------------

/// Who-Is request with an optional device instance range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIs {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
}

impl WhoIs {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            encode_context_unsigned(&mut buffer, 0, low);
            encode_context_unsigned(&mut buffer, 1, high);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        if reader.done() {
            return Ok(Self::default());
        }
        let low = reader.context_unsigned(0)?;
        let high = reader.context_unsigned(1)?;
        Ok(Self {
            low_limit: Some(low),
            high_limit: Some(high),
        })
    }

    /// Whether a device instance falls inside the requested range.
    pub fn matches(&self, instance: u32) -> bool {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => (low..=high).contains(&instance),
            _ => true,
        }
    }
}

/// I-Am announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAm {
    pub device_id: ObjectIdentifier,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

impl IAm {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_application_object_id(&mut buffer, self.device_id);
        encode_application_unsigned(&mut buffer, self.max_apdu);
        encode_application_enumerated(&mut buffer, self.segmentation);
        encode_application_unsigned(&mut buffer, self.vendor_id);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_id, mut pos) = decode_application_object_id(data)?;
        let (max_apdu, consumed) = decode_application_unsigned(&data[pos..])?;
        pos += consumed;
        let (segmentation, consumed) =
            crate::encoding::decode_application_enumerated(&data[pos..])?;
        pos += consumed;
        let (vendor_id, _) = decode_application_unsigned(&data[pos..])?;
        Ok(Self {
            device_id,
            max_apdu,
            segmentation,
            vendor_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Who-Has / I-Have
// ---------------------------------------------------------------------------

/// The object selector of a Who-Has request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoHasSelector {
    ById(ObjectIdentifier),
    ByName(String),
}

/// Who-Has request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoHas {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
    pub selector: WhoHasSelector,
}

impl WhoHas {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            encode_context_unsigned(&mut buffer, 0, low);
            encode_context_unsigned(&mut buffer, 1, high);
        }
        match &self.selector {
            WhoHasSelector::ById(id) => encode_context_object_id(&mut buffer, 2, *id),
            WhoHasSelector::ByName(name) => {
                crate::encoding::encode_context_character_string(&mut buffer, 3, name)
            }
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let (low_limit, high_limit) = if reader.at_context(0) {
            let low = reader.context_unsigned(0)?;
            let high = reader.context_unsigned(1)?;
            (Some(low), Some(high))
        } else {
            (None, None)
        };
        let selector = if reader.at_context(2) {
            WhoHasSelector::ById(reader.context_object_id(2)?)
        } else {
            WhoHasSelector::ByName(reader.context_character_string(3)?)
        };
        Ok(Self {
            low_limit,
            high_limit,
            selector,
        })
    }
}

/// I-Have announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHave {
    pub device_id: ObjectIdentifier,
    pub object_id: ObjectIdentifier,
    pub object_name: String,
}

impl IHave {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_application_object_id(&mut buffer, self.device_id);
        encode_application_object_id(&mut buffer, self.object_id);
        crate::encoding::encode_application_character_string(&mut buffer, &self.object_name);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_id, mut pos) = decode_application_object_id(data)?;
        let (object_id, consumed) = decode_application_object_id(&data[pos..])?;
        pos += consumed;
        let (object_name, _) =
            crate::encoding::decode_application_character_string(&data[pos..])?;
        Ok(Self {
            device_id,
            object_id,
            object_name,
        })
    }
}

// ---------------------------------------------------------------------------
// ReadProperty / WriteProperty
// ---------------------------------------------------------------------------

/// ReadProperty request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadProperty {
    pub object_id: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

impl ReadProperty {
    pub fn new(object_id: ObjectIdentifier, property: PropertyIdentifier) -> Self {
        Self {
            object_id,
            property,
            array_index: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_context_object_id(&mut buffer, 0, self.object_id);
        encode_context_enumerated(&mut buffer, 1, self.property.code());
        if let Some(index) = self.array_index {
            encode_context_unsigned(&mut buffer, 2, index);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let object_id = reader.context_object_id(0)?;
        let property = PropertyIdentifier::from_code(reader.context_enumerated(1)?);
        let array_index = if reader.at_context(2) {
            Some(reader.context_unsigned(2)?)
        } else {
            None
        };
        Ok(Self {
            object_id,
            property,
            array_index,
        })
    }
}

/// ReadProperty acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object_id: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub value: PropertyValue,
}

impl ReadPropertyAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_context_object_id(&mut buffer, 0, self.object_id);
        encode_context_enumerated(&mut buffer, 1, self.property.code());
        if let Some(index) = self.array_index {
            encode_context_unsigned(&mut buffer, 2, index);
        }
        encode_opening_tag(&mut buffer, 3);
        encode_property_value(&mut buffer, &self.value);
        encode_closing_tag(&mut buffer, 3);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let object_id = reader.context_object_id(0)?;
        let property = PropertyIdentifier::from_code(reader.context_enumerated(1)?);
        let array_index = if reader.at_context(2) {
            Some(reader.context_unsigned(2)?)
        } else {
            None
        };
        let inner = reader.constructed(3)?;
        let value = decode_property_values(inner)?;
        Ok(Self {
            object_id,
            property,
            array_index,
            value,
        })
    }
}

/// WriteProperty request.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteProperty {
    pub object_id: ObjectIdentifier,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub value: PropertyValue,
    pub priority: Option<u8>,
}

impl WriteProperty {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_context_object_id(&mut buffer, 0, self.object_id);
        encode_context_enumerated(&mut buffer, 1, self.property.code());
        if let Some(index) = self.array_index {
            encode_context_unsigned(&mut buffer, 2, index);
        }
        encode_opening_tag(&mut buffer, 3);
        encode_property_value(&mut buffer, &self.value);
        encode_closing_tag(&mut buffer, 3);
        if let Some(priority) = self.priority {
            encode_context_unsigned(&mut buffer, 4, u32::from(priority));
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let object_id = reader.context_object_id(0)?;
        let property = PropertyIdentifier::from_code(reader.context_enumerated(1)?);
        let array_index = if reader.at_context(2) {
            Some(reader.context_unsigned(2)?)
        } else {
            None
        };
        let inner = reader.constructed(3)?;
        let value = decode_property_values(inner)?;
        let priority = if reader.at_context(4) {
            Some(reader.context_unsigned(4)? as u8)
        } else {
            None
        };
        Ok(Self {
            object_id,
            property,
            array_index,
            value,
            priority,
        })
    }
}

// ---------------------------------------------------------------------------
// ReadPropertyMultiple
// ---------------------------------------------------------------------------

/// One property reference inside a read-access specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
}

/// One object and its requested properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpecification {
    pub object_id: ObjectIdentifier,
    pub properties: Vec<PropertyReference>,
}

/// ReadPropertyMultiple request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadPropertyMultiple {
    pub specifications: Vec<ReadAccessSpecification>,
}

impl ReadPropertyMultiple {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        for spec in &self.specifications {
            encode_context_object_id(&mut buffer, 0, spec.object_id);
            encode_opening_tag(&mut buffer, 1);
            for property in &spec.properties {
                encode_context_enumerated(&mut buffer, 0, property.property.code());
                if let Some(index) = property.array_index {
                    encode_context_unsigned(&mut buffer, 1, index);
                }
            }
            encode_closing_tag(&mut buffer, 1);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut specifications = Vec::new();
        while !reader.done() {
            let object_id = reader.context_object_id(0)?;
            let inner = reader.constructed(1)?;
            let mut inner_reader = Reader::new(inner);
            let mut properties = Vec::new();
            while !inner_reader.done() {
                let property =
                    PropertyIdentifier::from_code(inner_reader.context_enumerated(0)?);
                let array_index = if inner_reader.at_context(1) {
                    Some(inner_reader.context_unsigned(1)?)
                } else {
                    None
                };
                properties.push(PropertyReference {
                    property,
                    array_index,
                });
            }
            specifications.push(ReadAccessSpecification {
                object_id,
                properties,
            });
        }
        Ok(Self { specifications })
    }
}

/// Value or error for one requested property.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadAccessResultValue {
    Value(PropertyValue),
    Error(BacnetError),
}

/// One property's outcome inside a read-access result.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResultElement {
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub result: ReadAccessResultValue,
}

/// One object's results.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult {
    pub object_id: ObjectIdentifier,
    pub elements: Vec<ReadAccessResultElement>,
}

/// ReadPropertyMultiple acknowledgment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadPropertyMultipleAck {
    pub results: Vec<ReadAccessResult>,
}

impl ReadPropertyMultipleAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        for result in &self.results {
            encode_context_object_id(&mut buffer, 0, result.object_id);
            encode_opening_tag(&mut buffer, 1);
            for element in &result.elements {
                encode_context_enumerated(&mut buffer, 2, element.property.code());
                if let Some(index) = element.array_index {
                    encode_context_unsigned(&mut buffer, 3, index);
                }
                match &element.result {
                    ReadAccessResultValue::Value(value) => {
                        encode_opening_tag(&mut buffer, 4);
                        encode_property_value(&mut buffer, value);
                        encode_closing_tag(&mut buffer, 4);
                    }
                    ReadAccessResultValue::Error(error) => {
                        encode_opening_tag(&mut buffer, 5);
                        encode_application_enumerated(&mut buffer, error.class as u32);
                        encode_application_enumerated(&mut buffer, error.code as u32);
                        encode_closing_tag(&mut buffer, 5);
                    }
                }
            }
            encode_closing_tag(&mut buffer, 1);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut results = Vec::new();
        while !reader.done() {
            let object_id = reader.context_object_id(0)?;
            let inner = reader.constructed(1)?;
            let mut inner_reader = Reader::new(inner);
            let mut elements = Vec::new();
            while !inner_reader.done() {
                let property =
                    PropertyIdentifier::from_code(inner_reader.context_enumerated(2)?);
                let array_index = if inner_reader.at_context(3) {
                    Some(inner_reader.context_unsigned(3)?)
                } else {
                    None
                };
                let result = if inner_reader.at_context(4) {
                    let value_bytes = inner_reader.constructed(4)?;
                    ReadAccessResultValue::Value(decode_property_values(value_bytes)?)
                } else {
                    let error_bytes = inner_reader.constructed(5)?;
                    let (class, consumed) =
                        crate::encoding::decode_application_enumerated(error_bytes)?;
                    let (code, _) = crate::encoding::decode_application_enumerated(
                        &error_bytes[consumed..],
                    )?;
                    ReadAccessResultValue::Error(BacnetError::from_raw(
                        class as u16,
                        code as u16,
                    ))
                };
                elements.push(ReadAccessResultElement {
                    property,
                    array_index,
                    result,
                });
            }
            results.push(ReadAccessResult {
                object_id,
                elements,
            });
        }
        Ok(Self { results })
    }
}

// ---------------------------------------------------------------------------
// SubscribeCOV / SubscribeCOVProperty / COVNotification
// ---------------------------------------------------------------------------

/// SubscribeCOV request. Absent `confirmed` and `lifetime` together mean
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCov {
    pub process_id: u32,
    pub object_id: ObjectIdentifier,
    pub confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
}

impl SubscribeCov {
    pub fn is_cancellation(&self) -> bool {
        self.confirmed.is_none() && self.lifetime_seconds.is_none()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 0, self.process_id);
        encode_context_object_id(&mut buffer, 1, self.object_id);
        if let Some(confirmed) = self.confirmed {
            encode_context_boolean(&mut buffer, 2, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            encode_context_unsigned(&mut buffer, 3, lifetime);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let process_id = reader.context_unsigned(0)?;
        let object_id = reader.context_object_id(1)?;
        let confirmed = if reader.at_context(2) {
            Some(reader.context_boolean(2)?)
        } else {
            None
        };
        let lifetime_seconds = if reader.at_context(3) {
            Some(reader.context_unsigned(3)?)
        } else {
            None
        };
        Ok(Self {
            process_id,
            object_id,
            confirmed,
            lifetime_seconds,
        })
    }
}

/// SubscribeCOVProperty request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscribeCovProperty {
    pub process_id: u32,
    pub object_id: ObjectIdentifier,
    pub confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    pub cov_increment: Option<f32>,
}

impl SubscribeCovProperty {
    pub fn is_cancellation(&self) -> bool {
        self.confirmed.is_none() && self.lifetime_seconds.is_none()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 0, self.process_id);
        encode_context_object_id(&mut buffer, 1, self.object_id);
        if let Some(confirmed) = self.confirmed {
            encode_context_boolean(&mut buffer, 2, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            encode_context_unsigned(&mut buffer, 3, lifetime);
        }
        encode_opening_tag(&mut buffer, 4);
        encode_context_enumerated(&mut buffer, 0, self.property.code());
        if let Some(index) = self.array_index {
            encode_context_unsigned(&mut buffer, 1, index);
        }
        encode_closing_tag(&mut buffer, 4);
        if let Some(increment) = self.cov_increment {
            encode_context_real(&mut buffer, 5, increment);
        }
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let process_id = reader.context_unsigned(0)?;
        let object_id = reader.context_object_id(1)?;
        let confirmed = if reader.at_context(2) {
            Some(reader.context_boolean(2)?)
        } else {
            None
        };
        let lifetime_seconds = if reader.at_context(3) {
            Some(reader.context_unsigned(3)?)
        } else {
            None
        };
        let monitored = reader.constructed(4)?;
        let mut monitored_reader = Reader::new(monitored);
        let property = PropertyIdentifier::from_code(monitored_reader.context_enumerated(0)?);
        let array_index = if monitored_reader.at_context(1) {
            Some(monitored_reader.context_unsigned(1)?)
        } else {
            None
        };
        let cov_increment = if reader.at_context(5) {
            Some(reader.context_real(5)?)
        } else {
            None
        };
        Ok(Self {
            process_id,
            object_id,
            confirmed,
            lifetime_seconds,
            property,
            array_index,
            cov_increment,
        })
    }
}

/// COVNotification body, shared by the confirmed and unconfirmed forms.
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
    pub process_id: u32,
    pub initiating_device: ObjectIdentifier,
    pub object_id: ObjectIdentifier,
    pub time_remaining: u32,
    pub values: Vec<(PropertyIdentifier, PropertyValue)>,
}

impl CovNotification {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 0, self.process_id);
        encode_context_object_id(&mut buffer, 1, self.initiating_device);
        encode_context_object_id(&mut buffer, 2, self.object_id);
        encode_context_unsigned(&mut buffer, 3, self.time_remaining);
        encode_opening_tag(&mut buffer, 4);
        for (property, value) in &self.values {
            encode_context_enumerated(&mut buffer, 0, property.code());
            encode_opening_tag(&mut buffer, 2);
            encode_property_value(&mut buffer, value);
            encode_closing_tag(&mut buffer, 2);
        }
        encode_closing_tag(&mut buffer, 4);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let process_id = reader.context_unsigned(0)?;
        let initiating_device = reader.context_object_id(1)?;
        let object_id = reader.context_object_id(2)?;
        let time_remaining = reader.context_unsigned(3)?;
        let list = reader.constructed(4)?;
        let mut list_reader = Reader::new(list);
        let mut values = Vec::new();
        while !list_reader.done() {
            let property = PropertyIdentifier::from_code(list_reader.context_enumerated(0)?);
            // An optional [1] array index may sit between property and
            // value.
            if list_reader.at_context(1) {
                let tag = list_reader.peek().expect("peeked");
                if tag.content != TagContent::Opening {
                    list_reader.context_unsigned(1)?;
                }
            }
            let value_bytes = list_reader.constructed(2)?;
            values.push((property, decode_property_values(value_bytes)?));
        }
        Ok(Self {
            process_id,
            initiating_device,
            object_id,
            time_remaining,
            values,
        })
    }
}

/// Encode the Error-PDU style error sequence used inside constructed
/// results.
pub fn encode_error(buffer: &mut Vec<u8>, error: &BacnetError) {
    encode_application_enumerated(buffer, error.class as u32);
    encode_application_enumerated(buffer, error.code as u32);
}

/// The fallback error for handler panics or unclassified failures.
pub fn internal_error() -> BacnetError {
    BacnetError::new(ErrorClass::Device, ErrorCode::OperationalProblem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectType, StatusFlags};

    #[test]
    fn who_is_round_trip() {
        let unlimited = WhoIs::default();
        assert!(unlimited.encode().is_empty());
        assert_eq!(WhoIs::decode(&unlimited.encode()).unwrap(), unlimited);
        assert!(unlimited.matches(12345));

        let ranged = WhoIs {
            low_limit: Some(100),
            high_limit: Some(200),
        };
        let decoded = WhoIs::decode(&ranged.encode()).unwrap();
        assert_eq!(decoded, ranged);
        assert!(decoded.matches(150));
        assert!(!decoded.matches(201));
    }

    #[test]
    fn i_am_round_trip() {
        let iam = IAm {
            device_id: ObjectIdentifier::new(ObjectType::Device, 1234),
            max_apdu: 1476,
            segmentation: 0,
            vendor_id: 999,
        };
        assert_eq!(IAm::decode(&iam.encode()).unwrap(), iam);
    }

    #[test]
    fn who_has_round_trip() {
        let by_id = WhoHas {
            low_limit: None,
            high_limit: None,
            selector: WhoHasSelector::ById(ObjectIdentifier::new(ObjectType::AnalogValue, 3)),
        };
        assert_eq!(WhoHas::decode(&by_id.encode()).unwrap(), by_id);

        let by_name = WhoHas {
            low_limit: Some(1),
            high_limit: Some(99),
            selector: WhoHasSelector::ByName("pump-1".into()),
        };
        assert_eq!(WhoHas::decode(&by_name.encode()).unwrap(), by_name);
    }

    #[test]
    fn i_have_round_trip() {
        let ihave = IHave {
            device_id: ObjectIdentifier::new(ObjectType::Device, 7),
            object_id: ObjectIdentifier::new(ObjectType::BinaryValue, 3),
            object_name: "door".into(),
        };
        assert_eq!(IHave::decode(&ihave.encode()).unwrap(), ihave);
    }

    #[test]
    fn read_property_round_trip() {
        let request = ReadProperty {
            object_id: ObjectIdentifier::new(ObjectType::AnalogInput, 5),
            property: PropertyIdentifier::PresentValue,
            array_index: Some(2),
        };
        assert_eq!(ReadProperty::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn read_property_ack_round_trip() {
        let ack = ReadPropertyAck {
            object_id: ObjectIdentifier::new(ObjectType::AnalogInput, 5),
            property: PropertyIdentifier::PresentValue,
            array_index: None,
            value: PropertyValue::Real(21.5),
        };
        assert_eq!(ReadPropertyAck::decode(&ack.encode()).unwrap(), ack);

        // Array-valued acks come back as arrays.
        let ack = ReadPropertyAck {
            object_id: ObjectIdentifier::new(ObjectType::Device, 1),
            property: PropertyIdentifier::ObjectList,
            array_index: None,
            value: PropertyValue::Array(vec![
                PropertyValue::ObjectId(ObjectIdentifier::new(ObjectType::Device, 1)),
                PropertyValue::ObjectId(ObjectIdentifier::new(ObjectType::AnalogValue, 2)),
            ]),
        };
        assert_eq!(ReadPropertyAck::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn write_property_round_trip() {
        let request = WriteProperty {
            object_id: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            property: PropertyIdentifier::PresentValue,
            array_index: None,
            value: PropertyValue::Real(72.0),
            priority: Some(8),
        };
        assert_eq!(WriteProperty::decode(&request.encode()).unwrap(), request);

        // Relinquish: a Null value at a priority.
        let relinquish = WriteProperty {
            object_id: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            property: PropertyIdentifier::PresentValue,
            array_index: None,
            value: PropertyValue::Null,
            priority: Some(8),
        };
        assert_eq!(
            WriteProperty::decode(&relinquish.encode()).unwrap(),
            relinquish
        );
    }

    #[test]
    fn read_property_multiple_round_trip() {
        let request = ReadPropertyMultiple {
            specifications: vec![
                ReadAccessSpecification {
                    object_id: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
                    properties: vec![
                        PropertyReference {
                            property: PropertyIdentifier::PresentValue,
                            array_index: None,
                        },
                        PropertyReference {
                            property: PropertyIdentifier::StatusFlags,
                            array_index: None,
                        },
                    ],
                },
                ReadAccessSpecification {
                    object_id: ObjectIdentifier::new(ObjectType::Device, 9),
                    properties: vec![PropertyReference {
                        property: PropertyIdentifier::ObjectList,
                        array_index: Some(0),
                    }],
                },
            ],
        };
        assert_eq!(
            ReadPropertyMultiple::decode(&request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn read_property_multiple_ack_round_trip() {
        let ack = ReadPropertyMultipleAck {
            results: vec![ReadAccessResult {
                object_id: ObjectIdentifier::new(ObjectType::AnalogInput, 1),
                elements: vec![
                    ReadAccessResultElement {
                        property: PropertyIdentifier::PresentValue,
                        array_index: None,
                        result: ReadAccessResultValue::Value(PropertyValue::Real(20.0)),
                    },
                    ReadAccessResultElement {
                        property: PropertyIdentifier::Other(9999),
                        array_index: None,
                        result: ReadAccessResultValue::Error(BacnetError::new(
                            ErrorClass::Property,
                            ErrorCode::UnknownProperty,
                        )),
                    },
                ],
            }],
        };
        assert_eq!(
            ReadPropertyMultipleAck::decode(&ack.encode()).unwrap(),
            ack
        );
    }

    #[test]
    fn subscribe_cov_round_trip() {
        let subscribe = SubscribeCov {
            process_id: 18,
            object_id: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            confirmed: Some(false),
            lifetime_seconds: Some(300),
        };
        assert_eq!(SubscribeCov::decode(&subscribe.encode()).unwrap(), subscribe);
        assert!(!subscribe.is_cancellation());

        let cancel = SubscribeCov {
            process_id: 18,
            object_id: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            confirmed: None,
            lifetime_seconds: None,
        };
        assert!(SubscribeCov::decode(&cancel.encode()).unwrap().is_cancellation());
    }

    #[test]
    fn subscribe_cov_property_round_trip() {
        let subscribe = SubscribeCovProperty {
            process_id: 3,
            object_id: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            confirmed: Some(true),
            lifetime_seconds: Some(60),
            property: PropertyIdentifier::PresentValue,
            array_index: None,
            cov_increment: Some(5.0),
        };
        assert_eq!(
            SubscribeCovProperty::decode(&subscribe.encode()).unwrap(),
            subscribe
        );
    }

    #[test]
    fn cov_notification_round_trip() {
        let notification = CovNotification {
            process_id: 18,
            initiating_device: ObjectIdentifier::new(ObjectType::Device, 100),
            object_id: ObjectIdentifier::new(ObjectType::AnalogValue, 1),
            time_remaining: 120,
            values: vec![
                (PropertyIdentifier::PresentValue, PropertyValue::Real(16.0)),
                (
                    PropertyIdentifier::StatusFlags,
                    PropertyValue::BitString(StatusFlags::empty().to_bit_string()),
                ),
            ],
        };
        assert_eq!(
            CovNotification::decode(&notification.encode()).unwrap(),
            notification
        );
    }

    #[test]
    fn service_choice_codes() {
        assert_eq!(ConfirmedServiceChoice::ReadProperty as u8, 12);
        assert_eq!(
            ConfirmedServiceChoice::try_from(15).unwrap(),
            ConfirmedServiceChoice::WriteProperty
        );
        assert_eq!(UnconfirmedServiceChoice::WhoIs as u8, 8);
        assert!(ConfirmedServiceChoice::try_from(200).is_err());
    }
}
