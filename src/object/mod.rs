//! BACnet Object Model
//!
//! Objects are the modeling core of BACnet: each carries an identifier
//! (type + instance), a property table describing datatype, access mode,
//! and requiredness per property, and a store of present values.
//! Commandable objects add a 16-slot priority array with a relinquish
//! default.
//!
//! Rather than one struct per object type, a single [`BacnetObject`] record
//! carries a per-type property table (built by [`property_table`]) and a
//! shared property-value map; the per-type constructors live in
//! [`analog`](crate::object) / `binary` / `multistate` / `device`
//! submodules. Behavior that differs per type (polarity reversal,
//! multi-state range checks) keys off the object type.
//!
//! # Commandable writes
//!
//! A write to Present_Value of a commandable object lands in the priority
//! array at the given priority (default 16); writing `Null` relinquishes
//! that slot. The effective present value is the lowest-index non-null
//! slot, falling back to Relinquish_Default. Current_Command_Priority
//! reports the winning slot or `Null`.

pub mod analog;
pub mod binary;
pub mod cov;
pub mod database;
pub mod device;
pub mod multistate;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{BacnetError, ErrorClass, ErrorCode};

/// Result type for object operations.
pub type Result<T> = std::result::Result<T, ObjectError>;

/// Largest valid object instance number; 4194303 is the "any instance"
/// wildcard.
pub const MAX_INSTANCE: u32 = 0x3F_FFFE;

/// Wildcard instance used in Who-Has and object lookups.
pub const ANY_INSTANCE: u32 = 0x3F_FFFF;

/// Number of slots in a priority array.
pub const PRIORITY_SLOTS: usize = 16;

/// Errors raised by object and database operations. Each maps onto a wire
/// error class/code pair via [`ObjectError::to_bacnet`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObjectError {
    #[error("unknown object")]
    UnknownObject,
    #[error("unknown property")]
    UnknownProperty,
    #[error("property is not an array")]
    PropertyIsNotAnArray,
    #[error("invalid array index")]
    InvalidArrayIndex,
    #[error("write access denied")]
    WriteAccessDenied,
    #[error("value out of range")]
    ValueOutOfRange,
    #[error("invalid data type for property")]
    InvalidDataType,
    #[error("duplicate object name {0:?}")]
    DuplicateName(String),
    #[error("object identifier already exists")]
    ObjectIdentifierAlreadyExists,
    #[error("object deletion not permitted")]
    ObjectDeletionNotPermitted,
    #[error("unsupported object type")]
    UnsupportedObjectType,
    #[error("no space for subscription")]
    ResourcesExhausted,
    #[error("property does not support COV")]
    NotCovProperty,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

impl ObjectError {
    /// Map to the wire error class and code.
    pub fn to_bacnet(&self) -> BacnetError {
        match self {
            ObjectError::UnknownObject => {
                BacnetError::new(ErrorClass::Object, ErrorCode::UnknownObject)
            }
            ObjectError::UnknownProperty => {
                BacnetError::new(ErrorClass::Property, ErrorCode::UnknownProperty)
            }
            ObjectError::PropertyIsNotAnArray => {
                BacnetError::new(ErrorClass::Property, ErrorCode::PropertyIsNotAnArray)
            }
            ObjectError::InvalidArrayIndex => {
                BacnetError::new(ErrorClass::Property, ErrorCode::InvalidArrayIndex)
            }
            ObjectError::WriteAccessDenied => {
                BacnetError::new(ErrorClass::Property, ErrorCode::WriteAccessDenied)
            }
            ObjectError::ValueOutOfRange => {
                BacnetError::new(ErrorClass::Property, ErrorCode::ValueOutOfRange)
            }
            ObjectError::InvalidDataType => {
                BacnetError::new(ErrorClass::Property, ErrorCode::InvalidDataType)
            }
            ObjectError::DuplicateName(_) => {
                BacnetError::new(ErrorClass::Object, ErrorCode::DuplicateName)
            }
            ObjectError::ObjectIdentifierAlreadyExists => BacnetError::new(
                ErrorClass::Object,
                ErrorCode::ObjectIdentifierAlreadyExists,
            ),
            ObjectError::ObjectDeletionNotPermitted => {
                BacnetError::new(ErrorClass::Object, ErrorCode::ObjectDeletionNotPermitted)
            }
            ObjectError::UnsupportedObjectType => {
                BacnetError::new(ErrorClass::Object, ErrorCode::UnsupportedObjectType)
            }
            ObjectError::ResourcesExhausted => {
                BacnetError::new(ErrorClass::Resources, ErrorCode::Other)
            }
            ObjectError::NotCovProperty => {
                BacnetError::new(ErrorClass::Property, ErrorCode::NotCovProperty)
            }
            ObjectError::InvalidParameter(_) => {
                BacnetError::new(ErrorClass::Services, ErrorCode::InconsistentParameters)
            }
        }
    }
}

/// BACnet object types (Clause 12). Types outside the modeled set decode
/// as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Calendar,
    Command,
    Device,
    EventEnrollment,
    File,
    Group,
    Loop,
    MultiStateInput,
    MultiStateOutput,
    NotificationClass,
    Program,
    Schedule,
    MultiStateValue,
    TrendLog,
    Other(u16),
}

impl ObjectType {
    pub fn code(&self) -> u16 {
        match self {
            ObjectType::AnalogInput => 0,
            ObjectType::AnalogOutput => 1,
            ObjectType::AnalogValue => 2,
            ObjectType::BinaryInput => 3,
            ObjectType::BinaryOutput => 4,
            ObjectType::BinaryValue => 5,
            ObjectType::Calendar => 6,
            ObjectType::Command => 7,
            ObjectType::Device => 8,
            ObjectType::EventEnrollment => 9,
            ObjectType::File => 10,
            ObjectType::Group => 11,
            ObjectType::Loop => 12,
            ObjectType::MultiStateInput => 13,
            ObjectType::MultiStateOutput => 14,
            ObjectType::NotificationClass => 15,
            ObjectType::Program => 16,
            ObjectType::Schedule => 17,
            ObjectType::MultiStateValue => 19,
            ObjectType::TrendLog => 20,
            ObjectType::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ObjectType::AnalogInput,
            1 => ObjectType::AnalogOutput,
            2 => ObjectType::AnalogValue,
            3 => ObjectType::BinaryInput,
            4 => ObjectType::BinaryOutput,
            5 => ObjectType::BinaryValue,
            6 => ObjectType::Calendar,
            7 => ObjectType::Command,
            8 => ObjectType::Device,
            9 => ObjectType::EventEnrollment,
            10 => ObjectType::File,
            11 => ObjectType::Group,
            12 => ObjectType::Loop,
            13 => ObjectType::MultiStateInput,
            14 => ObjectType::MultiStateOutput,
            15 => ObjectType::NotificationClass,
            16 => ObjectType::Program,
            17 => ObjectType::Schedule,
            19 => ObjectType::MultiStateValue,
            20 => ObjectType::TrendLog,
            other => ObjectType::Other(other),
        }
    }

    /// True for the input types whose Present_Value becomes writable when
    /// Out_Of_Service is set.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogInput | ObjectType::BinaryInput | ObjectType::MultiStateInput
        )
    }
}

/// Object identifier: 10-bit type, 22-bit instance, packed into 32 bits on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// True when the instance is within the assignable range.
    pub fn is_valid(&self) -> bool {
        self.instance <= MAX_INSTANCE
    }

    pub fn to_raw(&self) -> u32 {
        (u32::from(self.object_type.code() & 0x3FF) << 22) | (self.instance & 0x3F_FFFF)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_code((raw >> 22) as u16),
            instance: raw & 0x3F_FFFF,
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?},{}", self.object_type, self.instance)
    }
}

/// BACnet property identifiers (Clause 21). Identifiers outside the
/// modeled set decode as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyIdentifier {
    ActiveText,
    ApduSegmentTimeout,
    ApduTimeout,
    ApplicationSoftwareVersion,
    CovIncrement,
    DatabaseRevision,
    Description,
    DeviceAddressBinding,
    EventState,
    FirmwareRevision,
    InactiveText,
    LocalDate,
    LocalTime,
    MaxApduLengthAccepted,
    MaxPresValue,
    MinPresValue,
    ModelName,
    NumberOfApduRetries,
    NumberOfStates,
    ObjectIdentifier,
    ObjectList,
    ObjectName,
    ObjectType,
    OutOfService,
    Polarity,
    PresentValue,
    PriorityArray,
    PropertyList,
    ProtocolObjectTypesSupported,
    ProtocolRevision,
    ProtocolServicesSupported,
    ProtocolVersion,
    Reliability,
    RelinquishDefault,
    Resolution,
    SegmentationSupported,
    StateText,
    StatusFlags,
    SystemStatus,
    Units,
    VendorIdentifier,
    VendorName,
    CurrentCommandPriority,
    Other(u32),
}

impl PropertyIdentifier {
    pub fn code(&self) -> u32 {
        match self {
            PropertyIdentifier::ActiveText => 4,
            PropertyIdentifier::ApduSegmentTimeout => 10,
            PropertyIdentifier::ApduTimeout => 11,
            PropertyIdentifier::ApplicationSoftwareVersion => 12,
            PropertyIdentifier::CovIncrement => 22,
            PropertyIdentifier::DatabaseRevision => 155,
            PropertyIdentifier::Description => 28,
            PropertyIdentifier::DeviceAddressBinding => 30,
            PropertyIdentifier::EventState => 36,
            PropertyIdentifier::FirmwareRevision => 44,
            PropertyIdentifier::InactiveText => 46,
            PropertyIdentifier::LocalDate => 56,
            PropertyIdentifier::LocalTime => 57,
            PropertyIdentifier::MaxApduLengthAccepted => 62,
            PropertyIdentifier::MaxPresValue => 65,
            PropertyIdentifier::MinPresValue => 69,
            PropertyIdentifier::ModelName => 70,
            PropertyIdentifier::NumberOfApduRetries => 73,
            PropertyIdentifier::NumberOfStates => 74,
            PropertyIdentifier::ObjectIdentifier => 75,
            PropertyIdentifier::ObjectList => 76,
            PropertyIdentifier::ObjectName => 77,
            PropertyIdentifier::ObjectType => 79,
            PropertyIdentifier::OutOfService => 81,
            PropertyIdentifier::Polarity => 84,
            PropertyIdentifier::PresentValue => 85,
            PropertyIdentifier::PriorityArray => 87,
            PropertyIdentifier::PropertyList => 371,
            PropertyIdentifier::ProtocolObjectTypesSupported => 96,
            PropertyIdentifier::ProtocolRevision => 139,
            PropertyIdentifier::ProtocolServicesSupported => 97,
            PropertyIdentifier::ProtocolVersion => 98,
            PropertyIdentifier::Reliability => 103,
            PropertyIdentifier::RelinquishDefault => 104,
            PropertyIdentifier::Resolution => 106,
            PropertyIdentifier::SegmentationSupported => 107,
            PropertyIdentifier::StateText => 110,
            PropertyIdentifier::StatusFlags => 111,
            PropertyIdentifier::SystemStatus => 112,
            PropertyIdentifier::Units => 117,
            PropertyIdentifier::VendorIdentifier => 120,
            PropertyIdentifier::VendorName => 121,
            PropertyIdentifier::CurrentCommandPriority => 431,
            PropertyIdentifier::Other(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            4 => PropertyIdentifier::ActiveText,
            10 => PropertyIdentifier::ApduSegmentTimeout,
            11 => PropertyIdentifier::ApduTimeout,
            12 => PropertyIdentifier::ApplicationSoftwareVersion,
            22 => PropertyIdentifier::CovIncrement,
            155 => PropertyIdentifier::DatabaseRevision,
            28 => PropertyIdentifier::Description,
            30 => PropertyIdentifier::DeviceAddressBinding,
            36 => PropertyIdentifier::EventState,
            44 => PropertyIdentifier::FirmwareRevision,
            46 => PropertyIdentifier::InactiveText,
            56 => PropertyIdentifier::LocalDate,
            57 => PropertyIdentifier::LocalTime,
            62 => PropertyIdentifier::MaxApduLengthAccepted,
            65 => PropertyIdentifier::MaxPresValue,
            69 => PropertyIdentifier::MinPresValue,
            70 => PropertyIdentifier::ModelName,
            73 => PropertyIdentifier::NumberOfApduRetries,
            74 => PropertyIdentifier::NumberOfStates,
            75 => PropertyIdentifier::ObjectIdentifier,
            76 => PropertyIdentifier::ObjectList,
            77 => PropertyIdentifier::ObjectName,
            79 => PropertyIdentifier::ObjectType,
            81 => PropertyIdentifier::OutOfService,
            84 => PropertyIdentifier::Polarity,
            85 => PropertyIdentifier::PresentValue,
            87 => PropertyIdentifier::PriorityArray,
            371 => PropertyIdentifier::PropertyList,
            96 => PropertyIdentifier::ProtocolObjectTypesSupported,
            139 => PropertyIdentifier::ProtocolRevision,
            97 => PropertyIdentifier::ProtocolServicesSupported,
            98 => PropertyIdentifier::ProtocolVersion,
            103 => PropertyIdentifier::Reliability,
            104 => PropertyIdentifier::RelinquishDefault,
            106 => PropertyIdentifier::Resolution,
            107 => PropertyIdentifier::SegmentationSupported,
            110 => PropertyIdentifier::StateText,
            111 => PropertyIdentifier::StatusFlags,
            112 => PropertyIdentifier::SystemStatus,
            117 => PropertyIdentifier::Units,
            120 => PropertyIdentifier::VendorIdentifier,
            121 => PropertyIdentifier::VendorName,
            431 => PropertyIdentifier::CurrentCommandPriority,
            other => PropertyIdentifier::Other(other),
        }
    }
}

/// BACnet date: year offset from 1900, month, day, weekday; 0xFF is the
/// wildcard in every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
}

impl Date {
    pub const WILDCARD: u8 = 0xFF;

    /// Today's date per the local clock.
    pub fn today() -> Self {
        use chrono::Datelike;
        let now = chrono::Local::now().date_naive();
        Self {
            year: (now.year() - 1900).clamp(0, 254) as u8,
            month: now.month() as u8,
            day: now.day() as u8,
            weekday: now.weekday().number_from_monday() as u8,
        }
    }

    /// Calendar year (1900-based storage).
    pub fn calendar_year(&self) -> Option<u16> {
        (self.year != Self::WILDCARD).then(|| 1900 + u16::from(self.year))
    }

    pub fn to_wire(&self) -> [u8; 4] {
        [self.year, self.month, self.day, self.weekday]
    }

    pub fn from_wire(raw: [u8; 4]) -> Self {
        Self {
            year: raw[0],
            month: raw[1],
            day: raw[2],
            weekday: raw[3],
        }
    }
}

/// BACnet time: hour, minute, second, hundredths; 0xFF is the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl Time {
    /// The current local time.
    pub fn now() -> Self {
        use chrono::Timelike;
        let now = chrono::Local::now().time();
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            hundredths: (now.nanosecond() / 10_000_000).min(99) as u8,
        }
    }

    pub fn to_wire(&self) -> [u8; 4] {
        [self.hour, self.minute, self.second, self.hundredths]
    }

    pub fn from_wire(raw: [u8; 4]) -> Self {
        Self {
            hour: raw[0],
            minute: raw[1],
            second: raw[2],
            hundredths: raw[3],
        }
    }
}

/// A bit string: packed bits plus a count of unused trailing bits in the
/// final octet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitString {
    pub unused_bits: u8,
    pub data: Vec<u8>,
}

impl BitString {
    /// Build from individual bits, most significant first.
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut data = vec![0u8; bits.len().div_ceil(8)];
        for (index, bit) in bits.iter().enumerate() {
            if *bit {
                data[index / 8] |= 0x80 >> (index % 8);
            }
        }
        let unused_bits = (data.len() * 8 - bits.len()) as u8;
        Self { unused_bits, data }
    }

    pub fn bit(&self, index: usize) -> bool {
        self.data
            .get(index / 8)
            .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
    }

    pub fn len(&self) -> usize {
        self.data.len() * 8 - self.unused_bits as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

bitflags::bitflags! {
    /// Status_Flags bit assignments, stored as the wire octet of a 4-bit
    /// bit string (bit 0 = most significant).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u8 {
        const IN_ALARM = 0x80;
        const FAULT = 0x40;
        const OVERRIDDEN = 0x20;
        const OUT_OF_SERVICE = 0x10;
    }
}

impl StatusFlags {
    pub fn to_bit_string(self) -> BitString {
        BitString {
            unused_bits: 4,
            data: vec![self.bits()],
        }
    }
}

/// Event_State values (Clause 13).
pub mod event_state {
    pub const NORMAL: u32 = 0;
    pub const FAULT: u32 = 1;
    pub const OFFNORMAL: u32 = 2;
    pub const HIGH_LIMIT: u32 = 3;
    pub const LOW_LIMIT: u32 = 4;
}

/// Reliability values (Clause 12).
pub mod reliability {
    pub const NO_FAULT_DETECTED: u32 = 0;
    pub const NO_SENSOR: u32 = 1;
    pub const OVER_RANGE: u32 = 2;
    pub const UNDER_RANGE: u32 = 3;
    pub const OPEN_LOOP: u32 = 4;
    pub const SHORTED_LOOP: u32 = 5;
    pub const UNRELIABLE_OTHER: u32 = 7;
}

/// Polarity values for binary objects.
pub mod polarity {
    pub const NORMAL: u32 = 0;
    pub const REVERSE: u32 = 1;
}

/// Binary Present_Value states.
pub mod binary_pv {
    pub const INACTIVE: u32 = 0;
    pub const ACTIVE: u32 = 1;
}

/// A dynamically typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(BitString),
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectId(ObjectIdentifier),
    Array(Vec<PropertyValue>),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u32> {
        match self {
            PropertyValue::Unsigned(v) | PropertyValue::Enumerated(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f32> {
        match self {
            PropertyValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::CharacterString(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectIdentifier> {
        match self {
            PropertyValue::ObjectId(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view used for COV increment comparisons.
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            PropertyValue::Unsigned(v) | PropertyValue::Enumerated(v) => Some(f64::from(*v)),
            PropertyValue::Signed(v) => Some(f64::from(*v)),
            PropertyValue::Real(v) => Some(f64::from(*v)),
            PropertyValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The kind tag this value carries.
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::Null => ValueKind::Null,
            PropertyValue::Boolean(_) => ValueKind::Boolean,
            PropertyValue::Unsigned(_) => ValueKind::Unsigned,
            PropertyValue::Signed(_) => ValueKind::Signed,
            PropertyValue::Real(_) => ValueKind::Real,
            PropertyValue::Double(_) => ValueKind::Double,
            PropertyValue::OctetString(_) => ValueKind::OctetString,
            PropertyValue::CharacterString(_) => ValueKind::CharacterString,
            PropertyValue::BitString(_) => ValueKind::BitString,
            PropertyValue::Enumerated(_) => ValueKind::Enumerated,
            PropertyValue::Date(_) => ValueKind::Date,
            PropertyValue::Time(_) => ValueKind::Time,
            PropertyValue::ObjectId(_) => ValueKind::ObjectId,
            PropertyValue::Array(_) => ValueKind::Array,
            PropertyValue::List(_) => ValueKind::List,
        }
    }
}

/// Semantic datatype of a property column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Boolean,
    Unsigned,
    Signed,
    Real,
    Double,
    OctetString,
    CharacterString,
    BitString,
    Enumerated,
    Date,
    Time,
    ObjectId,
    Array,
    List,
    /// Accepts any datatype (e.g. Present_Value of a value object).
    Any,
}

/// Access mode of a property column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    ReadOnly,
    ReadWrite,
    /// Writable only while Out_Of_Service is true (inputs' Present_Value).
    WriteWhenOutOfService,
}

/// One column of a per-type property table.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub kind: ValueKind,
    pub access: PropertyAccess,
    pub required: bool,
    pub default: Option<PropertyValue>,
}

impl PropertyDefinition {
    pub fn required(kind: ValueKind, access: PropertyAccess) -> Self {
        Self {
            kind,
            access,
            required: true,
            default: None,
        }
    }

    pub fn optional(kind: ValueKind, access: PropertyAccess) -> Self {
        Self {
            kind,
            access,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: PropertyValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Callback fired after a property value changes:
/// `(object, property, old, new)`. Runs synchronously inside the write.
pub type WriteHook =
    Arc<dyn Fn(ObjectIdentifier, PropertyIdentifier, &PropertyValue, &PropertyValue) + Send + Sync>;

/// Commandable-state: 16-slot priority array plus relinquish default.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandableState {
    pub priority_array: [Option<PropertyValue>; PRIORITY_SLOTS],
    pub relinquish_default: PropertyValue,
}

impl CommandableState {
    pub fn new(relinquish_default: PropertyValue) -> Self {
        Self {
            priority_array: Default::default(),
            relinquish_default,
        }
    }

    /// Effective present value: lowest-index non-null slot, else the
    /// relinquish default.
    pub fn effective_value(&self) -> PropertyValue {
        self.priority_array
            .iter()
            .flatten()
            .next()
            .cloned()
            .unwrap_or_else(|| self.relinquish_default.clone())
    }

    /// 1-based priority of the winning slot, if any.
    pub fn current_command_priority(&self) -> Option<u8> {
        self.priority_array
            .iter()
            .position(Option::is_some)
            .map(|index| index as u8 + 1)
    }
}

/// A BACnet object: identifier, property table, value store, and optional
/// commandable state.
pub struct BacnetObject {
    id: ObjectIdentifier,
    table: HashMap<PropertyIdentifier, PropertyDefinition>,
    values: HashMap<PropertyIdentifier, PropertyValue>,
    commandable: Option<CommandableState>,
    write_hook: Option<WriteHook>,
}

impl std::fmt::Debug for BacnetObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacnetObject")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("values", &self.values)
            .field("commandable", &self.commandable)
            .field("write_hook", &self.write_hook.is_some())
            .finish()
    }
}

impl PartialEq for BacnetObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.table == other.table
            && self.values == other.values
            && self.commandable == other.commandable
            && self.write_hook.is_some() == other.write_hook.is_some()
    }
}

impl BacnetObject {
    /// Assemble an object from its table and initial values. Per-type
    /// constructors in the submodules are the intended entry points.
    pub fn assemble(
        id: ObjectIdentifier,
        table: HashMap<PropertyIdentifier, PropertyDefinition>,
        values: HashMap<PropertyIdentifier, PropertyValue>,
        commandable: Option<CommandableState>,
    ) -> Self {
        Self {
            id,
            table,
            values,
            commandable,
            write_hook: None,
        }
    }

    pub fn identifier(&self) -> ObjectIdentifier {
        self.id
    }

    pub fn object_name(&self) -> String {
        self.values
            .get(&PropertyIdentifier::ObjectName)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn is_commandable(&self) -> bool {
        self.commandable.is_some()
    }

    /// Install the change callback; the database does this at registration
    /// and clears it at removal.
    pub fn set_write_hook(&mut self, hook: Option<WriteHook>) {
        self.write_hook = hook;
    }

    /// Properties present in this object's table.
    pub fn property_ids(&self) -> Vec<PropertyIdentifier> {
        let mut ids: Vec<PropertyIdentifier> = self.table.keys().copied().collect();
        ids.sort_by_key(PropertyIdentifier::code);
        ids
    }

    fn out_of_service(&self) -> bool {
        self.values
            .get(&PropertyIdentifier::OutOfService)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    fn polarity_reversed(&self) -> bool {
        matches!(
            self.id.object_type,
            ObjectType::BinaryInput | ObjectType::BinaryOutput
        ) && self
            .values
            .get(&PropertyIdentifier::Polarity)
            .and_then(PropertyValue::as_unsigned)
            == Some(polarity::REVERSE)
    }

    fn invert_binary(value: PropertyValue) -> PropertyValue {
        match value.as_unsigned() {
            Some(binary_pv::ACTIVE) => PropertyValue::Enumerated(binary_pv::INACTIVE),
            Some(binary_pv::INACTIVE) => PropertyValue::Enumerated(binary_pv::ACTIVE),
            _ => value,
        }
    }

    /// Status_Flags derived from event state, reliability, and
    /// out-of-service.
    fn status_flags(&self) -> StatusFlags {
        let mut flags = StatusFlags::empty();
        let event = self
            .values
            .get(&PropertyIdentifier::EventState)
            .and_then(PropertyValue::as_unsigned)
            .unwrap_or(event_state::NORMAL);
        if event != event_state::NORMAL {
            flags |= StatusFlags::IN_ALARM;
        }
        let reliability_value = self
            .values
            .get(&PropertyIdentifier::Reliability)
            .and_then(PropertyValue::as_unsigned)
            .unwrap_or(reliability::NO_FAULT_DETECTED);
        if reliability_value != reliability::NO_FAULT_DETECTED {
            flags |= StatusFlags::FAULT;
        }
        if self.out_of_service() {
            flags |= StatusFlags::OUT_OF_SERVICE;
        }
        flags
    }

    /// The effective present value, before polarity reversal.
    fn raw_present_value(&self) -> Option<PropertyValue> {
        match &self.commandable {
            Some(state) => Some(state.effective_value()),
            None => self.values.get(&PropertyIdentifier::PresentValue).cloned(),
        }
    }

    /// Read a property, resolving virtual properties and array indexing.
    pub fn read_property(
        &self,
        property: PropertyIdentifier,
        array_index: Option<u32>,
    ) -> Result<PropertyValue> {
        let value = self.read_whole_property(property)?;
        match array_index {
            None => Ok(value),
            Some(index) => match value {
                PropertyValue::Array(items) => index_array(&items, index),
                _ => Err(ObjectError::PropertyIsNotAnArray),
            },
        }
    }

    fn read_whole_property(&self, property: PropertyIdentifier) -> Result<PropertyValue> {
        match property {
            PropertyIdentifier::ObjectIdentifier => Ok(PropertyValue::ObjectId(self.id)),
            PropertyIdentifier::ObjectType => {
                Ok(PropertyValue::Enumerated(u32::from(self.id.object_type.code())))
            }
            PropertyIdentifier::PropertyList => {
                // Clause 12: excludes the identification properties and
                // itself.
                let excluded = [
                    PropertyIdentifier::ObjectIdentifier,
                    PropertyIdentifier::ObjectName,
                    PropertyIdentifier::ObjectType,
                    PropertyIdentifier::PropertyList,
                ];
                let items = self
                    .property_ids()
                    .into_iter()
                    .filter(|id| !excluded.contains(id))
                    .map(|id| PropertyValue::Enumerated(id.code()))
                    .collect();
                Ok(PropertyValue::Array(items))
            }
            PropertyIdentifier::StatusFlags if self.table.contains_key(&property) => {
                Ok(PropertyValue::BitString(self.status_flags().to_bit_string()))
            }
            PropertyIdentifier::PresentValue => {
                let value = self
                    .raw_present_value()
                    .ok_or(ObjectError::UnknownProperty)?;
                if self.polarity_reversed() {
                    Ok(Self::invert_binary(value))
                } else {
                    Ok(value)
                }
            }
            PropertyIdentifier::PriorityArray => {
                let state = self
                    .commandable
                    .as_ref()
                    .ok_or(ObjectError::UnknownProperty)?;
                Ok(PropertyValue::Array(
                    state
                        .priority_array
                        .iter()
                        .map(|slot| slot.clone().unwrap_or(PropertyValue::Null))
                        .collect(),
                ))
            }
            PropertyIdentifier::RelinquishDefault => {
                let state = self
                    .commandable
                    .as_ref()
                    .ok_or(ObjectError::UnknownProperty)?;
                Ok(state.relinquish_default.clone())
            }
            PropertyIdentifier::CurrentCommandPriority => {
                let state = self
                    .commandable
                    .as_ref()
                    .ok_or(ObjectError::UnknownProperty)?;
                Ok(state
                    .current_command_priority()
                    .map(|p| PropertyValue::Unsigned(u32::from(p)))
                    .unwrap_or(PropertyValue::Null))
            }
            _ => {
                let definition = self.table.get(&property).ok_or(ObjectError::UnknownProperty)?;
                self.values
                    .get(&property)
                    .cloned()
                    .or_else(|| definition.default.clone())
                    .ok_or(ObjectError::UnknownProperty)
            }
        }
    }

    /// Write a property. `priority` applies to commandable Present_Value
    /// writes (default 16); `None` as the value relinquishes that slot.
    pub fn write_property(
        &mut self,
        property: PropertyIdentifier,
        value: PropertyValue,
        priority: Option<u8>,
        array_index: Option<u32>,
    ) -> Result<()> {
        let definition = self
            .table
            .get(&property)
            .ok_or(ObjectError::UnknownProperty)?
            .clone();

        match definition.access {
            PropertyAccess::ReadWrite => {}
            PropertyAccess::WriteWhenOutOfService => {
                if !self.out_of_service() {
                    return Err(ObjectError::WriteAccessDenied);
                }
            }
            PropertyAccess::ReadOnly => return Err(ObjectError::WriteAccessDenied),
        }

        let value = coerce_value(&definition.kind, value, self.commandable.is_some(), property)?;
        self.validate_domain(property, &value)?;

        if property == PropertyIdentifier::PresentValue && self.commandable.is_some() {
            let priority = priority.unwrap_or(16);
            if !(1..=16).contains(&priority) {
                return Err(ObjectError::InvalidParameter("priority out of range"));
            }
            let (old, new) = {
                let state = self.commandable.as_mut().expect("checked commandable");
                let old = state.effective_value();
                state.priority_array[usize::from(priority) - 1] =
                    if value.is_null() { None } else { Some(value) };
                (old, state.effective_value())
            };
            if old != new {
                self.fire_hook(property, &old, &new);
            }
            return Ok(());
        }

        if let Some(index) = array_index {
            let old_item = {
                let current = self
                    .values
                    .get_mut(&property)
                    .ok_or(ObjectError::UnknownProperty)?;
                let PropertyValue::Array(items) = current else {
                    return Err(ObjectError::PropertyIsNotAnArray);
                };
                if index == 0 || index as usize > items.len() {
                    return Err(ObjectError::InvalidArrayIndex);
                }
                let old_item = items[index as usize - 1].clone();
                items[index as usize - 1] = value.clone();
                old_item
            };
            if old_item != value {
                self.fire_hook(property, &old_item, &value);
            }
            return Ok(());
        }

        let old = self.values.insert(property, value.clone());
        let old = old.unwrap_or(PropertyValue::Null);
        if old != value {
            self.fire_hook(property, &old, &value);
        }
        Ok(())
    }

    fn fire_hook(&self, property: PropertyIdentifier, old: &PropertyValue, new: &PropertyValue) {
        if let Some(hook) = &self.write_hook {
            hook(self.id, property, old, new);
        }
    }

    /// Type-specific range and consistency checks.
    fn validate_domain(
        &self,
        property: PropertyIdentifier,
        value: &PropertyValue,
    ) -> Result<()> {
        match property {
            PropertyIdentifier::CovIncrement => {
                if value.as_real().is_some_and(|v| v < 0.0) {
                    return Err(ObjectError::ValueOutOfRange);
                }
            }
            PropertyIdentifier::NumberOfStates => {
                if value.as_unsigned().is_some_and(|v| v < 1) {
                    return Err(ObjectError::ValueOutOfRange);
                }
            }
            PropertyIdentifier::PresentValue => {
                if let Some(v) = value.as_real() {
                    let min = self
                        .values
                        .get(&PropertyIdentifier::MinPresValue)
                        .and_then(PropertyValue::as_real);
                    let max = self
                        .values
                        .get(&PropertyIdentifier::MaxPresValue)
                        .and_then(PropertyValue::as_real);
                    if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) {
                        return Err(ObjectError::ValueOutOfRange);
                    }
                }
                if matches!(
                    self.id.object_type,
                    ObjectType::MultiStateInput
                        | ObjectType::MultiStateOutput
                        | ObjectType::MultiStateValue
                ) {
                    if let Some(v) = value.as_unsigned() {
                        let states = self
                            .values
                            .get(&PropertyIdentifier::NumberOfStates)
                            .and_then(PropertyValue::as_unsigned)
                            .unwrap_or(u32::MAX);
                        if v < 1 || v > states {
                            return Err(ObjectError::ValueOutOfRange);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Array-index semantics shared by reads: 0 is the length, 1..=N the
/// elements.
pub(crate) fn index_array(items: &[PropertyValue], index: u32) -> Result<PropertyValue> {
    if index == 0 {
        return Ok(PropertyValue::Unsigned(items.len() as u32));
    }
    items
        .get(index as usize - 1)
        .cloned()
        .ok_or(ObjectError::InvalidArrayIndex)
}

/// Type-check a candidate value against a column's declared kind, coercing
/// wire integers into enumerated columns and admitting Null for
/// commandable relinquish.
fn coerce_value(
    kind: &ValueKind,
    value: PropertyValue,
    commandable: bool,
    property: PropertyIdentifier,
) -> Result<PropertyValue> {
    if value.is_null() && commandable && property == PropertyIdentifier::PresentValue {
        return Ok(value);
    }
    let actual = value.kind();
    let ok = match kind {
        ValueKind::Any => true,
        ValueKind::Enumerated => matches!(actual, ValueKind::Enumerated | ValueKind::Unsigned),
        ValueKind::Unsigned => matches!(actual, ValueKind::Unsigned | ValueKind::Enumerated),
        other => actual == *other,
    };
    if !ok {
        return Err(ObjectError::InvalidDataType);
    }
    let coerced = match (kind, value) {
        (ValueKind::Enumerated, PropertyValue::Unsigned(v)) => PropertyValue::Enumerated(v),
        (ValueKind::Unsigned, PropertyValue::Enumerated(v)) => PropertyValue::Unsigned(v),
        (_, v) => v,
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_identifier_packing() {
        let id = ObjectIdentifier::new(ObjectType::AnalogValue, 1234);
        assert_eq!(id.to_raw(), (2 << 22) | 1234);
        assert_eq!(ObjectIdentifier::from_raw(id.to_raw()), id);

        let vendor = ObjectIdentifier::new(ObjectType::Other(513), 7);
        assert_eq!(ObjectIdentifier::from_raw(vendor.to_raw()), vendor);
    }

    #[test]
    fn instance_range() {
        assert!(ObjectIdentifier::new(ObjectType::Device, MAX_INSTANCE).is_valid());
        assert!(!ObjectIdentifier::new(ObjectType::Device, ANY_INSTANCE).is_valid());
    }

    #[test]
    fn bit_string_round_trip() {
        let bits = BitString::from_bits(&[true, false, true, true]);
        assert_eq!(bits.unused_bits, 4);
        assert_eq!(bits.data, vec![0b1011_0000]);
        assert!(bits.bit(0));
        assert!(!bits.bit(1));
        assert!(bits.bit(3));
        assert_eq!(bits.len(), 4);
    }

    #[test]
    fn status_flags_encoding() {
        let flags = StatusFlags::FAULT | StatusFlags::OUT_OF_SERVICE;
        let bits = flags.to_bit_string();
        assert_eq!(bits.data, vec![0x50]);
        assert_eq!(bits.unused_bits, 4);
    }

    #[test]
    fn commandable_priority_ordering() {
        let mut state = CommandableState::new(PropertyValue::Real(72.0));
        assert_eq!(state.effective_value(), PropertyValue::Real(72.0));
        assert_eq!(state.current_command_priority(), None);

        state.priority_array[7] = Some(PropertyValue::Real(50.0));
        assert_eq!(state.effective_value(), PropertyValue::Real(50.0));
        assert_eq!(state.current_command_priority(), Some(8));

        state.priority_array[3] = Some(PropertyValue::Real(30.0));
        assert_eq!(state.effective_value(), PropertyValue::Real(30.0));
        assert_eq!(state.current_command_priority(), Some(4));

        state.priority_array[3] = None;
        assert_eq!(state.effective_value(), PropertyValue::Real(50.0));
        assert_eq!(state.current_command_priority(), Some(8));
    }

    #[test]
    fn property_identifier_codes_round_trip() {
        for property in [
            PropertyIdentifier::PresentValue,
            PropertyIdentifier::ObjectName,
            PropertyIdentifier::PriorityArray,
            PropertyIdentifier::CurrentCommandPriority,
            PropertyIdentifier::PropertyList,
            PropertyIdentifier::Other(9999),
        ] {
            assert_eq!(PropertyIdentifier::from_code(property.code()), property);
        }
    }

    #[test]
    fn value_coercion() {
        // Wire integers land in enumerated columns.
        let coerced = coerce_value(
            &ValueKind::Enumerated,
            PropertyValue::Unsigned(1),
            false,
            PropertyIdentifier::PresentValue,
        )
        .unwrap();
        assert_eq!(coerced, PropertyValue::Enumerated(1));

        assert_eq!(
            coerce_value(
                &ValueKind::Real,
                PropertyValue::CharacterString("nope".into()),
                false,
                PropertyIdentifier::PresentValue,
            ),
            Err(ObjectError::InvalidDataType)
        );
    }
}
