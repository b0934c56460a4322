//! Cross-layer error taxonomy.
//!
//! A single family of error types crosses all layers of the stack:
//!
//! - [`BacnetError`] mirrors the wire Error PDU (error class + error code)
//!   and is raised by object/property operations and service handlers.
//! - [`RejectReason`] and [`AbortReason`] mirror the Reject and Abort PDUs.
//! - [`Error`] is the top-level type surfaced to client-API callers, folding
//!   in local timeouts and transport failures.
//!
//! Codec errors ([`crate::encoding::EncodingError`]) never become protocol
//! responses; inbound frames that fail to decode are dropped and logged.

use thiserror::Error;

/// BACnet error classes per ASHRAE 135 Clause 18.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorClass {
    Device = 0,
    Object = 1,
    Property = 2,
    Resources = 3,
    Security = 4,
    Services = 5,
    Vt = 6,
    Communication = 7,
}

impl TryFrom<u16> for ErrorClass {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            0 => Ok(ErrorClass::Device),
            1 => Ok(ErrorClass::Object),
            2 => Ok(ErrorClass::Property),
            3 => Ok(ErrorClass::Resources),
            4 => Ok(ErrorClass::Security),
            5 => Ok(ErrorClass::Services),
            6 => Ok(ErrorClass::Vt),
            7 => Ok(ErrorClass::Communication),
            other => Err(other),
        }
    }
}

/// BACnet error codes per ASHRAE 135 Clause 18 (subset used by the core).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Other = 0,
    ConfigurationInProgress = 2,
    DeviceBusy = 3,
    DynamicCreationNotSupported = 4,
    InconsistentParameters = 7,
    InvalidDataType = 9,
    MissingRequiredParameter = 16,
    NoSpaceForObject = 18,
    NoSpaceToWriteProperty = 20,
    ObjectDeletionNotPermitted = 23,
    ObjectIdentifierAlreadyExists = 24,
    OperationalProblem = 25,
    ReadAccessDenied = 27,
    ServiceRequestDenied = 29,
    Timeout = 30,
    UnknownObject = 31,
    UnknownProperty = 32,
    UnsupportedObjectType = 36,
    ValueOutOfRange = 37,
    WriteAccessDenied = 40,
    CharacterSetNotSupported = 41,
    InvalidArrayIndex = 42,
    CovSubscriptionFailed = 43,
    NotCovProperty = 44,
    OptionalFunctionalityNotSupported = 45,
    DatatypeNotSupported = 47,
    DuplicateName = 48,
    DuplicateObjectId = 49,
    PropertyIsNotAnArray = 50,
    AbortByOther = 56,
    RejectByOther = 69,
    UnknownDevice = 70,
    UnknownRoute = 71,
}

impl TryFrom<u16> for ErrorCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            0 => Ok(ErrorCode::Other),
            2 => Ok(ErrorCode::ConfigurationInProgress),
            3 => Ok(ErrorCode::DeviceBusy),
            4 => Ok(ErrorCode::DynamicCreationNotSupported),
            7 => Ok(ErrorCode::InconsistentParameters),
            9 => Ok(ErrorCode::InvalidDataType),
            16 => Ok(ErrorCode::MissingRequiredParameter),
            18 => Ok(ErrorCode::NoSpaceForObject),
            20 => Ok(ErrorCode::NoSpaceToWriteProperty),
            23 => Ok(ErrorCode::ObjectDeletionNotPermitted),
            24 => Ok(ErrorCode::ObjectIdentifierAlreadyExists),
            25 => Ok(ErrorCode::OperationalProblem),
            27 => Ok(ErrorCode::ReadAccessDenied),
            29 => Ok(ErrorCode::ServiceRequestDenied),
            30 => Ok(ErrorCode::Timeout),
            31 => Ok(ErrorCode::UnknownObject),
            32 => Ok(ErrorCode::UnknownProperty),
            36 => Ok(ErrorCode::UnsupportedObjectType),
            37 => Ok(ErrorCode::ValueOutOfRange),
            40 => Ok(ErrorCode::WriteAccessDenied),
            41 => Ok(ErrorCode::CharacterSetNotSupported),
            42 => Ok(ErrorCode::InvalidArrayIndex),
            43 => Ok(ErrorCode::CovSubscriptionFailed),
            44 => Ok(ErrorCode::NotCovProperty),
            45 => Ok(ErrorCode::OptionalFunctionalityNotSupported),
            47 => Ok(ErrorCode::DatatypeNotSupported),
            48 => Ok(ErrorCode::DuplicateName),
            49 => Ok(ErrorCode::DuplicateObjectId),
            50 => Ok(ErrorCode::PropertyIsNotAnArray),
            56 => Ok(ErrorCode::AbortByOther),
            69 => Ok(ErrorCode::RejectByOther),
            70 => Ok(ErrorCode::UnknownDevice),
            71 => Ok(ErrorCode::UnknownRoute),
            other => Err(other),
        }
    }
}

/// A protocol-level error, mirroring the wire Error PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("BACnet error: class {class:?}, code {code:?}")]
pub struct BacnetError {
    pub class: ErrorClass,
    pub code: ErrorCode,
}

impl BacnetError {
    pub fn new(class: ErrorClass, code: ErrorCode) -> Self {
        Self { class, code }
    }

    /// Build from raw wire values, falling back to `Other` for codes this
    /// core does not enumerate.
    pub fn from_raw(class: u16, code: u16) -> Self {
        let class = ErrorClass::try_from(class).unwrap_or(ErrorClass::Device);
        let code = ErrorCode::try_from(code).unwrap_or(ErrorCode::Other);
        Self { class, code }
    }
}

/// Reasons a peer may reject a confirmed request. Not retriable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    Other = 0,
    BufferOverflow = 1,
    InconsistentParameters = 2,
    InvalidParameterDataType = 3,
    InvalidTag = 4,
    MissingRequiredParameter = 5,
    ParameterOutOfRange = 6,
    TooManyArguments = 7,
    UndefinedEnumeration = 8,
    UnrecognizedService = 9,
}

impl From<u8> for RejectReason {
    fn from(value: u8) -> Self {
        match value {
            1 => RejectReason::BufferOverflow,
            2 => RejectReason::InconsistentParameters,
            3 => RejectReason::InvalidParameterDataType,
            4 => RejectReason::InvalidTag,
            5 => RejectReason::MissingRequiredParameter,
            6 => RejectReason::ParameterOutOfRange,
            7 => RejectReason::TooManyArguments,
            8 => RejectReason::UndefinedEnumeration,
            9 => RejectReason::UnrecognizedService,
            _ => RejectReason::Other,
        }
    }
}

/// Reasons a transaction may be aborted. Some are retriable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
}

impl From<u8> for AbortReason {
    fn from(value: u8) -> Self {
        match value {
            1 => AbortReason::BufferOverflow,
            2 => AbortReason::InvalidApduInThisState,
            3 => AbortReason::PreemptedByHigherPriorityTask,
            4 => AbortReason::SegmentationNotSupported,
            5 => AbortReason::SecurityError,
            6 => AbortReason::InsufficientSecurity,
            7 => AbortReason::WindowSizeOutOfRange,
            8 => AbortReason::ApplicationExceededReplyTime,
            9 => AbortReason::OutOfResources,
            10 => AbortReason::TsmTimeout,
            11 => AbortReason::ApduTooLong,
            _ => AbortReason::Other,
        }
    }
}

/// Top-level error surfaced by the client API.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer answered with an Error PDU.
    #[error(transparent)]
    Bacnet(#[from] BacnetError),

    /// The peer rejected the request.
    #[error("request rejected: {0:?}")]
    Reject(RejectReason),

    /// The transaction was aborted.
    #[error("transaction aborted: {reason:?} (by_server={by_server})")]
    Abort { reason: AbortReason, by_server: bool },

    /// Local expiry after all retries.
    #[error("request timed out")]
    Timeout,

    /// Segment exchange stalled past the segment timeout.
    #[error("segmentation timed out")]
    SegmentationTimeout,

    /// Unrecoverable socket or connection failure.
    #[error("transport error: {0}")]
    Transport(#[from] crate::datalink::DataLinkError),

    /// Malformed data produced locally (never raised for peer frames).
    #[error("codec error: {0}")]
    Codec(#[from] crate::encoding::EncodingError),

    /// The request could not be routed or addressed.
    #[error("network error: {0}")]
    Network(#[from] crate::network::NetworkError),

    /// Local object database rejected the operation.
    #[error("object error: {0}")]
    Object(#[from] crate::object::ObjectError),

    /// Invalid configuration supplied by the caller.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result alias for fallible stack operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_round_trip() {
        for raw in 0..8u16 {
            let class = ErrorClass::try_from(raw).unwrap();
            assert_eq!(class as u16, raw);
        }
        assert!(ErrorClass::try_from(8).is_err());
    }

    #[test]
    fn error_code_fallback() {
        let err = BacnetError::from_raw(2, 9999);
        assert_eq!(err.class, ErrorClass::Property);
        assert_eq!(err.code, ErrorCode::Other);
    }

    #[test]
    fn reject_reason_from_raw() {
        assert_eq!(RejectReason::from(4), RejectReason::InvalidTag);
        assert_eq!(RejectReason::from(200), RejectReason::Other);
    }

    #[test]
    fn abort_reason_from_raw() {
        assert_eq!(AbortReason::from(4), AbortReason::SegmentationNotSupported);
        assert_eq!(AbortReason::from(200), AbortReason::Other);
    }
}
