//! Device object (Clause 12.11).
//!
//! One per database. Object_List and Database_Revision are virtual
//! properties answered by the [`ObjectDatabase`](super::database); the
//! object itself carries the static identification and protocol columns.

use std::collections::HashMap;

use super::{
    BacnetObject, Date, ObjectIdentifier, ObjectType, PropertyAccess, PropertyDefinition,
    PropertyIdentifier, PropertyValue, Time, ValueKind,
};

/// Device system status values.
pub mod device_status {
    pub const OPERATIONAL: u32 = 0;
    pub const OPERATIONAL_READ_ONLY: u32 = 1;
    pub const DOWNLOAD_REQUIRED: u32 = 2;
    pub const DOWNLOAD_IN_PROGRESS: u32 = 3;
    pub const NON_OPERATIONAL: u32 = 4;
    pub const BACKUP_IN_PROGRESS: u32 = 5;
}

/// Segmentation support values.
pub mod segmentation {
    pub const BOTH: u32 = 0;
    pub const TRANSMIT: u32 = 1;
    pub const RECEIVE: u32 = 2;
    pub const NONE: u32 = 3;
}

/// Static identity of the local device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub instance: u32,
    pub name: String,
    pub vendor_name: String,
    pub vendor_identifier: u32,
    pub model_name: String,
    pub firmware_revision: String,
    pub application_software_version: String,
    pub max_apdu_length: u32,
    pub apdu_timeout_ms: u32,
    pub apdu_retries: u32,
}

impl DeviceInfo {
    pub fn new(instance: u32, name: &str) -> Self {
        Self {
            instance,
            name: name.to_string(),
            vendor_name: "bacstack".to_string(),
            vendor_identifier: 999,
            model_name: "bacstack device".to_string(),
            firmware_revision: env!("CARGO_PKG_VERSION").to_string(),
            application_software_version: env!("CARGO_PKG_VERSION").to_string(),
            max_apdu_length: 1476,
            apdu_timeout_ms: 3000,
            apdu_retries: 3,
        }
    }
}

fn device_table() -> HashMap<PropertyIdentifier, PropertyDefinition> {
    HashMap::from([
        (
            PropertyIdentifier::ObjectIdentifier,
            PropertyDefinition::required(ValueKind::ObjectId, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ObjectName,
            PropertyDefinition::required(ValueKind::CharacterString, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::ObjectType,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::SystemStatus,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::VendorName,
            PropertyDefinition::required(ValueKind::CharacterString, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::VendorIdentifier,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ModelName,
            PropertyDefinition::required(ValueKind::CharacterString, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::FirmwareRevision,
            PropertyDefinition::required(ValueKind::CharacterString, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ApplicationSoftwareVersion,
            PropertyDefinition::required(ValueKind::CharacterString, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ProtocolVersion,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ProtocolRevision,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ObjectList,
            PropertyDefinition::required(ValueKind::Array, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::MaxApduLengthAccepted,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::SegmentationSupported,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::ApduTimeout,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::NumberOfApduRetries,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::DeviceAddressBinding,
            PropertyDefinition::required(ValueKind::List, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::DatabaseRevision,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::PropertyList,
            PropertyDefinition::required(ValueKind::Array, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::Description,
            PropertyDefinition::optional(ValueKind::CharacterString, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::LocalDate,
            PropertyDefinition::optional(ValueKind::Date, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::LocalTime,
            PropertyDefinition::optional(ValueKind::Time, PropertyAccess::ReadOnly),
        ),
    ])
}

impl BacnetObject {
    /// The local Device object.
    pub fn device(info: &DeviceInfo) -> Self {
        let id = ObjectIdentifier::new(ObjectType::Device, info.instance);
        let values = HashMap::from([
            (
                PropertyIdentifier::ObjectName,
                PropertyValue::CharacterString(info.name.clone()),
            ),
            (
                PropertyIdentifier::SystemStatus,
                PropertyValue::Enumerated(device_status::OPERATIONAL),
            ),
            (
                PropertyIdentifier::VendorName,
                PropertyValue::CharacterString(info.vendor_name.clone()),
            ),
            (
                PropertyIdentifier::VendorIdentifier,
                PropertyValue::Unsigned(info.vendor_identifier),
            ),
            (
                PropertyIdentifier::ModelName,
                PropertyValue::CharacterString(info.model_name.clone()),
            ),
            (
                PropertyIdentifier::FirmwareRevision,
                PropertyValue::CharacterString(info.firmware_revision.clone()),
            ),
            (
                PropertyIdentifier::ApplicationSoftwareVersion,
                PropertyValue::CharacterString(info.application_software_version.clone()),
            ),
            (
                PropertyIdentifier::ProtocolVersion,
                PropertyValue::Unsigned(u32::from(crate::BACNET_PROTOCOL_VERSION)),
            ),
            (
                PropertyIdentifier::ProtocolRevision,
                PropertyValue::Unsigned(crate::BACNET_PROTOCOL_REVISION),
            ),
            (
                PropertyIdentifier::MaxApduLengthAccepted,
                PropertyValue::Unsigned(info.max_apdu_length),
            ),
            (
                PropertyIdentifier::SegmentationSupported,
                PropertyValue::Enumerated(segmentation::BOTH),
            ),
            (
                PropertyIdentifier::ApduTimeout,
                PropertyValue::Unsigned(info.apdu_timeout_ms),
            ),
            (
                PropertyIdentifier::NumberOfApduRetries,
                PropertyValue::Unsigned(info.apdu_retries),
            ),
            (
                PropertyIdentifier::DeviceAddressBinding,
                PropertyValue::List(Vec::new()),
            ),
            (PropertyIdentifier::LocalDate, PropertyValue::Date(Date::today())),
            (PropertyIdentifier::LocalTime, PropertyValue::Time(Time::now())),
        ]);
        Self::assemble(id, device_table(), values, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identity_properties() {
        let device = BacnetObject::device(&DeviceInfo::new(1234, "controller-1"));
        assert_eq!(
            device.read_property(PropertyIdentifier::ObjectIdentifier, None).unwrap(),
            PropertyValue::ObjectId(ObjectIdentifier::new(ObjectType::Device, 1234))
        );
        assert_eq!(
            device.read_property(PropertyIdentifier::ObjectName, None).unwrap(),
            PropertyValue::CharacterString("controller-1".into())
        );
        assert_eq!(
            device.read_property(PropertyIdentifier::SegmentationSupported, None).unwrap(),
            PropertyValue::Enumerated(segmentation::BOTH)
        );
    }

    #[test]
    fn vendor_defaults_are_writable_in_info() {
        let mut info = DeviceInfo::new(9, "d");
        info.vendor_identifier = 42;
        info.vendor_name = "acme controls".into();
        let device = BacnetObject::device(&info);
        assert_eq!(
            device.read_property(PropertyIdentifier::VendorIdentifier, None).unwrap(),
            PropertyValue::Unsigned(42)
        );
    }
}
