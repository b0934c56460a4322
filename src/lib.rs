#![doc = include_str!("../README.md")]

pub mod app;
pub mod datalink;
pub mod encoding;
pub mod error;
pub mod network;
pub mod object;
pub mod service;
pub mod transaction;

// Re-export main types without glob imports to avoid conflicts
pub use app::{Application, DeviceConfig, LinkConfig, RouterConfig};
pub use datalink::{DataLinkError, Transport};
pub use encoding::{ApplicationTag, EncodingError};
pub use error::{AbortReason, BacnetError, Error, ErrorClass, ErrorCode, RejectReason};
pub use network::address::BacnetAddress;
pub use object::{BacnetObject, ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyValue};
pub use service::{ConfirmedServiceChoice, UnconfirmedServiceChoice};

/// NPDU protocol version carried by every frame.
pub const BACNET_PROTOCOL_VERSION: u8 = 1;

/// Protocol revision reported by the Device object.
pub const BACNET_PROTOCOL_REVISION: u32 = 19;

/// Largest APDU on ISO 8802-3 and B/IP links.
pub const BACNET_MAX_APDU: usize = 1476;

/// Largest NPDU on B/IP links (MTU minus BVLL framing).
pub const BACNET_MAX_NPDU: usize = 1497;

#[cfg(test)]
mod tests {
    use crate::encoding::ApplicationTag;
    use crate::object::{ObjectIdentifier, ObjectType};

    #[test]
    fn re_exported_types_line_up() {
        assert_eq!(ApplicationTag::Boolean as u8, 1);
        assert_eq!(ObjectType::AnalogInput.code(), 0);

        let id = ObjectIdentifier::new(ObjectType::Device, 123);
        assert_eq!(id.instance, 123);
        assert!(id.is_valid());
    }

    #[test]
    fn protocol_constants() {
        assert_eq!(super::BACNET_PROTOCOL_VERSION, 1);
        assert!(super::BACNET_MAX_NPDU > super::BACNET_MAX_APDU);
    }
}
