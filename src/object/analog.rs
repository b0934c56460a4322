//! Analog object types (Clause 12.2-12.4).
//!
//! Analog Input, Analog Output, and Analog Value represent continuous
//! quantities. Outputs are always commandable; values opt in at
//! construction.

use std::collections::HashMap;

use super::{
    event_state, reliability, BacnetObject, CommandableState, ObjectIdentifier, ObjectType,
    PropertyAccess, PropertyDefinition, PropertyIdentifier, PropertyValue, ValueKind,
};

/// Engineering units (Clause 21, subset).
pub mod units {
    pub const NO_UNITS: u32 = 95;
    pub const PERCENT: u32 = 98;
    pub const DEGREES_CELSIUS: u32 = 62;
    pub const DEGREES_FAHRENHEIT: u32 = 64;
    pub const VOLTS: u32 = 5;
    pub const AMPERES: u32 = 2;
    pub const WATTS: u32 = 47;
    pub const KILOWATTS: u32 = 48;
    pub const PASCALS: u32 = 53;
    pub const KILOPASCALS: u32 = 54;
    pub const LITERS_PER_SECOND: u32 = 126;
}

fn analog_table(
    object_type: ObjectType,
    commandable: bool,
) -> HashMap<PropertyIdentifier, PropertyDefinition> {
    let pv_access = if object_type.is_input() {
        PropertyAccess::WriteWhenOutOfService
    } else {
        PropertyAccess::ReadWrite
    };
    let mut table = HashMap::from([
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
            PropertyIdentifier::PresentValue,
            PropertyDefinition::required(ValueKind::Real, pv_access),
        ),
        (
            PropertyIdentifier::StatusFlags,
            PropertyDefinition::required(ValueKind::BitString, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::EventState,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadOnly),
        ),
        (
            PropertyIdentifier::OutOfService,
            PropertyDefinition::required(ValueKind::Boolean, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::Units,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadWrite),
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
            PropertyIdentifier::Reliability,
            PropertyDefinition::optional(ValueKind::Enumerated, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::CovIncrement,
            PropertyDefinition::optional(ValueKind::Real, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::MinPresValue,
            PropertyDefinition::optional(ValueKind::Real, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::MaxPresValue,
            PropertyDefinition::optional(ValueKind::Real, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::Resolution,
            PropertyDefinition::optional(ValueKind::Real, PropertyAccess::ReadOnly),
        ),
    ]);
    if commandable {
        table.insert(
            PropertyIdentifier::PriorityArray,
            PropertyDefinition::required(ValueKind::Array, PropertyAccess::ReadOnly),
        );
        table.insert(
            PropertyIdentifier::RelinquishDefault,
            PropertyDefinition::required(ValueKind::Real, PropertyAccess::ReadWrite),
        );
        table.insert(
            PropertyIdentifier::CurrentCommandPriority,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        );
    }
    table
}

fn analog_values(name: &str, units: u32) -> HashMap<PropertyIdentifier, PropertyValue> {
    HashMap::from([
        (
            PropertyIdentifier::ObjectName,
            PropertyValue::CharacterString(name.to_string()),
        ),
        (
            PropertyIdentifier::EventState,
            PropertyValue::Enumerated(event_state::NORMAL),
        ),
        (
            PropertyIdentifier::Reliability,
            PropertyValue::Enumerated(reliability::NO_FAULT_DETECTED),
        ),
        (PropertyIdentifier::OutOfService, PropertyValue::Boolean(false)),
        (PropertyIdentifier::Units, PropertyValue::Enumerated(units)),
    ])
}

impl BacnetObject {
    /// Analog Input: sensor-backed, writable only when out of service.
    pub fn analog_input(instance: u32, name: &str, units: u32) -> Self {
        let id = ObjectIdentifier::new(ObjectType::AnalogInput, instance);
        let mut values = analog_values(name, units);
        values.insert(PropertyIdentifier::PresentValue, PropertyValue::Real(0.0));
        Self::assemble(id, analog_table(ObjectType::AnalogInput, false), values, None)
    }

    /// Analog Output: always commandable.
    pub fn analog_output(instance: u32, name: &str, units: u32, relinquish_default: f32) -> Self {
        let id = ObjectIdentifier::new(ObjectType::AnalogOutput, instance);
        Self::assemble(
            id,
            analog_table(ObjectType::AnalogOutput, true),
            analog_values(name, units),
            Some(CommandableState::new(PropertyValue::Real(relinquish_default))),
        )
    }

    /// Analog Value; commandable when `relinquish_default` is given.
    pub fn analog_value(
        instance: u32,
        name: &str,
        units: u32,
        relinquish_default: Option<f32>,
    ) -> Self {
        let id = ObjectIdentifier::new(ObjectType::AnalogValue, instance);
        let commandable = relinquish_default
            .map(|default| CommandableState::new(PropertyValue::Real(default)));
        let mut values = analog_values(name, units);
        if commandable.is_none() {
            values.insert(PropertyIdentifier::PresentValue, PropertyValue::Real(0.0));
        }
        Self::assemble(
            id,
            analog_table(ObjectType::AnalogValue, commandable.is_some()),
            values,
            commandable,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectError;

    #[test]
    fn commandable_analog_value_priority_sequence() {
        // Relinquish default 72.0; write 50 @ 8, 30 @ 4, relinquish 4.
        let mut av = BacnetObject::analog_value(1, "av-1", units::DEGREES_CELSIUS, Some(72.0));

        assert_eq!(
            av.read_property(PropertyIdentifier::PresentValue, None).unwrap(),
            PropertyValue::Real(72.0)
        );
        assert_eq!(
            av.read_property(PropertyIdentifier::CurrentCommandPriority, None).unwrap(),
            PropertyValue::Null
        );

        av.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(50.0), Some(8), None)
            .unwrap();
        assert_eq!(
            av.read_property(PropertyIdentifier::PresentValue, None).unwrap(),
            PropertyValue::Real(50.0)
        );
        assert_eq!(
            av.read_property(PropertyIdentifier::CurrentCommandPriority, None).unwrap(),
            PropertyValue::Unsigned(8)
        );

        av.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(30.0), Some(4), None)
            .unwrap();
        assert_eq!(
            av.read_property(PropertyIdentifier::PresentValue, None).unwrap(),
            PropertyValue::Real(30.0)
        );
        assert_eq!(
            av.read_property(PropertyIdentifier::CurrentCommandPriority, None).unwrap(),
            PropertyValue::Unsigned(4)
        );

        av.write_property(PropertyIdentifier::PresentValue, PropertyValue::Null, Some(4), None)
            .unwrap();
        assert_eq!(
            av.read_property(PropertyIdentifier::PresentValue, None).unwrap(),
            PropertyValue::Real(50.0)
        );
        assert_eq!(
            av.read_property(PropertyIdentifier::CurrentCommandPriority, None).unwrap(),
            PropertyValue::Unsigned(8)
        );
    }

    #[test]
    fn same_priority_later_write_wins() {
        let mut ao = BacnetObject::analog_output(3, "ao-3", units::PERCENT, 0.0);
        ao.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(10.0), Some(8), None)
            .unwrap();
        ao.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(20.0), Some(8), None)
            .unwrap();
        assert_eq!(
            ao.read_property(PropertyIdentifier::PresentValue, None).unwrap(),
            PropertyValue::Real(20.0)
        );
    }

    #[test]
    fn priority_array_reads_with_nulls() {
        let mut ao = BacnetObject::analog_output(1, "ao-1", units::PERCENT, 0.0);
        ao.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(5.0), Some(3), None)
            .unwrap();

        let array = ao.read_property(PropertyIdentifier::PriorityArray, None).unwrap();
        let PropertyValue::Array(slots) = array else {
            panic!("priority array must read as an array");
        };
        assert_eq!(slots.len(), 16);
        assert_eq!(slots[2], PropertyValue::Real(5.0));
        assert_eq!(slots[0], PropertyValue::Null);

        // Array indexing: 0 is the length, 3 the third slot.
        assert_eq!(
            ao.read_property(PropertyIdentifier::PriorityArray, Some(0)).unwrap(),
            PropertyValue::Unsigned(16)
        );
        assert_eq!(
            ao.read_property(PropertyIdentifier::PriorityArray, Some(3)).unwrap(),
            PropertyValue::Real(5.0)
        );
        assert_eq!(
            ao.read_property(PropertyIdentifier::PriorityArray, Some(17)),
            Err(ObjectError::InvalidArrayIndex)
        );
        assert_eq!(
            ao.read_property(PropertyIdentifier::PresentValue, Some(1)),
            Err(ObjectError::PropertyIsNotAnArray)
        );
    }

    #[test]
    fn input_present_value_guarded_by_out_of_service() {
        let mut ai = BacnetObject::analog_input(2, "ai-2", units::DEGREES_CELSIUS);
        assert_eq!(
            ai.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(21.0), None, None),
            Err(ObjectError::WriteAccessDenied)
        );

        ai.write_property(PropertyIdentifier::OutOfService, PropertyValue::Boolean(true), None, None)
            .unwrap();
        ai.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(21.0), None, None)
            .unwrap();
        assert_eq!(
            ai.read_property(PropertyIdentifier::PresentValue, None).unwrap(),
            PropertyValue::Real(21.0)
        );

        // Out-of-service also surfaces in Status_Flags.
        let PropertyValue::BitString(flags) =
            ai.read_property(PropertyIdentifier::StatusFlags, None).unwrap()
        else {
            panic!("status flags must be a bit string");
        };
        assert_eq!(flags.data, vec![0x10]);
    }

    #[test]
    fn min_max_present_value_enforced() {
        let mut av = BacnetObject::analog_value(5, "av-5", units::PERCENT, Some(50.0));
        av.write_property(PropertyIdentifier::MinPresValue, PropertyValue::Real(0.0), None, None)
            .unwrap();
        av.write_property(PropertyIdentifier::MaxPresValue, PropertyValue::Real(100.0), None, None)
            .unwrap();

        assert_eq!(
            av.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(101.0), None, None),
            Err(ObjectError::ValueOutOfRange)
        );
        av.write_property(PropertyIdentifier::PresentValue, PropertyValue::Real(100.0), None, None)
            .unwrap();
    }

    #[test]
    fn cov_increment_must_be_non_negative() {
        let mut av = BacnetObject::analog_value(6, "av-6", units::PERCENT, None);
        assert_eq!(
            av.write_property(PropertyIdentifier::CovIncrement, PropertyValue::Real(-1.0), None, None),
            Err(ObjectError::ValueOutOfRange)
        );
        av.write_property(PropertyIdentifier::CovIncrement, PropertyValue::Real(0.5), None, None)
            .unwrap();
    }

    #[test]
    fn wrong_type_rejected() {
        let mut av = BacnetObject::analog_value(7, "av-7", units::PERCENT, None);
        assert_eq!(
            av.write_property(
                PropertyIdentifier::PresentValue,
                PropertyValue::CharacterString("warm".into()),
                None,
                None
            ),
            Err(ObjectError::InvalidDataType)
        );
    }

    #[test]
    fn property_list_excludes_identity_columns() {
        let av = BacnetObject::analog_value(8, "av-8", units::PERCENT, None);
        let PropertyValue::Array(items) =
            av.read_property(PropertyIdentifier::PropertyList, None).unwrap()
        else {
            panic!("property list must be an array");
        };
        let codes: Vec<u32> = items
            .iter()
            .filter_map(PropertyValue::as_unsigned)
            .collect();
        assert!(codes.contains(&PropertyIdentifier::PresentValue.code()));
        assert!(!codes.contains(&PropertyIdentifier::ObjectName.code()));
        assert!(!codes.contains(&PropertyIdentifier::PropertyList.code()));
    }
}
