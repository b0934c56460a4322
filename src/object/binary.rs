//! Binary object types (Clause 12.6-12.8).
//!
//! Present_Value is the enumerated pair inactive/active. Inputs and
//! outputs carry a Polarity; with Polarity = reverse the value is inverted
//! on the read path only, the stored value stays physical.

use std::collections::HashMap;

use super::{
    binary_pv, event_state, polarity, reliability, BacnetObject, CommandableState,
    ObjectIdentifier, ObjectType, PropertyAccess, PropertyDefinition, PropertyIdentifier,
    PropertyValue, ValueKind,
};

fn binary_table(
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
            PropertyDefinition::required(ValueKind::Enumerated, pv_access),
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
            PropertyIdentifier::ActiveText,
            PropertyDefinition::optional(ValueKind::CharacterString, PropertyAccess::ReadWrite),
        ),
        (
            PropertyIdentifier::InactiveText,
            PropertyDefinition::optional(ValueKind::CharacterString, PropertyAccess::ReadWrite),
        ),
    ]);
    if matches!(object_type, ObjectType::BinaryInput | ObjectType::BinaryOutput) {
        table.insert(
            PropertyIdentifier::Polarity,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadWrite),
        );
    }
    if commandable {
        table.insert(
            PropertyIdentifier::PriorityArray,
            PropertyDefinition::required(ValueKind::Array, PropertyAccess::ReadOnly),
        );
        table.insert(
            PropertyIdentifier::RelinquishDefault,
            PropertyDefinition::required(ValueKind::Enumerated, PropertyAccess::ReadWrite),
        );
        table.insert(
            PropertyIdentifier::CurrentCommandPriority,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        );
    }
    table
}

fn binary_values(
    name: &str,
    with_polarity: bool,
) -> HashMap<PropertyIdentifier, PropertyValue> {
    let mut values = HashMap::from([
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
    ]);
    if with_polarity {
        values.insert(
            PropertyIdentifier::Polarity,
            PropertyValue::Enumerated(polarity::NORMAL),
        );
    }
    values
}

impl BacnetObject {
    /// Binary Input.
    pub fn binary_input(instance: u32, name: &str) -> Self {
        let id = ObjectIdentifier::new(ObjectType::BinaryInput, instance);
        let mut values = binary_values(name, true);
        values.insert(
            PropertyIdentifier::PresentValue,
            PropertyValue::Enumerated(binary_pv::INACTIVE),
        );
        Self::assemble(id, binary_table(ObjectType::BinaryInput, false), values, None)
    }

    /// Binary Output: always commandable.
    pub fn binary_output(instance: u32, name: &str) -> Self {
        let id = ObjectIdentifier::new(ObjectType::BinaryOutput, instance);
        Self::assemble(
            id,
            binary_table(ObjectType::BinaryOutput, true),
            binary_values(name, true),
            Some(CommandableState::new(PropertyValue::Enumerated(
                binary_pv::INACTIVE,
            ))),
        )
    }

    /// Binary Value; commandable when a relinquish default is given.
    pub fn binary_value(instance: u32, name: &str, relinquish_default: Option<u32>) -> Self {
        let id = ObjectIdentifier::new(ObjectType::BinaryValue, instance);
        let commandable = relinquish_default
            .map(|default| CommandableState::new(PropertyValue::Enumerated(default)));
        let mut values = binary_values(name, false);
        if commandable.is_none() {
            values.insert(
                PropertyIdentifier::PresentValue,
                PropertyValue::Enumerated(binary_pv::INACTIVE),
            );
        }
        Self::assemble(
            id,
            binary_table(ObjectType::BinaryValue, commandable.is_some()),
            values,
            commandable,
        )
    }
}
