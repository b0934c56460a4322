//! Multi-state object types (Clause 12.18-12.20).
//!
//! Present_Value is an unsigned state number in 1..=Number_Of_States.

use std::collections::HashMap;

use super::{
    event_state, reliability, BacnetObject, CommandableState, ObjectIdentifier, ObjectType,
    PropertyAccess, PropertyDefinition, PropertyIdentifier, PropertyValue, ValueKind,
};

fn multistate_table(
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
            PropertyDefinition::required(ValueKind::Unsigned, pv_access),
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
            PropertyIdentifier::NumberOfStates,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadWrite),
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
            PropertyIdentifier::StateText,
            PropertyDefinition::optional(ValueKind::Array, PropertyAccess::ReadWrite),
        ),
    ]);
    if commandable {
        table.insert(
            PropertyIdentifier::PriorityArray,
            PropertyDefinition::required(ValueKind::Array, PropertyAccess::ReadOnly),
        );
        table.insert(
            PropertyIdentifier::RelinquishDefault,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadWrite),
        );
        table.insert(
            PropertyIdentifier::CurrentCommandPriority,
            PropertyDefinition::required(ValueKind::Unsigned, PropertyAccess::ReadOnly),
        );
    }
    table
}

fn multistate_values(
    name: &str,
    number_of_states: u32,
    state_text: Option<&[&str]>,
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
        (
            PropertyIdentifier::NumberOfStates,
            PropertyValue::Unsigned(number_of_states.max(1)),
        ),
    ]);
    if let Some(texts) = state_text {
        values.insert(
            PropertyIdentifier::StateText,
            PropertyValue::Array(
                texts
                    .iter()
                    .map(|t| PropertyValue::CharacterString((*t).to_string()))
                    .collect(),
            ),
        );
    }
    values
}

impl BacnetObject {
    /// Multi-state Input.
    pub fn multistate_input(
        instance: u32,
        name: &str,
        number_of_states: u32,
        state_text: Option<&[&str]>,
    ) -> Self {
        let id = ObjectIdentifier::new(ObjectType::MultiStateInput, instance);
        let mut values = multistate_values(name, number_of_states, state_text);
        values.insert(PropertyIdentifier::PresentValue, PropertyValue::Unsigned(1));
        Self::assemble(
            id,
            multistate_table(ObjectType::MultiStateInput, false),
            values,
            None,
        )
    }

    /// Multi-state Output: always commandable.
    pub fn multistate_output(
        instance: u32,
        name: &str,
        number_of_states: u32,
        relinquish_default: u32,
    ) -> Self {
        let id = ObjectIdentifier::new(ObjectType::MultiStateOutput, instance);
        Self::assemble(
            id,
            multistate_table(ObjectType::MultiStateOutput, true),
            multistate_values(name, number_of_states, None),
            Some(CommandableState::new(PropertyValue::Unsigned(
                relinquish_default.max(1),
            ))),
        )
    }

    /// Multi-state Value; commandable when a relinquish default is given.
    pub fn multistate_value(
        instance: u32,
        name: &str,
        number_of_states: u32,
        relinquish_default: Option<u32>,
    ) -> Self {
        let id = ObjectIdentifier::new(ObjectType::MultiStateValue, instance);
        let commandable = relinquish_default
            .map(|default| CommandableState::new(PropertyValue::Unsigned(default.max(1))));
        let mut values = multistate_values(name, number_of_states, None);
        if commandable.is_none() {
            values.insert(PropertyIdentifier::PresentValue, PropertyValue::Unsigned(1));
        }
        Self::assemble(
            id,
            multistate_table(ObjectType::MultiStateValue, commandable.is_some()),
            values,
            commandable,
        )
    }
}
