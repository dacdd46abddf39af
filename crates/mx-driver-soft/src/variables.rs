//! Inline variables: records that only hold a value.

use mx_core::field::FieldFlags;
use mx_core::{
    standard_fields, ClassId, ConstructContext, Constructible, DeviceComponents, DriverEntry,
    FieldDefault, FieldType, MxResult, Record, StorageLocation, SuperclassId,
};
use std::sync::Arc;

/// Static type id of `long_variable`.
pub const LONG_VARIABLE_TYPE: i64 = 50;
/// Static type id of `double_variable`.
pub const DOUBLE_VARIABLE_TYPE: i64 = 51;
/// Static type id of `string_variable`.
pub const STRING_VARIABLE_TYPE: i64 = 52;

/// Longest `string_variable` value.
pub const MAX_STRING_VARIABLE_LENGTH: usize = 256;

struct VariableDriver;

impl Constructible for VariableDriver {
    fn create(&self, _record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
        Ok(DeviceComponents::new())
    }
}

fn value_field(field_type: FieldType) -> FieldDefault {
    FieldDefault::new("value", field_type, StorageLocation::type_struct(0x00))
        .flags(FieldFlags::IN_DESCRIPTION | FieldFlags::IN_SUMMARY | FieldFlags::POLL)
}

fn variable(name: &str, type_id: i64, value: FieldDefault) -> DriverEntry {
    let mut fields = standard_fields();
    fields.push(value);
    DriverEntry::new(name, SuperclassId::VARIABLE, ClassId::INLINE_VARIABLE, type_id)
        .constructor(Arc::new(VariableDriver))
        .fields(fields)
}

/// Driver table entries for the three inline variable types.
pub fn entries() -> Vec<DriverEntry> {
    vec![
        variable("long_variable", LONG_VARIABLE_TYPE, value_field(FieldType::Long)),
        variable("double_variable", DOUBLE_VARIABLE_TYPE, value_field(FieldType::Double)),
        variable(
            "string_variable",
            STRING_VARIABLE_TYPE,
            value_field(FieldType::String).string(MAX_STRING_VARIABLE_LENGTH),
        ),
    ]
}
