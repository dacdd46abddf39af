//! The list-head pseudo-driver.
//!
//! Its single record heads the record list and describes the database as a
//! whole. It has no constructor; the server fills its fields in after
//! loading the database.

use mx_core::field::FieldFlags;
use mx_core::{
    standard_fields, ClassId, DriverEntry, FieldDefault, FieldType, StorageLocation, SuperclassId,
};

/// Static type id of `list_head`.
pub const LIST_HEAD_TYPE: i64 = 1;

/// Name of the list head record.
pub const LIST_HEAD_RECORD_NAME: &str = "mx_database";

/// Driver table entry for `list_head`.
pub fn entry() -> DriverEntry {
    let mut fields = standard_fields();
    fields.extend([
        FieldDefault::new("mx_version", FieldType::String, StorageLocation::type_struct(0x00))
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("num_records", FieldType::Long, StorageLocation::type_struct(0x28))
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("status", FieldType::String, StorageLocation::type_struct(0x30))
            .flags(FieldFlags::READ_ONLY),
    ]);
    DriverEntry::new("list_head", SuperclassId::LIST_HEAD, ClassId::LIST_HEAD, LIST_HEAD_TYPE)
        .fields(fields)
}
