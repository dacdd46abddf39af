//! Field descriptors and values.
//!
//! A record is an array of [`RecordField`]s. Each field is created from a
//! driver's [`FieldDefault`], owns its current [`FieldValue`], and may carry a
//! bound process function (see [`crate::process`]).
//!
//! Fields also describe where their value conceptually lives: a
//! [`StorageLocation`] names the backing structure (record header, class
//! part or type part) and a byte offset inside it. Two fields of one driver
//! must never share a location; [`crate::registry::DriverRegistry::verify`]
//! enforces that.

use crate::driver::FieldProcessable;
use crate::error::{MxError, MxResult};
use crate::limits::{MAX_ACL_DESCRIPTION_LENGTH, MAX_LABEL_LENGTH, MAX_RECORD_NAME_LENGTH};
use crate::taxonomy::{ClassEntry, SuperclassEntry};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Field attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldFlags: u32 {
        /// Written when a record description is saved.
        const IN_DESCRIPTION = 1 << 0;
        /// Shown in summary listings.
        const IN_SUMMARY = 1 << 1;
        /// Clients may not PUT this field.
        const READ_ONLY = 1 << 2;
        /// Clients may neither GET nor PUT this field.
        const NO_ACCESS = 1 << 3;
        /// The callback poll timer checks this field for changes.
        const POLL = 1 << 4;
        /// Value changes do not reset the record's event timer.
        const NO_NEXT_EVENT_TIME_UPDATE = 1 << 5;
    }
}

// =============================================================================
// Types and shapes
// =============================================================================

/// Element type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Long,
    /// Unsigned 64-bit integer.
    ULong,
    /// Double precision float.
    Double,
    /// Bounded string.
    String,
    /// Taxonomy id (superclass, class or type), stored as a long.
    RecordType,
}

impl FieldType {
    /// Wire code for this type.
    pub fn code(self) -> u32 {
        match self {
            FieldType::String => 1,
            FieldType::Bool => 2,
            FieldType::Long => 3,
            FieldType::ULong => 4,
            FieldType::Double => 5,
            FieldType::RecordType => 6,
        }
    }

    /// Inverse of [`FieldType::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(FieldType::String),
            2 => Some(FieldType::Bool),
            3 => Some(FieldType::Long),
            4 => Some(FieldType::ULong),
            5 => Some(FieldType::Double),
            6 => Some(FieldType::RecordType),
            _ => None,
        }
    }

    /// Lowercase name used in listings.
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Long => "long",
            FieldType::ULong => "ulong",
            FieldType::Double => "double",
            FieldType::String => "string",
            FieldType::RecordType => "recordtype",
        }
    }
}

/// Shape of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldShape {
    /// A single element.
    Scalar,
    /// A string of at most `max_len` bytes.
    String {
        /// Maximum length in bytes.
        max_len: usize,
    },
    /// A one-dimensional array of at most `max_len` elements.
    Array {
        /// Maximum number of elements.
        max_len: usize,
    },
}

impl FieldShape {
    /// Number of dimensions (0 for scalars, 1 otherwise).
    pub fn num_dimensions(self) -> u32 {
        match self {
            FieldShape::Scalar => 0,
            FieldShape::String { .. } | FieldShape::Array { .. } => 1,
        }
    }

    /// Length of the single dimension, or 0 for scalars.
    pub fn dimension(self) -> usize {
        match self {
            FieldShape::Scalar => 0,
            FieldShape::String { max_len } | FieldShape::Array { max_len } => max_len,
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// Current value of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean scalar.
    Bool(bool),
    /// Signed scalar (also used for record types).
    Long(i64),
    /// Unsigned scalar.
    ULong(u64),
    /// Float scalar.
    Double(f64),
    /// String.
    String(String),
    /// Signed array.
    LongArray(Vec<i64>),
    /// Unsigned array.
    ULongArray(Vec<u64>),
    /// Float array.
    DoubleArray(Vec<f64>),
}

impl FieldValue {
    /// The zero value for a field of the given type and shape.
    pub fn zero(field_type: FieldType, shape: FieldShape) -> FieldValue {
        match (field_type, shape) {
            (FieldType::String, _) => FieldValue::String(String::new()),
            (FieldType::Bool, FieldShape::Scalar) => FieldValue::Bool(false),
            (FieldType::Long | FieldType::RecordType, FieldShape::Scalar) => FieldValue::Long(0),
            (FieldType::ULong, FieldShape::Scalar) => FieldValue::ULong(0),
            (FieldType::Double, FieldShape::Scalar) => FieldValue::Double(0.0),
            (FieldType::Bool | FieldType::ULong, _) => FieldValue::ULongArray(Vec::new()),
            (FieldType::Long | FieldType::RecordType, _) => FieldValue::LongArray(Vec::new()),
            (FieldType::Double, _) => FieldValue::DoubleArray(Vec::new()),
        }
    }

    /// Number of elements (bytes for strings).
    pub fn len(&self) -> usize {
        match self {
            FieldValue::Bool(_) | FieldValue::Long(_) | FieldValue::ULong(_) | FieldValue::Double(_) => 1,
            FieldValue::String(s) => s.len(),
            FieldValue::LongArray(v) => v.len(),
            FieldValue::ULongArray(v) => v.len(),
            FieldValue::DoubleArray(v) => v.len(),
        }
    }

    /// True for empty strings and arrays.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar as f64, if numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            FieldValue::Long(v) => Some(*v as f64),
            FieldValue::ULong(v) => Some(*v as f64),
            FieldValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Scalar as i64, if integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            FieldValue::ULong(v) => i64::try_from(*v).ok(),
            FieldValue::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Scalar as bool; any nonzero integer counts as true.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            FieldValue::Long(v) => Some(*v != 0),
            FieldValue::ULong(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert this value into the exact representation a field of the given
    /// type and shape stores, rejecting lossy or out-of-bounds conversions.
    pub fn coerce(self, field_type: FieldType, shape: FieldShape) -> MxResult<FieldValue> {
        let mismatch = |value: &FieldValue| {
            MxError::IllegalArgument(format!(
                "value {} does not fit a {} field of shape {:?}",
                value,
                field_type.name(),
                shape
            ))
        };

        let coerced = match (field_type, shape) {
            (FieldType::String, FieldShape::String { max_len }) => match self {
                FieldValue::String(s) if s.len() <= max_len => FieldValue::String(s),
                FieldValue::String(s) => {
                    return Err(MxError::WouldExceedLimit(format!(
                        "string of {} bytes exceeds field length {}",
                        s.len(),
                        max_len
                    )))
                }
                other => return Err(mismatch(&other)),
            },
            (FieldType::String, _) => return Err(mismatch(&self)),
            (FieldType::Bool, FieldShape::Scalar) => match self.as_bool() {
                Some(v) => FieldValue::Bool(v),
                None => return Err(mismatch(&self)),
            },
            (FieldType::Long | FieldType::RecordType, FieldShape::Scalar) => match self {
                FieldValue::Long(v) => FieldValue::Long(v),
                FieldValue::ULong(v) => match i64::try_from(v) {
                    Ok(v) => FieldValue::Long(v),
                    Err(_) => return Err(mismatch(&self)),
                },
                FieldValue::Bool(v) => FieldValue::Long(i64::from(v)),
                other => return Err(mismatch(&other)),
            },
            (FieldType::ULong, FieldShape::Scalar) => match self {
                FieldValue::ULong(v) => FieldValue::ULong(v),
                FieldValue::Long(v) if v >= 0 => FieldValue::ULong(v as u64),
                FieldValue::Bool(v) => FieldValue::ULong(u64::from(v)),
                other => return Err(mismatch(&other)),
            },
            (FieldType::Double, FieldShape::Scalar) => match self.as_f64() {
                Some(v) => FieldValue::Double(v),
                None => return Err(mismatch(&self)),
            },
            (_, FieldShape::Array { max_len }) => {
                let array = match (field_type, self) {
                    (FieldType::Double, FieldValue::DoubleArray(v)) => FieldValue::DoubleArray(v),
                    (FieldType::Double, FieldValue::LongArray(v)) => {
                        FieldValue::DoubleArray(v.into_iter().map(|x| x as f64).collect())
                    }
                    (FieldType::Long | FieldType::RecordType, FieldValue::LongArray(v)) => {
                        FieldValue::LongArray(v)
                    }
                    (FieldType::ULong | FieldType::Bool, FieldValue::ULongArray(v)) => {
                        FieldValue::ULongArray(v)
                    }
                    (FieldType::ULong | FieldType::Bool, FieldValue::LongArray(v)) => {
                        let converted: Result<Vec<u64>, _> =
                            v.iter().map(|x| u64::try_from(*x)).collect();
                        match converted {
                            Ok(v) => FieldValue::ULongArray(v),
                            Err(_) => return Err(mismatch(&FieldValue::LongArray(v))),
                        }
                    }
                    (_, other) => return Err(mismatch(&other)),
                };
                if array.len() > max_len {
                    return Err(MxError::WouldExceedLimit(format!(
                        "array of {} elements exceeds field length {}",
                        array.len(),
                        max_len
                    )));
                }
                array
            }
            (_, FieldShape::String { .. }) => return Err(mismatch(&self)),
        };
        Ok(coerced)
    }

    /// Render as whitespace-separated ASCII, the text wire format.
    pub fn to_ascii(&self) -> String {
        match self {
            FieldValue::Bool(v) => u8::from(*v).to_string(),
            FieldValue::Long(v) => v.to_string(),
            FieldValue::ULong(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::String(s) => s.clone(),
            FieldValue::LongArray(v) => join(v),
            FieldValue::ULongArray(v) => join(v),
            FieldValue::DoubleArray(v) => join(v),
        }
    }

    /// Parse the ASCII wire format for a field of the given type and shape.
    pub fn parse_ascii(text: &str, field_type: FieldType, shape: FieldShape) -> MxResult<FieldValue> {
        if field_type == FieldType::String {
            return FieldValue::String(text.to_string()).coerce(field_type, shape);
        }

        let bad = |token: &str| {
            MxError::IllegalArgument(format!(
                "cannot parse '{}' as {}",
                token,
                field_type.name()
            ))
        };

        match shape {
            FieldShape::Scalar => {
                let token = text.trim();
                let value = match field_type {
                    FieldType::Bool => match token {
                        "1" | "true" | "TRUE" => FieldValue::Bool(true),
                        "0" | "false" | "FALSE" => FieldValue::Bool(false),
                        _ => return Err(bad(token)),
                    },
                    FieldType::Long | FieldType::RecordType => {
                        FieldValue::Long(token.parse().map_err(|_| bad(token))?)
                    }
                    FieldType::ULong => FieldValue::ULong(token.parse().map_err(|_| bad(token))?),
                    FieldType::Double => FieldValue::Double(token.parse().map_err(|_| bad(token))?),
                    FieldType::String => FieldValue::String(text.to_string()),
                };
                Ok(value)
            }
            FieldShape::Array { .. } => {
                let tokens = text.split_whitespace();
                let value = match field_type {
                    FieldType::Double => FieldValue::DoubleArray(
                        tokens
                            .map(|t| t.parse().map_err(|_| bad(t)))
                            .collect::<MxResult<_>>()?,
                    ),
                    FieldType::Long | FieldType::RecordType => FieldValue::LongArray(
                        tokens
                            .map(|t| t.parse().map_err(|_| bad(t)))
                            .collect::<MxResult<_>>()?,
                    ),
                    FieldType::ULong | FieldType::Bool => FieldValue::ULongArray(
                        tokens
                            .map(|t| t.parse().map_err(|_| bad(t)))
                            .collect::<MxResult<_>>()?,
                    ),
                    FieldType::String => FieldValue::String(text.to_string()),
                };
                value.coerce(field_type, shape)
            }
            FieldShape::String { .. } => Err(bad(text)),
        }
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) => write!(f, "\"{}\"", s),
            other => write!(f, "{}", other.to_ascii()),
        }
    }
}

// =============================================================================
// Storage locations
// =============================================================================

/// Backing structure a field value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureId {
    /// Common record header.
    Record,
    /// Superclass-specific part.
    Superclass,
    /// Class-specific part.
    Class,
    /// Type-specific part.
    Type,
}

/// Structure plus byte offset identifying where a field lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StorageLocation {
    /// Backing structure.
    pub structure: StructureId,
    /// Byte offset inside the structure.
    pub offset: usize,
}

impl StorageLocation {
    /// Location in the record header.
    pub const fn record(offset: usize) -> Self {
        Self {
            structure: StructureId::Record,
            offset,
        }
    }

    /// Location in the class-specific part.
    pub const fn class(offset: usize) -> Self {
        Self {
            structure: StructureId::Class,
            offset,
        }
    }

    /// Location in the type-specific part.
    pub const fn type_struct(offset: usize) -> Self {
        Self {
            structure: StructureId::Type,
            offset,
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let structure = match self.structure {
            StructureId::Record => "record",
            StructureId::Superclass => "superclass",
            StructureId::Class => "class",
            StructureId::Type => "type",
        };
        write!(f, "{}+{:#x}", structure, self.offset)
    }
}

// =============================================================================
// Type information
// =============================================================================

/// Taxonomy descriptor bound to the `mx_superclass`, `mx_class` and `mx_type`
/// fields so a field alone is enough to recover what it describes.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    /// Bound to a static superclass entry.
    Superclass(&'static SuperclassEntry),
    /// Bound to a static class entry.
    Class(&'static ClassEntry),
    /// Bound to the registered driver type.
    Type {
        /// Driver name.
        name: String,
        /// Resolved type id.
        type_id: i64,
    },
}

// =============================================================================
// Field defaults
// =============================================================================

/// Label value meaning "no driver-specific identifier".
pub const NO_LABEL_VALUE: i64 = -1;

/// Label value of the standard `resynchronize` field.
pub const REC_RESYNCHRONIZE: i64 = 102;

/// Static description of one field of a driver.
#[derive(Debug, Clone)]
pub struct FieldDefault {
    /// Driver-local identifier used by process functions.
    pub label_value: i64,
    /// Position in the field array, assigned at registration (-1 before).
    pub ordinal: i64,
    /// Field name.
    pub name: String,
    /// Element type.
    pub field_type: FieldType,
    /// Taxonomy binding for the three taxonomy fields.
    pub typeinfo: Option<TypeInfo>,
    /// Value shape.
    pub shape: FieldShape,
    /// Backing storage location.
    pub storage: StorageLocation,
    /// Attribute flags.
    pub flags: FieldFlags,
}

impl FieldDefault {
    /// A scalar field with no label value and no flags.
    pub fn new(name: impl Into<String>, field_type: FieldType, storage: StorageLocation) -> Self {
        let shape = if field_type == FieldType::String {
            FieldShape::String {
                max_len: MAX_LABEL_LENGTH,
            }
        } else {
            FieldShape::Scalar
        };
        Self {
            label_value: NO_LABEL_VALUE,
            ordinal: -1,
            name: name.into(),
            field_type,
            typeinfo: None,
            shape,
            storage,
            flags: FieldFlags::empty(),
        }
    }

    /// Set the driver-local label value.
    pub fn label(mut self, label_value: i64) -> Self {
        self.label_value = label_value;
        self
    }

    /// Add flags.
    pub fn flags(mut self, flags: FieldFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Make this a string field of at most `max_len` bytes.
    pub fn string(mut self, max_len: usize) -> Self {
        self.shape = FieldShape::String { max_len };
        self
    }

    /// Make this a one-dimensional array of at most `max_len` elements.
    pub fn array(mut self, max_len: usize) -> Self {
        self.shape = FieldShape::Array { max_len };
        self
    }
}

/// Standard field names, in order, at the start of every field array.
pub const STANDARD_FIELD_NAMES: [&str; 8] = [
    "name",
    "mx_superclass",
    "mx_class",
    "mx_type",
    "label",
    "acl_description",
    "precision",
    "resynchronize",
];

/// The standard fields every record type starts with.
pub fn standard_fields() -> Vec<FieldDefault> {
    let descr = FieldFlags::IN_DESCRIPTION | FieldFlags::NO_NEXT_EVENT_TIME_UPDATE;
    vec![
        FieldDefault::new("name", FieldType::String, StorageLocation::record(0x00))
            .string(MAX_RECORD_NAME_LENGTH)
            .flags(descr | FieldFlags::IN_SUMMARY | FieldFlags::READ_ONLY),
        FieldDefault::new("mx_superclass", FieldType::RecordType, StorageLocation::record(0x30))
            .flags(descr | FieldFlags::READ_ONLY),
        FieldDefault::new("mx_class", FieldType::RecordType, StorageLocation::record(0x38))
            .flags(descr | FieldFlags::READ_ONLY),
        FieldDefault::new("mx_type", FieldType::RecordType, StorageLocation::record(0x40))
            .flags(descr | FieldFlags::IN_SUMMARY | FieldFlags::READ_ONLY),
        FieldDefault::new("label", FieldType::String, StorageLocation::record(0x48))
            .string(MAX_LABEL_LENGTH)
            .flags(descr),
        FieldDefault::new("acl_description", FieldType::String, StorageLocation::record(0x78))
            .string(MAX_ACL_DESCRIPTION_LENGTH)
            .flags(descr),
        FieldDefault::new("precision", FieldType::Long, StorageLocation::record(0xa8))
            .flags(FieldFlags::NO_NEXT_EVENT_TIME_UPDATE),
        FieldDefault::new("resynchronize", FieldType::Bool, StorageLocation::record(0xb0))
            .label(REC_RESYNCHRONIZE),
    ]
}

// =============================================================================
// Runtime fields
// =============================================================================

/// A field of a live record.
#[derive(Clone)]
pub struct RecordField {
    /// Field name.
    pub name: String,
    /// Driver-local identifier (negative when none).
    pub label_value: i64,
    /// Index in the owning record's field array.
    pub ordinal: usize,
    /// Element type.
    pub field_type: FieldType,
    /// Value shape.
    pub shape: FieldShape,
    /// Backing storage location.
    pub storage: StorageLocation,
    /// Attribute flags.
    pub flags: FieldFlags,
    /// Taxonomy binding, if any.
    pub typeinfo: Option<TypeInfo>,
    /// Current value.
    pub value: FieldValue,
    /// Bound process function.
    pub process_function: Option<Arc<dyn FieldProcessable>>,
}

impl RecordField {
    /// Instantiate a field from its default with a zero value.
    pub fn from_default(default: &FieldDefault, ordinal: usize) -> Self {
        Self {
            name: default.name.clone(),
            label_value: default.label_value,
            ordinal,
            field_type: default.field_type,
            shape: default.shape,
            storage: default.storage,
            flags: default.flags,
            typeinfo: default.typeinfo.clone(),
            value: FieldValue::zero(default.field_type, default.shape),
            process_function: None,
        }
    }

    /// True if a process function is bound.
    pub fn has_process_function(&self) -> bool {
        self.process_function.is_some()
    }
}

impl fmt::Debug for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordField")
            .field("name", &self.name)
            .field("label_value", &self.label_value)
            .field("ordinal", &self.ordinal)
            .field("field_type", &self.field_type)
            .field("shape", &self.shape)
            .field("flags", &self.flags)
            .field("value", &self.value)
            .field("process_function", &self.process_function.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_fields_have_distinct_locations() {
        let fields = standard_fields();
        assert_eq!(fields.len(), STANDARD_FIELD_NAMES.len());
        let mut seen = std::collections::HashSet::new();
        for (field, name) in fields.iter().zip(STANDARD_FIELD_NAMES) {
            assert_eq!(field.name, name);
            assert!(seen.insert(field.storage));
        }
    }

    #[test]
    fn coerce_widens_integers_to_double() {
        let v = FieldValue::Long(3)
            .coerce(FieldType::Double, FieldShape::Scalar)
            .unwrap();
        assert_eq!(v, FieldValue::Double(3.0));
    }

    #[test]
    fn coerce_rejects_negative_ulong() {
        let err = FieldValue::Long(-1)
            .coerce(FieldType::ULong, FieldShape::Scalar)
            .unwrap_err();
        assert!(matches!(err, MxError::IllegalArgument(_)));
    }

    #[test]
    fn coerce_enforces_lengths() {
        let err = FieldValue::String("x".repeat(5))
            .coerce(FieldType::String, FieldShape::String { max_len: 4 })
            .unwrap_err();
        assert!(matches!(err, MxError::WouldExceedLimit(_)));

        let err = FieldValue::DoubleArray(vec![0.0; 3])
            .coerce(FieldType::Double, FieldShape::Array { max_len: 2 })
            .unwrap_err();
        assert!(matches!(err, MxError::WouldExceedLimit(_)));
    }

    #[test]
    fn ascii_arrays_parse_whitespace_separated() {
        let v = FieldValue::parse_ascii("1 2\t3", FieldType::Long, FieldShape::Array { max_len: 8 })
            .unwrap();
        assert_eq!(v, FieldValue::LongArray(vec![1, 2, 3]));
        assert_eq!(v.to_ascii(), "1 2 3");
    }

    #[test]
    fn ascii_rejects_garbage() {
        let err = FieldValue::parse_ascii("abc", FieldType::Double, FieldShape::Scalar).unwrap_err();
        assert!(matches!(err, MxError::IllegalArgument(_)));
    }

    #[test]
    fn field_type_codes_are_stable() {
        for ty in [
            FieldType::Bool,
            FieldType::Long,
            FieldType::ULong,
            FieldType::Double,
            FieldType::String,
            FieldType::RecordType,
        ] {
            assert_eq!(FieldType::from_code(ty.code()), Some(ty));
        }
    }
}
