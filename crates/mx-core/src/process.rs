//! GET/PUT dispatch through field process functions.
//!
//! Every remote field access goes through [`get_field_value`] or
//! [`put_field_value`]. A field with a bound process function gives its
//! driver a chance to talk to hardware; a field without one is a plain
//! stored value.

use crate::driver::{FieldProcessable, Openable};
use crate::error::{MxError, MxResult};
use crate::field::{FieldFlags, FieldValue, REC_RESYNCHRONIZE};
use crate::record::Record;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Direction of a field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessOp {
    /// Read: the function may refresh the stored value.
    Get,
    /// Write: the function acts on the freshly stored value.
    Put,
}

impl fmt::Display for ProcessOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOp::Get => write!(f, "GET"),
            ProcessOp::Put => write!(f, "PUT"),
        }
    }
}

/// Bind the record's process functions to their fields.
///
/// The device processor is bound to every field whose label value it lists.
/// When the device is openable, the `resynchronize` field is bound as well so
/// that writing it calls [`Openable::resynchronize`]. Returns the number of
/// fields bound.
pub fn special_processing_setup(record: &mut Record) -> usize {
    let mut bound = 0;

    if let Some(processor) = record.device.processor.clone() {
        let labels = processor.processed_labels();
        for field in record
            .fields
            .iter_mut()
            .filter(|field| labels.contains(&field.label_value))
        {
            field.process_function = Some(processor.clone());
            bound += 1;
        }
    }

    if let Some(openable) = record.device.openable.clone() {
        if let Some(ordinal) = record.field_index_by_label(REC_RESYNCHRONIZE) {
            if record.fields[ordinal].process_function.is_none() {
                record.fields[ordinal].process_function =
                    Some(Arc::new(ResynchronizeProcessor { openable }));
                bound += 1;
            }
        }
    }

    debug!(record = %record.name, bound, "Special processing setup");
    bound
}

/// Run the process function bound to a field, if any.
pub async fn process_record_field(record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
    let function = record.field(ordinal)?.process_function.clone();
    match function {
        Some(function) => function.process(record, ordinal, op).await,
        None => Ok(()),
    }
}

/// Read a field as a client sees it.
///
/// The bound process function runs first and may refresh the stored value.
/// If it fails, its error is returned and no value is produced.
pub async fn get_field_value(record: &mut Record, ordinal: usize) -> MxResult<FieldValue> {
    let field = record.field(ordinal)?;
    if field.flags.contains(FieldFlags::NO_ACCESS) {
        return Err(MxError::PermissionDenied(format!(
            "field '{}.{}' is not accessible",
            record.name, field.name
        )));
    }
    process_record_field(record, ordinal, ProcessOp::Get).await?;
    Ok(record.field(ordinal)?.value.clone())
}

/// Write a field as a client sees it.
///
/// The value is checked against the field's flags, type and shape, stored,
/// and then the bound process function runs.
///
/// This is **not transactional**: if the process function fails, the error
/// is returned but the new value stays stored. Callers that need to know
/// the device state should read the field back.
pub async fn put_field_value(record: &mut Record, ordinal: usize, value: FieldValue) -> MxResult<()> {
    let field = record.field(ordinal)?;
    if field
        .flags
        .intersects(FieldFlags::READ_ONLY | FieldFlags::NO_ACCESS)
    {
        return Err(MxError::PermissionDenied(format!(
            "field '{}.{}' is read-only",
            record.name, field.name
        )));
    }
    record.set_value(ordinal, value)?;
    process_record_field(record, ordinal, ProcessOp::Put).await
}

/// Fallback for a label a driver's process function does not handle.
///
/// Logged at debug level; never an error.
pub fn unknown_label(record: &Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
    let (field, label) = record
        .fields
        .get(ordinal)
        .map_or(("?", -1), |field| (field.name.as_str(), field.label_value));
    debug!(
        record = %record.name,
        field,
        label,
        op = %op,
        "Process function called for unhandled label"
    );
    Ok(())
}

/// Calls [`Openable::resynchronize`] when the `resynchronize` field is set.
struct ResynchronizeProcessor {
    openable: Arc<dyn Openable>,
}

#[async_trait]
impl FieldProcessable for ResynchronizeProcessor {
    fn processed_labels(&self) -> &'static [i64] {
        &[REC_RESYNCHRONIZE]
    }

    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
        if op != ProcessOp::Put {
            return Ok(());
        }
        if record.value(ordinal)?.as_bool() != Some(true) {
            return Ok(());
        }
        let result = self.openable.resynchronize(record).await;
        record.set_value(ordinal, FieldValue::Bool(false))?;
        result
    }
}
