//! Records and the record list.
//!
//! A [`Record`] is a named instance of a driver: the driver's field defaults
//! become its field array, and the driver's constructor supplies the device
//! state ([`DeviceComponents`]). Records live in a [`RecordList`], which
//! keeps them in a circular order starting at the list head record and
//! indexes them by name.
//!
//! # Lifecycle
//!
//! ```text
//! RecordList::create_record   fields instantiated from defaults
//!        |
//! Record::set_value           database values applied (no process functions)
//!        |
//! Record::construct           constructor runs, process functions bound
//!        |
//! Record::open                device opened
//!        |
//! Record::close / RecordList::remove
//! ```

use crate::driver::{ConstructContext, DeviceComponents, DriverDescriptor};
use crate::error::{MxError, MxResult};
use crate::field::{FieldValue, RecordField};
use crate::limits::MAX_RECORD_NAME_LENGTH;
use crate::process::special_processing_setup;
use crate::taxonomy::{ClassId, SuperclassId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stable identifier of a record inside its [`RecordList`].
///
/// Ids are never reused, even after a record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub usize);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A live record.
pub struct Record {
    /// Id in the owning list.
    pub id: RecordId,
    /// Unique name.
    pub name: String,
    /// Superclass id.
    pub superclass: SuperclassId,
    /// Class id.
    pub class: ClassId,
    /// Type id.
    pub type_id: i64,
    /// Driver this record was created from.
    pub driver: Arc<DriverDescriptor>,
    /// Field array, in driver declaration order.
    pub fields: Vec<RecordField>,
    /// Network handle, assigned on first request.
    pub handle: Option<usize>,
    /// Device state from the constructor.
    pub device: DeviceComponents,
    constructed: bool,
    open: bool,
}

impl Record {
    /// Instantiate a record from a driver with zeroed fields.
    ///
    /// The standard `name`, `mx_superclass`, `mx_class` and `mx_type` fields
    /// are filled in.
    pub fn new(id: RecordId, name: &str, driver: Arc<DriverDescriptor>) -> MxResult<Record> {
        if name.is_empty() {
            return Err(MxError::NullArgument("record name is empty".to_string()));
        }
        if name.len() > MAX_RECORD_NAME_LENGTH {
            return Err(MxError::WouldExceedLimit(format!(
                "record name '{}' is longer than {} bytes",
                name, MAX_RECORD_NAME_LENGTH
            )));
        }

        let fields = driver
            .field_defaults
            .iter()
            .enumerate()
            .map(|(ordinal, default)| RecordField::from_default(default, ordinal))
            .collect();

        let mut record = Record {
            id,
            name: name.to_string(),
            superclass: driver.superclass,
            class: driver.class,
            type_id: driver.type_id,
            driver,
            fields,
            handle: None,
            device: DeviceComponents::new(),
            constructed: false,
            open: false,
        };

        let taxonomy = [
            ("name", FieldValue::String(record.name.clone())),
            ("mx_superclass", FieldValue::Long(record.superclass.0)),
            ("mx_class", FieldValue::Long(record.class.0)),
            ("mx_type", FieldValue::Long(record.type_id)),
        ];
        for (field, value) in taxonomy {
            if let Some(ordinal) = record.field_index(field) {
                record.fields[ordinal].value = value;
            }
        }

        Ok(record)
    }

    // =========================================================================
    // Field access (no process functions)
    // =========================================================================

    /// Ordinal of the named field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// Ordinal of the first field with the given label value.
    pub fn field_index_by_label(&self, label_value: i64) -> Option<usize> {
        self.fields
            .iter()
            .position(|field| field.label_value == label_value)
    }

    /// Field by ordinal.
    pub fn field(&self, ordinal: usize) -> MxResult<&RecordField> {
        self.fields.get(ordinal).ok_or_else(|| self.no_such_ordinal(ordinal))
    }

    /// Mutable field by ordinal.
    pub fn field_mut(&mut self, ordinal: usize) -> MxResult<&mut RecordField> {
        if ordinal >= self.fields.len() {
            return Err(self.no_such_ordinal(ordinal));
        }
        Ok(&mut self.fields[ordinal])
    }

    /// Field by name.
    pub fn field_by_name(&self, name: &str) -> MxResult<&RecordField> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| MxError::NotFound(format!("record '{}' has no field '{}'", self.name, name)))
    }

    fn no_such_ordinal(&self, ordinal: usize) -> MxError {
        MxError::NotFound(format!(
            "record '{}' has no field #{} ({} fields)",
            self.name,
            ordinal,
            self.fields.len()
        ))
    }

    /// Stored value of the field at `ordinal`.
    pub fn value(&self, ordinal: usize) -> MxResult<&FieldValue> {
        Ok(&self.field(ordinal)?.value)
    }

    /// Stored value of the named field.
    pub fn value_by_name(&self, name: &str) -> MxResult<&FieldValue> {
        Ok(&self.field_by_name(name)?.value)
    }

    /// Store a value directly, converting it to the field's type and shape.
    ///
    /// Bypasses process functions and access flags. Used while loading a
    /// database and by drivers updating their own fields.
    pub fn set_value(&mut self, ordinal: usize, value: FieldValue) -> MxResult<()> {
        let field = self.field_mut(ordinal)?;
        field.value = value.coerce(field.field_type, field.shape)?;
        Ok(())
    }

    /// [`Record::set_value`] by field name.
    pub fn set_value_by_name(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        let ordinal = self
            .field_index(name)
            .ok_or_else(|| MxError::NotFound(format!("record '{}' has no field '{}'", self.name, name)))?;
        self.set_value(ordinal, value)
    }

    /// Named field as f64, or `default` if absent or not numeric.
    pub fn f64_or(&self, name: &str, default: f64) -> f64 {
        self.value_by_name(name)
            .ok()
            .and_then(FieldValue::as_f64)
            .unwrap_or(default)
    }

    /// Named field as i64, or `default` if absent or not integral.
    pub fn i64_or(&self, name: &str, default: i64) -> i64 {
        self.value_by_name(name)
            .ok()
            .and_then(FieldValue::as_i64)
            .unwrap_or(default)
    }

    /// The record's label.
    pub fn label(&self) -> &str {
        self.value_by_name("label")
            .ok()
            .and_then(FieldValue::as_str)
            .unwrap_or("")
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run the driver's constructor and bind process functions.
    ///
    /// Records whose driver has no constructor (the list head) are left
    /// without device state.
    pub fn construct(&mut self, ctx: &ConstructContext) -> MxResult<()> {
        if self.constructed {
            return Err(MxError::IllegalArgument(format!(
                "record '{}' is already constructed",
                self.name
            )));
        }
        if let Some(constructor) = self.driver.constructor.clone() {
            self.device = constructor.create(self, ctx)?;
        }
        special_processing_setup(self);
        self.constructed = true;
        debug!(record = %self.name, driver = %self.driver.name, "Record constructed");
        Ok(())
    }

    /// Open the device, if it has open/close hooks.
    pub async fn open(&mut self) -> MxResult<()> {
        if self.open {
            return Ok(());
        }
        if let Some(openable) = self.device.openable.clone() {
            openable.open(self).await?;
        }
        self.open = true;
        Ok(())
    }

    /// Close the device, if it was opened.
    pub async fn close(&mut self) -> MxResult<()> {
        if !self.open {
            return Ok(());
        }
        if let Some(openable) = self.device.openable.clone() {
            openable.close(self).await?;
        }
        self.open = false;
        Ok(())
    }

    /// Re-establish device state.
    pub async fn resynchronize(&mut self) -> MxResult<()> {
        match self.device.openable.clone() {
            Some(openable) => openable.resynchronize(self).await,
            None => Ok(()),
        }
    }

    /// True once [`Record::construct`] succeeded.
    pub fn is_constructed(&self) -> bool {
        self.constructed
    }

    /// True while the device is open.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver.name)
            .field("num_fields", &self.fields.len())
            .field("handle", &self.handle)
            .field("open", &self.open)
            .finish()
    }
}

// =============================================================================
// Record list
// =============================================================================

/// All records of a database, in circular order starting at the list head.
#[derive(Debug)]
pub struct RecordList {
    records: HashMap<RecordId, Record>,
    order: Vec<RecordId>,
    by_name: HashMap<String, RecordId>,
    next_id: usize,
}

impl RecordList {
    /// Create a list whose head record is built from the list-head driver.
    pub fn new(list_head_driver: Arc<DriverDescriptor>, name: &str) -> MxResult<Self> {
        let mut list = Self {
            records: HashMap::new(),
            order: Vec::new(),
            by_name: HashMap::new(),
            next_id: 0,
        };
        let id = list.create_record(list_head_driver, name)?;
        if let Some(head) = list.records.get_mut(&id) {
            head.constructed = true;
            head.open = true;
        }
        Ok(list)
    }

    /// Instantiate a record and append it to the list.
    ///
    /// The record still has to be constructed and opened.
    pub fn create_record(&mut self, driver: Arc<DriverDescriptor>, name: &str) -> MxResult<RecordId> {
        if self.by_name.contains_key(name) {
            return Err(MxError::IllegalArgument(format!(
                "a record named '{}' already exists",
                name
            )));
        }
        let id = RecordId(self.next_id);
        let record = Record::new(id, name, driver)?;
        self.next_id += 1;
        self.by_name.insert(record.name.clone(), id);
        self.order.push(id);
        self.records.insert(id, record);
        Ok(id)
    }

    /// Remove a record, closing it first. The list head cannot be removed.
    pub async fn remove(&mut self, id: RecordId) -> MxResult<Record> {
        if self.order.first() == Some(&id) {
            return Err(MxError::IllegalArgument(
                "the list head record cannot be removed".to_string(),
            ));
        }
        let mut record = self
            .records
            .remove(&id)
            .ok_or_else(|| MxError::NotFound(format!("record {}", id)))?;
        self.order.retain(|other| *other != id);
        self.by_name.remove(&record.name);
        if let Err(err) = record.close().await {
            warn!(record = %record.name, error = %err, "Close failed while removing record");
        }
        info!(record = %record.name, "Record removed");
        Ok(record)
    }

    /// Close every record, last created first.
    pub async fn close_all(&mut self) {
        for id in self.order.iter().rev() {
            if let Some(record) = self.records.get_mut(id) {
                if let Err(err) = record.close().await {
                    warn!(record = %record.name, error = %err, "Close failed during shutdown");
                }
            }
        }
    }

    /// The list head record id.
    pub fn list_head(&self) -> Option<RecordId> {
        self.order.first().copied()
    }

    /// Record by id.
    pub fn get(&self, id: RecordId) -> MxResult<&Record> {
        self.records
            .get(&id)
            .ok_or_else(|| MxError::NotFound(format!("record {}", id)))
    }

    /// Mutable record by id.
    pub fn get_mut(&mut self, id: RecordId) -> MxResult<&mut Record> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| MxError::NotFound(format!("record {}", id)))
    }

    /// Record id by name.
    pub fn find(&self, name: &str) -> Option<RecordId> {
        self.by_name.get(name).copied()
    }

    /// Record by name.
    pub fn get_by_name(&self, name: &str) -> MxResult<&Record> {
        let id = self
            .find(name)
            .ok_or_else(|| MxError::NotFound(format!("record '{}'", name)))?;
        self.get(id)
    }

    /// Mutable record by name.
    pub fn get_by_name_mut(&mut self, name: &str) -> MxResult<&mut Record> {
        let id = self
            .find(name)
            .ok_or_else(|| MxError::NotFound(format!("record '{}'", name)))?;
        self.get_mut(id)
    }

    /// Record after `id`, wrapping from the last record to the list head.
    pub fn next(&self, id: RecordId) -> Option<RecordId> {
        let position = self.order.iter().position(|other| *other == id)?;
        Some(self.order[(position + 1) % self.order.len()])
    }

    /// Record before `id`, wrapping from the list head to the last record.
    pub fn previous(&self, id: RecordId) -> Option<RecordId> {
        let position = self.order.iter().position(|other| *other == id)?;
        let len = self.order.len();
        Some(self.order[(position + len - 1) % len])
    }

    /// Record ids in list order, list head first.
    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.order.iter().copied()
    }

    /// Records in list order, list head first.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Number of records, list head included.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if only the list head is present.
    pub fn is_empty(&self) -> bool {
        self.order.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Constructible, DriverEntry};
    use crate::field::{standard_fields, FieldDefault, FieldType, StorageLocation};
    use crate::registry::DriverRegistry;

    struct Plain;

    impl Constructible for Plain {
        fn create(&self, _record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
            Ok(DeviceComponents::new())
        }
    }

    fn registry() -> DriverRegistry {
        let mut fields = standard_fields();
        fields.push(FieldDefault::new("value", FieldType::Double, StorageLocation::type_struct(0)));
        let mut registry = DriverRegistry::new();
        registry
            .register_table(vec![
                DriverEntry::new("list_head", SuperclassId::LIST_HEAD, ClassId::LIST_HEAD, 1)
                    .fields(standard_fields()),
                DriverEntry::new("plain", SuperclassId::VARIABLE, ClassId::INLINE_VARIABLE, 2)
                    .constructor(Arc::new(Plain))
                    .fields(fields),
                DriverEntry::sentinel(),
            ])
            .unwrap();
        registry
    }

    fn list(registry: &DriverRegistry) -> RecordList {
        RecordList::new(registry.list_head().unwrap().clone(), "mx_database").unwrap()
    }

    #[test]
    fn new_record_carries_taxonomy() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let record = Record::new(RecordId(5), "x", driver).unwrap();
        assert_eq!(record.value_by_name("name").unwrap(), &FieldValue::String("x".into()));
        assert_eq!(record.value_by_name("mx_type").unwrap(), &FieldValue::Long(2));
        assert_eq!(
            record.value_by_name("mx_superclass").unwrap(),
            &FieldValue::Long(SuperclassId::VARIABLE.0)
        );
    }

    #[test]
    fn duplicate_record_names_are_rejected() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let mut list = list(&registry);
        list.create_record(driver.clone(), "a").unwrap();
        let err = list.create_record(driver, "a").unwrap_err();
        assert!(matches!(err, MxError::IllegalArgument(_)));
    }

    #[test]
    fn list_is_circular() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let mut list = list(&registry);
        let head = list.list_head().unwrap();
        let a = list.create_record(driver.clone(), "a").unwrap();
        let b = list.create_record(driver, "b").unwrap();
        assert_eq!(list.next(head), Some(a));
        assert_eq!(list.next(b), Some(head));
        assert_eq!(list.previous(head), Some(b));
        assert_eq!(list.previous(a), Some(head));
    }

    #[tokio::test]
    async fn removing_keeps_the_ring_intact() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let mut list = list(&registry);
        let head = list.list_head().unwrap();
        let a = list.create_record(driver.clone(), "a").unwrap();
        let b = list.create_record(driver, "b").unwrap();
        list.remove(a).await.unwrap();
        assert_eq!(list.next(head), Some(b));
        assert!(list.find("a").is_none());
        assert!(list.get(a).is_err());
        assert!(list.remove(head).await.is_err());
    }

    #[test]
    fn set_value_converts_and_checks() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let mut record = Record::new(RecordId(0), "v", driver).unwrap();
        record.set_value_by_name("value", FieldValue::Long(4)).unwrap();
        assert_eq!(record.f64_or("value", 0.0), 4.0);
        assert!(record
            .set_value_by_name("value", FieldValue::String("no".into()))
            .is_err());
        assert!(record.set_value_by_name("missing", FieldValue::Long(1)).is_err());
    }

    #[test]
    fn long_names_are_rejected() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let name = "n".repeat(MAX_RECORD_NAME_LENGTH + 1);
        assert!(matches!(
            Record::new(RecordId(0), &name, driver),
            Err(MxError::WouldExceedLimit(_))
        ));
    }

    #[test]
    fn construct_runs_once() {
        let registry = registry();
        let driver = registry.lookup_type_by_name("plain").unwrap().clone();
        let mut record = Record::new(RecordId(0), "c", driver).unwrap();
        record.construct(&ConstructContext::default()).unwrap();
        assert!(record.is_constructed());
        assert!(record.construct(&ConstructContext::default()).is_err());
    }
}
