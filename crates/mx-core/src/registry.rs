//! Driver registry.
//!
//! The registry is the process-wide catalog of drivers, keyed by the
//! superclass/class/type taxonomy. It is populated once during startup from
//! driver tables and is read-only afterwards, so it needs no locking: the
//! owning server context hands out `&DriverRegistry` or `Arc<DriverDescriptor>`.
//!
//! # Registration
//!
//! ```text
//!  register_table([list_head, a, b, SENTINEL])   first call: list_head seeds the list
//!  register_table([c, d, SENTINEL])              later calls: plain append
//!
//!  drivers: list_head -> a -> b -> c -> d
//! ```
//!
//! Every appended entry runs through [`DriverRegistry::initialize_entry`],
//! which binds taxonomy information to the standard fields, runs the
//! driver's registration hook, numbers the fields and resolves the type id.
//!
//! # Type ids
//!
//! Static ids live below [`DYNAMIC_TYPE_BASE`]. A negative id asks for the
//! next value of a monotonic counter starting at [`DYNAMIC_TYPE_BASE`]. The
//! counter is only touched during registration, which is single threaded.

use crate::driver::{DriverDescriptor, DriverEntry, ANY_TYPE};
use crate::error::{MxError, MxResult, VerifyFailure, VerifyProblem};
use crate::field::{StorageLocation, TypeInfo};
use crate::limits::{DYNAMIC_TYPE_BASE, MIN_STANDARD_FIELDS};
use crate::record::Record;
use crate::taxonomy::{self, ClassEntry, ClassId, SuperclassEntry, SuperclassId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Catalog of registered drivers.
pub struct DriverRegistry {
    drivers: Vec<Arc<DriverDescriptor>>,
    next_dynamic_type: i64,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Create an empty registry. The first registered table seeds it.
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
            next_dynamic_type: DYNAMIC_TYPE_BASE,
        }
    }

    /// Create an empty registry whose dynamic counter starts at `start`.
    ///
    /// Values below [`DYNAMIC_TYPE_BASE`] are raised to it.
    pub fn with_dynamic_start(start: i64) -> Self {
        Self {
            drivers: Vec::new(),
            next_dynamic_type: start.max(DYNAMIC_TYPE_BASE),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Append the entries of a driver table, stopping at the sentinel.
    ///
    /// On the very first call the table's first entry becomes the list head
    /// (conventionally the list-head pseudo-driver) and the remaining entries
    /// are appended after it. Later calls append every entry.
    ///
    /// Entries registered before a failing entry stay registered. Returns the
    /// number of drivers appended.
    pub fn register_table(&mut self, table: Vec<DriverEntry>) -> MxResult<usize> {
        let mut entries = table.into_iter().take_while(|entry| !entry.is_sentinel());
        let mut appended = 0;

        if self.drivers.is_empty() {
            let seed = entries.next().ok_or_else(|| {
                MxError::NullArgument("the first driver table has no list head entry".to_string())
            })?;
            let descriptor = self.initialize_entry(seed)?;
            debug!(driver = %descriptor.name, "Seeded driver list");
            self.drivers.push(Arc::new(descriptor));
            appended += 1;
        }

        for entry in entries {
            self.check_unique(&entry)?;
            let descriptor = self.initialize_entry(entry)?;
            debug!(
                driver = %descriptor.name,
                type_id = descriptor.type_id,
                dynamic = descriptor.dynamic,
                "Registered driver"
            );
            self.drivers.push(Arc::new(descriptor));
            appended += 1;
        }

        info!(appended, total = self.drivers.len(), "Driver table registered");
        Ok(appended)
    }

    /// Turn a table entry into a descriptor.
    ///
    /// 1. binds the `mx_superclass`, `mx_class` and `mx_type` fields to their
    ///    taxonomy descriptors,
    /// 2. runs the driver's registration hook,
    /// 3. numbers the field defaults by position,
    /// 4. resolves the type id: static ids at or above [`DYNAMIC_TYPE_BASE`]
    ///    are illegal and negative ids get the next dynamic id.
    ///
    /// A dynamic id is only taken once the hook has succeeded, so the hook
    /// still sees the negative placeholder id.
    pub fn initialize_entry(&mut self, entry: DriverEntry) -> MxResult<DriverDescriptor> {
        if entry.name.is_empty() {
            return Err(MxError::NullArgument(
                "driver entry has an empty name".to_string(),
            ));
        }

        let (superclass, class) = taxonomy_of(&entry)?;

        let dynamic = entry.type_id < 0;
        if entry.type_id >= DYNAMIC_TYPE_BASE {
            return Err(MxError::IllegalArgument(format!(
                "driver '{}' declares static type id {} inside the dynamic range (>= {})",
                entry.name, entry.type_id, DYNAMIC_TYPE_BASE
            )));
        }

        let has_fields = entry.field_defaults.is_some();
        let mut descriptor = DriverDescriptor {
            name: entry.name,
            superclass: entry.superclass,
            class: entry.class,
            type_id: entry.type_id,
            constructor: entry.constructor,
            field_defaults: entry.field_defaults.unwrap_or_default(),
            dynamic,
        };

        if has_fields {
            for field in descriptor.field_defaults.iter_mut() {
                field.typeinfo = match field.name.as_str() {
                    "mx_superclass" => Some(TypeInfo::Superclass(superclass)),
                    "mx_class" => Some(TypeInfo::Class(class)),
                    "mx_type" => Some(TypeInfo::Type {
                        name: descriptor.name.clone(),
                        type_id: descriptor.type_id,
                    }),
                    _ => field.typeinfo.take(),
                };
            }
        }

        if let Some(hook) = entry.initialize_driver {
            hook(&mut descriptor).map_err(|err| {
                warn!(driver = %descriptor.name, error = %err, "Driver registration hook failed");
                err
            })?;
        }

        if dynamic {
            let type_id = self.allocate_dynamic_type()?;
            descriptor.type_id = type_id;
            for field in descriptor.field_defaults.iter_mut() {
                if let Some(TypeInfo::Type { type_id: bound, .. }) = field.typeinfo.as_mut() {
                    *bound = type_id;
                }
            }
        }

        for (ordinal, field) in descriptor.field_defaults.iter_mut().enumerate() {
            field.ordinal = ordinal as i64;
        }

        Ok(descriptor)
    }

    fn allocate_dynamic_type(&mut self) -> MxResult<i64> {
        let type_id = self.next_dynamic_type;
        self.next_dynamic_type = type_id.checked_add(1).ok_or_else(|| {
            MxError::WouldExceedLimit("dynamic driver type ids are exhausted".to_string())
        })?;
        Ok(type_id)
    }

    fn check_unique(&self, entry: &DriverEntry) -> MxResult<()> {
        if self.lookup_type_by_name(&entry.name).is_some() {
            return Err(MxError::IllegalArgument(format!(
                "driver '{}' is already registered",
                entry.name
            )));
        }
        if entry.type_id >= 0 {
            if let Some(existing) = self.lookup_type_by_type(entry.type_id) {
                return Err(MxError::IllegalArgument(format!(
                    "driver '{}' reuses type id {} of driver '{}'",
                    entry.name, entry.type_id, existing.name
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find a superclass by name.
    pub fn lookup_superclass_by_name(&self, name: &str) -> Option<&'static SuperclassEntry> {
        taxonomy::lookup_superclass_by_name(name)
    }

    /// Find a superclass by id.
    pub fn lookup_superclass_by_type(&self, id: SuperclassId) -> Option<&'static SuperclassEntry> {
        taxonomy::lookup_superclass_by_type(id)
    }

    /// Find a class by name.
    pub fn lookup_class_by_name(&self, name: &str) -> Option<&'static ClassEntry> {
        taxonomy::lookup_class_by_name(name)
    }

    /// Find a class by id.
    pub fn lookup_class_by_type(&self, id: ClassId) -> Option<&'static ClassEntry> {
        taxonomy::lookup_class_by_type(id)
    }

    /// Find a registered driver by name.
    pub fn lookup_type_by_name(&self, name: &str) -> Option<&Arc<DriverDescriptor>> {
        self.drivers.iter().find(|driver| driver.name == name)
    }

    /// Find a registered driver by type id.
    pub fn lookup_type_by_type(&self, type_id: i64) -> Option<&Arc<DriverDescriptor>> {
        self.drivers.iter().find(|driver| driver.type_id == type_id)
    }

    /// The driver a record was created from.
    pub fn driver_for_record(&self, record: &Record) -> MxResult<&Arc<DriverDescriptor>> {
        self.lookup_type_by_type(record.type_id).ok_or_else(|| {
            MxError::NotFound(format!(
                "no driver with type id {} for record '{}'",
                record.type_id, record.name
            ))
        })
    }

    /// The list-head driver, if any table has been registered.
    pub fn list_head(&self) -> Option<&Arc<DriverDescriptor>> {
        self.drivers.first()
    }

    /// Registered drivers in registration order.
    pub fn drivers(&self) -> impl Iterator<Item = &Arc<DriverDescriptor>> {
        self.drivers.iter()
    }

    /// Number of registered drivers, list head included.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// True before the first table is registered.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    // =========================================================================
    // Verification
    // =========================================================================

    fn is_list_head(&self, driver: &DriverDescriptor) -> bool {
        self.drivers
            .first()
            .is_some_and(|head| std::ptr::eq(Arc::as_ptr(head), driver))
    }

    /// Structural checks for one driver. An empty result means it passed.
    ///
    /// - every driver except the list head has a constructor,
    /// - at least [`MIN_STANDARD_FIELDS`] fields are declared,
    /// - no two fields share a `(structure, offset)` storage location.
    pub fn verify(&self, driver: &DriverDescriptor) -> Vec<VerifyFailure> {
        let mut failures = Vec::new();
        let mut fail = |problem| {
            failures.push(VerifyFailure {
                driver: driver.name.clone(),
                problem,
            })
        };

        if driver.constructor.is_none() && !self.is_list_head(driver) {
            fail(VerifyProblem::MissingConstructor);
        }

        if driver.field_defaults.len() < MIN_STANDARD_FIELDS {
            fail(VerifyProblem::TooFewFields {
                found: driver.field_defaults.len(),
                required: MIN_STANDARD_FIELDS,
            });
        }

        let mut seen: HashMap<StorageLocation, &str> = HashMap::new();
        for field in &driver.field_defaults {
            if let Some(first) = seen.insert(field.storage, &field.name) {
                fail(VerifyProblem::DuplicateStorage {
                    first: first.to_string(),
                    second: field.name.clone(),
                    location: field.storage.to_string(),
                });
            }
        }

        failures
    }

    /// Verify every registered driver, reporting all failures at once.
    pub fn verify_all(&self) -> MxResult<()> {
        let failures: Vec<VerifyFailure> = self
            .drivers
            .iter()
            .flat_map(|driver| self.verify(driver))
            .collect();

        if failures.is_empty() {
            info!(drivers = self.drivers.len(), "Driver verification passed");
            Ok(())
        } else {
            for failure in &failures {
                warn!(driver = %failure.driver, problem = %failure.problem, "Driver failed verification");
            }
            Err(MxError::VerificationFailed(failures))
        }
    }
}

fn taxonomy_of(entry: &DriverEntry) -> MxResult<(&'static SuperclassEntry, &'static ClassEntry)> {
    let superclass = taxonomy::lookup_superclass_by_type(entry.superclass).ok_or_else(|| {
        MxError::NotFound(format!(
            "driver '{}' names unknown superclass {}",
            entry.name, entry.superclass.0
        ))
    })?;
    let class = taxonomy::lookup_class_by_type(entry.class).ok_or_else(|| {
        MxError::NotFound(format!(
            "driver '{}' names unknown class {}",
            entry.name, entry.class.0
        ))
    })?;
    if class.superclass != superclass.id {
        return Err(MxError::CorruptDataStructure(format!(
            "driver '{}': class '{}' does not belong to superclass '{}'",
            entry.name, class.name, superclass.name
        )));
    }
    Ok((superclass, class))
}

/// True if the record matches the given taxonomy, where
/// [`SuperclassId::ANY`], [`ClassId::ANY`] and [`ANY_TYPE`] match anything.
pub fn verify_driver_type(record: &Record, superclass: SuperclassId, class: ClassId, type_id: i64) -> bool {
    let superclass_matches = superclass == SuperclassId::ANY || superclass == record.superclass;
    let class_matches = class == ClassId::ANY || class == record.class;
    let type_matches = type_id == ANY_TYPE || type_id == record.type_id;
    superclass_matches && class_matches && type_matches
}
