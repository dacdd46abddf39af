//! Driver descriptors and the capability traits drivers implement.
//!
//! A driver is described by a [`DriverEntry`] in a driver table. Registering
//! the table (see [`crate::registry::DriverRegistry::register_table`]) turns
//! each entry into an immutable [`DriverDescriptor`].
//!
//! # Capabilities
//!
//! Drivers are polymorphic along three roles:
//!
//! - [`Constructible`] - builds the per-record device state. Lives on the
//!   descriptor; every driver except the list head must have one.
//! - [`Openable`] - open/close/resynchronize a constructed device.
//! - [`FieldProcessable`] - intercepts GET/PUT on selected fields.
//!
//! The constructor returns the device-level capabilities bundled in
//! [`DeviceComponents`], so a concrete driver only implements the subset its
//! class needs.
//!
//! # Example
//!
//! ```rust,ignore
//! use mx_core::driver::{Constructible, ConstructContext, DeviceComponents, DriverEntry};
//! use mx_core::taxonomy::{ClassId, SuperclassId};
//!
//! struct ThermometerDriver;
//!
//! impl Constructible for ThermometerDriver {
//!     fn create(&self, record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
//!         let device = Arc::new(Thermometer::new(record.name.clone()));
//!         Ok(DeviceComponents::new().with_processor(device))
//!     }
//! }
//!
//! let entry = DriverEntry::new("thermometer", SuperclassId::DEVICE, ClassId::ANALOG_INPUT, 42)
//!     .constructor(Arc::new(ThermometerDriver))
//!     .fields(thermometer_fields());
//! ```

use crate::error::MxResult;
use crate::field::FieldDefault;
use crate::notify::CallbackSender;
use crate::process::ProcessOp;
use crate::record::{Record, RecordId};
use crate::taxonomy::{ClassId, SuperclassId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Capability traits
// =============================================================================

/// Information handed to a constructor.
#[derive(Debug, Clone, Default)]
pub struct ConstructContext {
    /// Id the record has in its record list.
    pub record_id: Option<RecordId>,
    /// Producer end of the callback channel, when callbacks are enabled.
    pub notifier: Option<CallbackSender>,
}

/// Construction capability of a driver.
pub trait Constructible: Send + Sync {
    /// Build the device state for `record`.
    ///
    /// Field values from the device database have already been applied, so
    /// the constructor may read its configuration from the record's fields.
    fn create(&self, record: &Record, ctx: &ConstructContext) -> MxResult<DeviceComponents>;
}

/// Open/close capability of a constructed device.
#[async_trait]
pub trait Openable: Send + Sync {
    /// Connect to the device. Called once after construction.
    async fn open(&self, record: &mut Record) -> MxResult<()>;

    /// Disconnect from the device.
    async fn close(&self, _record: &mut Record) -> MxResult<()> {
        Ok(())
    }

    /// Re-establish device state after a communication problem.
    async fn resynchronize(&self, _record: &mut Record) -> MxResult<()> {
        Ok(())
    }
}

/// Process-function capability bound to individual fields.
///
/// `process` receives the owning record and the ordinal of the field being
/// accessed. For [`ProcessOp::Get`] it runs before the stored value is
/// returned and may refresh it. For [`ProcessOp::Put`] it runs after the new
/// value has been stored.
#[async_trait]
pub trait FieldProcessable: Send + Sync {
    /// Label values of the fields this function should be bound to.
    fn processed_labels(&self) -> &'static [i64];

    /// Perform the device side of a GET or PUT.
    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()>;
}

/// Device-level capabilities produced by a constructor.
#[derive(Clone, Default)]
pub struct DeviceComponents {
    /// Bound to every field whose label value it lists.
    pub processor: Option<Arc<dyn FieldProcessable>>,
    /// Open/close hooks.
    pub openable: Option<Arc<dyn Openable>>,
}

impl DeviceComponents {
    /// Empty component set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a process function.
    pub fn with_processor(mut self, processor: Arc<dyn FieldProcessable>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Attach open/close hooks.
    pub fn with_openable(mut self, openable: Arc<dyn Openable>) -> Self {
        self.openable = Some(openable);
        self
    }
}

impl fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("processor", &self.processor.is_some())
            .field("openable", &self.openable.is_some())
            .finish()
    }
}

/// Hook run once while a driver is registered.
///
/// It may adjust the driver's field defaults (for example to size arrays).
pub type InitializeDriverFn = fn(&mut DriverDescriptor) -> MxResult<()>;

// =============================================================================
// Driver tables
// =============================================================================

/// Type id requesting dynamic allocation at registration.
pub const DYNAMIC_TYPE: i64 = -1;

/// Wildcard type id for [`crate::registry::verify_driver_type`].
pub const ANY_TYPE: i64 = -1;

/// One row of a driver table.
#[derive(Clone)]
pub struct DriverEntry {
    /// Driver name, unique across the registry.
    pub name: String,
    /// Superclass; [`SuperclassId::SENTINEL`] terminates a table.
    pub superclass: SuperclassId,
    /// Class within the superclass.
    pub class: ClassId,
    /// Static type id, or negative for dynamic allocation.
    pub type_id: i64,
    /// Construction capability.
    pub constructor: Option<Arc<dyn Constructible>>,
    /// Registration hook.
    pub initialize_driver: Option<InitializeDriverFn>,
    /// Field defaults, if the driver declares any.
    pub field_defaults: Option<Vec<FieldDefault>>,
}

impl DriverEntry {
    /// A driver with no capabilities and no fields.
    pub fn new(name: impl Into<String>, superclass: SuperclassId, class: ClassId, type_id: i64) -> Self {
        Self {
            name: name.into(),
            superclass,
            class,
            type_id,
            constructor: None,
            initialize_driver: None,
            field_defaults: None,
        }
    }

    /// The entry that terminates a driver table.
    pub fn sentinel() -> Self {
        Self::new("", SuperclassId::SENTINEL, ClassId(0), 0)
    }

    /// True for the table terminator.
    pub fn is_sentinel(&self) -> bool {
        self.superclass == SuperclassId::SENTINEL
    }

    /// Attach a constructor.
    pub fn constructor(mut self, constructor: Arc<dyn Constructible>) -> Self {
        self.constructor = Some(constructor);
        self
    }

    /// Attach a registration hook.
    pub fn initialize_with(mut self, hook: InitializeDriverFn) -> Self {
        self.initialize_driver = Some(hook);
        self
    }

    /// Declare field defaults.
    pub fn fields(mut self, fields: Vec<FieldDefault>) -> Self {
        self.field_defaults = Some(fields);
        self
    }
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry")
            .field("name", &self.name)
            .field("superclass", &self.superclass)
            .field("class", &self.class)
            .field("type_id", &self.type_id)
            .field("constructor", &self.constructor.is_some())
            .field(
                "num_fields",
                &self.field_defaults.as_ref().map_or(0, Vec::len),
            )
            .finish()
    }
}

/// A registered driver. Immutable once registration finishes.
pub struct DriverDescriptor {
    /// Driver name.
    pub name: String,
    /// Superclass id.
    pub superclass: SuperclassId,
    /// Class id.
    pub class: ClassId,
    /// Resolved type id (never negative).
    pub type_id: i64,
    /// Construction capability.
    pub constructor: Option<Arc<dyn Constructible>>,
    /// Field defaults with ordinals and type information bound.
    pub field_defaults: Vec<FieldDefault>,
    /// True if the type id came from the dynamic counter.
    pub dynamic: bool,
}

impl DriverDescriptor {
    /// Number of declared fields.
    pub fn num_fields(&self) -> usize {
        self.field_defaults.len()
    }

    /// Find a field default by name.
    pub fn field_default(&self, name: &str) -> Option<&FieldDefault> {
        self.field_defaults.iter().find(|field| field.name == name)
    }
}

impl fmt::Debug for DriverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverDescriptor")
            .field("name", &self.name)
            .field("superclass", &self.superclass)
            .field("class", &self.class)
            .field("type_id", &self.type_id)
            .field("dynamic", &self.dynamic)
            .field("num_fields", &self.field_defaults.len())
            .finish()
    }
}
