//! `mx-core`
//!
//! Core types for rust-mx: the driver registry, records and their fields,
//! process-function dispatch, and handle tables.
//!
//! ## Layers
//!
//! - **Registry**: every driver is described once by a [`DriverEntry`] and
//!   registered into a [`DriverRegistry`], keyed by superclass, class and type.
//! - **Records**: a [`Record`] is a named driver instance owning an array of
//!   typed [`RecordField`]s. Records live in a [`RecordList`].
//! - **Dispatch**: remote reads and writes go through [`get_field_value`] and
//!   [`put_field_value`], which run whatever [`FieldProcessable`] the driver
//!   bound to the field.
//! - **Handles**: [`HandleTable`] maps records (and other server objects) to
//!   small integers that can cross the wire.
//!
//! ## Key Types
//!
//! - [`MxError`]: error kinds shared by every layer, with stable wire codes
//! - [`FieldValue`]: the value stored in a field
//! - [`CallbackSender`]: thread-safe producer end of the callback channel
//!
//! ## Example
//!
//! ```rust,ignore
//! use mx_core::{DriverRegistry, RecordList, ConstructContext, get_field_value};
//!
//! let mut registry = DriverRegistry::new();
//! mx_driver_soft::register_all(&mut registry)?;
//! registry.verify_all()?;
//!
//! let head = registry.list_head().cloned().unwrap();
//! let mut records = RecordList::new(head, "mx_database")?;
//! let motor = registry.lookup_type_by_name("soft_motor").cloned().unwrap();
//! let id = records.create_record(motor, "m1")?;
//! let record = records.get_mut(id)?;
//! record.construct(&ConstructContext::default())?;
//! record.open().await?;
//! let position = get_field_value(record, record.field_index("position").unwrap()).await?;
//! ```

pub mod driver;
pub mod error;
pub mod field;
pub mod handle;
pub mod limits;
pub mod notify;
pub mod process;
pub mod record;
pub mod registry;
pub mod taxonomy;

pub use driver::{
    ConstructContext, Constructible, DeviceComponents, DriverDescriptor, DriverEntry,
    FieldProcessable, Openable, ANY_TYPE, DYNAMIC_TYPE,
};
pub use error::{MxError, MxResult, VerifyFailure, VerifyProblem};
pub use field::{
    standard_fields, FieldDefault, FieldFlags, FieldShape, FieldType, FieldValue, RecordField,
    StorageLocation, NO_LABEL_VALUE, REC_RESYNCHRONIZE,
};
pub use handle::HandleTable;
pub use notify::{CallbackMessage, CallbackSender, FieldAddress};
pub use process::{get_field_value, process_record_field, put_field_value, unknown_label, ProcessOp};
pub use record::{Record, RecordId, RecordList};
pub use registry::{verify_driver_type, DriverRegistry};
pub use taxonomy::{ClassId, SuperclassId};
