//! Soft (simulated) drivers for rust-mx
//!
//! This crate provides devices that behave like hardware with nothing
//! attached. They are registered through the same driver tables as real
//! drivers and go through the same GET/PUT dispatch.
//!
//! # Available Drivers
//!
//! | driver            | superclass / class  | notes                                  |
//! |-------------------|---------------------|----------------------------------------|
//! | `list_head`       | list_head           | heads the record list, no constructor  |
//! | `soft_motor`      | device / motor      | constant-speed moves, limits           |
//! | `dynamic_motor`   | device / motor      | same as `soft_motor`, dynamic type id  |
//! | `soft_scaler`     | device / scaler     | counts at `count_rate`, overflow       |
//! | `soft_mca`        | device / mca        | background acquisition, ROIs           |
//! | `soft_ainput`     | device / analog_in  | noisy voltage through a 16-bit ADC     |
//! | `*_variable`      | variable / inline   | long, double and string values         |
//!
//! # Registration
//!
//! ```rust,ignore
//! use mx_core::DriverRegistry;
//!
//! let mut registry = DriverRegistry::new();
//! mx_driver_soft::register_all(&mut registry)?;
//! registry.verify_all()?;
//! ```
//!
//! Every device accepts a [`FaultInjector`] so tests can make individual
//! operations fail.

pub mod common;
pub mod list_head;
pub mod soft_ainput;
pub mod soft_mca;
pub mod soft_motor;
pub mod soft_scaler;
pub mod variables;

pub use common::{FaultInjector, SoftRng};
pub use list_head::LIST_HEAD_RECORD_NAME;
pub use soft_ainput::SoftAinput;
pub use soft_mca::SoftMca;
pub use soft_motor::SoftMotor;
pub use soft_scaler::SoftScaler;

use mx_core::{DriverEntry, DriverRegistry, MxResult};

/// The static driver table, list head first, sentinel last.
pub fn driver_table(faults: &FaultInjector) -> Vec<DriverEntry> {
    let mut table = vec![
        list_head::entry(),
        soft_motor::entry(faults.clone()),
        soft_scaler::entry(faults.clone()),
        soft_mca::entry(faults.clone()),
        soft_ainput::entry(faults.clone()),
    ];
    table.extend(variables::entries());
    table.push(DriverEntry::sentinel());
    table
}

/// Drivers whose type ids are allocated at registration.
pub fn dynamic_driver_table(faults: &FaultInjector) -> Vec<DriverEntry> {
    vec![soft_motor::dynamic_entry(faults.clone()), DriverEntry::sentinel()]
}

/// Register every soft driver. Returns the number registered.
pub fn register_all(registry: &mut DriverRegistry) -> MxResult<usize> {
    register_all_with(registry, &FaultInjector::none())
}

/// [`register_all`] with a shared fault injector.
pub fn register_all_with(registry: &mut DriverRegistry, faults: &FaultInjector) -> MxResult<usize> {
    let static_count = registry.register_table(driver_table(faults))?;
    let dynamic_count = registry.register_table(dynamic_driver_table(faults))?;
    Ok(static_count + dynamic_count)
}

#[cfg(test)]
pub(crate) mod testing {
    use mx_core::{ConstructContext, DriverEntry, DriverRegistry, FieldValue, Record, RecordId};

    pub fn registry_with(entry: DriverEntry) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry
            .register_table(vec![crate::list_head::entry(), entry, DriverEntry::sentinel()])
            .unwrap();
        registry.verify_all().unwrap();
        registry
    }

    pub async fn build_record(entry: DriverEntry, name: &str, values: &[(&str, FieldValue)]) -> Record {
        build_record_with(entry, name, values, ConstructContext::default()).await
    }

    pub async fn build_record_with(
        entry: DriverEntry,
        name: &str,
        values: &[(&str, FieldValue)],
        ctx: ConstructContext,
    ) -> Record {
        let driver_name = entry.name.clone();
        let registry = registry_with(entry);
        let driver = registry.lookup_type_by_name(&driver_name).unwrap().clone();
        let mut record = Record::new(ctx.record_id.unwrap_or(RecordId(1)), name, driver).unwrap();
        for (field, value) in values {
            record.set_value_by_name(field, value.clone()).unwrap();
        }
        record.construct(&ctx).unwrap();
        record.open().await.unwrap();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::limits::DYNAMIC_TYPE_BASE;

    #[test]
    fn every_soft_driver_verifies() {
        let mut registry = DriverRegistry::new();
        let count = register_all(&mut registry).unwrap();
        assert_eq!(count, registry.len());
        registry.verify_all().unwrap();
        assert_eq!(registry.list_head().unwrap().name, "list_head");
    }

    #[test]
    fn dynamic_motor_gets_a_dynamic_id() {
        let mut registry = DriverRegistry::new();
        register_all(&mut registry).unwrap();
        let dynamic = registry.lookup_type_by_name("dynamic_motor").unwrap();
        assert!(dynamic.dynamic);
        assert_eq!(dynamic.type_id, DYNAMIC_TYPE_BASE);
        let soft = registry.lookup_type_by_name("soft_motor").unwrap();
        assert_eq!(soft.class, dynamic.class);
        assert_ne!(soft.type_id, dynamic.type_id);
    }

    #[test]
    fn registering_twice_is_rejected() {
        let mut registry = DriverRegistry::new();
        register_all(&mut registry).unwrap();
        assert!(registry.register_table(driver_table(&FaultInjector::none())).is_err());
    }
}
