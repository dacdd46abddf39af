//! Listing of the driver taxonomy, as printed by `mxserver driverinfo`.

use mx_core::taxonomy::{ClassEntry, SuperclassEntry, CLASS_TABLE, SUPERCLASS_TABLE};
use mx_core::{DriverRegistry, FieldFlags, FieldType};
use serde::Serialize;
use std::fmt::Write;

/// Machine-readable form of the listing.
#[derive(Debug, Serialize)]
pub struct DriverInfo {
    /// Static superclass table.
    pub superclasses: &'static [SuperclassEntry],
    /// Static class table.
    pub classes: &'static [ClassEntry],
    /// Registered drivers, ordered by type id.
    pub drivers: Vec<DriverSummary>,
}

/// One registered driver.
#[derive(Debug, Serialize)]
pub struct DriverSummary {
    /// Driver name.
    pub name: String,
    /// Type id.
    pub type_id: i64,
    /// Class name.
    pub class: String,
    /// Type id was assigned dynamically.
    pub dynamic: bool,
    /// Declared fields.
    pub fields: Vec<FieldSummary>,
}

/// One declared field.
#[derive(Debug, Serialize)]
pub struct FieldSummary {
    /// Field name.
    pub name: String,
    /// Position in the record's field array.
    pub ordinal: i64,
    /// Element type.
    pub field_type: FieldType,
    /// Access flags.
    pub flags: Vec<&'static str>,
}

/// Collect the listing.
pub fn collect(registry: &DriverRegistry) -> DriverInfo {
    let mut drivers: Vec<DriverSummary> = registry
        .drivers()
        .map(|driver| DriverSummary {
            name: driver.name.clone(),
            type_id: driver.type_id,
            class: registry
                .lookup_class_by_type(driver.class)
                .map_or("?", |c| c.name)
                .to_string(),
            dynamic: driver.dynamic,
            fields: driver
                .field_defaults
                .iter()
                .map(|field| FieldSummary {
                    name: field.name.clone(),
                    ordinal: field.ordinal,
                    field_type: field.field_type,
                    flags: flag_names(field.flags),
                })
                .collect(),
        })
        .collect();
    drivers.sort_by_key(|driver| driver.type_id);
    DriverInfo {
        superclasses: SUPERCLASS_TABLE,
        classes: CLASS_TABLE,
        drivers,
    }
}

/// The listing as pretty-printed JSON.
pub fn render_json(registry: &DriverRegistry) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&collect(registry))
}

/// Render superclasses, classes and registered drivers with their fields.
pub fn render(registry: &DriverRegistry) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Superclasses:");
    for entry in SUPERCLASS_TABLE {
        let _ = writeln!(out, "  {:<20} {}", entry.name, entry.id);
    }

    let _ = writeln!(out, "\nClasses:");
    for entry in CLASS_TABLE {
        let superclass = registry
            .lookup_superclass_by_type(entry.superclass)
            .map_or("?", |s| s.name);
        let _ = writeln!(out, "  {:<20} {:<6} {}", entry.name, entry.id, superclass);
    }

    let _ = writeln!(out, "\nDrivers:");
    for driver in collect(registry).drivers {
        let dynamic = if driver.dynamic { " (dynamic)" } else { "" };
        let _ = writeln!(
            out,
            "  {} [type {}{}, class {}]",
            driver.name, driver.type_id, dynamic, driver.class
        );
        for field in &driver.fields {
            let _ = writeln!(
                out,
                "    {:>3} {:<24} {:<8} {}",
                field.ordinal,
                field.name,
                field.field_type.name(),
                field.flags.join(",")
            );
        }
    }

    out
}

fn flag_names(flags: FieldFlags) -> Vec<&'static str> {
    [
        (FieldFlags::READ_ONLY, "read-only"),
        (FieldFlags::NO_ACCESS, "no-access"),
        (FieldFlags::POLL, "poll"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, name)| name)
    .collect()
}
