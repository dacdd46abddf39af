//! Superclass and class tables.
//!
//! Every driver sits in a three-level taxonomy: a superclass (interface,
//! device, variable, ...), a class within that superclass (motor, scaler,
//! rs232, ...) and finally its own type. The first two levels are fixed and
//! small, so they live in static tables scanned linearly. Types are
//! registered at runtime by [`crate::registry::DriverRegistry`].

use serde::Serialize;
use std::fmt;

/// Superclass identifier. Zero is reserved for table sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SuperclassId(pub i64);

/// Class identifier. Zero is reserved for table sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassId(pub i64);

impl SuperclassId {
    /// Matches any superclass in [`crate::registry::verify_driver_type`].
    pub const ANY: SuperclassId = SuperclassId(-1);
    /// Sentinel terminating a driver table.
    pub const SENTINEL: SuperclassId = SuperclassId(0);
    /// Record list head bookkeeping.
    pub const LIST_HEAD: SuperclassId = SuperclassId(1);
    /// Communication interfaces.
    pub const INTERFACE: SuperclassId = SuperclassId(2);
    /// Devices.
    pub const DEVICE: SuperclassId = SuperclassId(3);
    /// Scans.
    pub const SCAN: SuperclassId = SuperclassId(4);
    /// Variables.
    pub const VARIABLE: SuperclassId = SuperclassId(5);
    /// Servers.
    pub const SERVER: SuperclassId = SuperclassId(6);
}

impl ClassId {
    /// Matches any class in [`crate::registry::verify_driver_type`].
    pub const ANY: ClassId = ClassId(-1);
    /// List head class.
    pub const LIST_HEAD: ClassId = ClassId(1);

    /// RS-232 interface.
    pub const RS232: ClassId = ClassId(100);
    /// GPIB interface.
    pub const GPIB: ClassId = ClassId(101);
    /// Generic controller interface.
    pub const CONTROLLER: ClassId = ClassId(102);
    /// Port I/O interface.
    pub const PORTIO: ClassId = ClassId(103);
    /// VME bus interface.
    pub const VME: ClassId = ClassId(104);
    /// USB interface.
    pub const USB: ClassId = ClassId(105);

    /// Analog input.
    pub const ANALOG_INPUT: ClassId = ClassId(200);
    /// Analog output.
    pub const ANALOG_OUTPUT: ClassId = ClassId(201);
    /// Digital input.
    pub const DIGITAL_INPUT: ClassId = ClassId(202);
    /// Digital output.
    pub const DIGITAL_OUTPUT: ClassId = ClassId(203);
    /// Motor.
    pub const MOTOR: ClassId = ClassId(204);
    /// Scaler.
    pub const SCALER: ClassId = ClassId(205);
    /// Timer.
    pub const TIMER: ClassId = ClassId(206);
    /// Amplifier.
    pub const AMPLIFIER: ClassId = ClassId(207);
    /// Relay.
    pub const RELAY: ClassId = ClassId(208);
    /// Multichannel analyzer.
    pub const MCA: ClassId = ClassId(209);
    /// Multichannel scaler.
    pub const MCS: ClassId = ClassId(210);
    /// Area detector.
    pub const AREA_DETECTOR: ClassId = ClassId(211);

    /// Linear scan.
    pub const LINEAR_SCAN: ClassId = ClassId(300);

    /// Variable stored in the record itself.
    pub const INLINE_VARIABLE: ClassId = ClassId(400);
    /// Variable computed from other records.
    pub const CALC_VARIABLE: ClassId = ClassId(401);

    /// Network server connection.
    pub const NETWORK_SERVER: ClassId = ClassId(500);
}

/// Entry of the static superclass table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuperclassEntry {
    /// Name used in device databases and listings.
    pub name: &'static str,
    /// Numeric id.
    pub id: SuperclassId,
}

/// Entry of the static class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassEntry {
    /// Name used in device databases and listings.
    pub name: &'static str,
    /// Numeric id.
    pub id: ClassId,
    /// Superclass this class belongs to.
    pub superclass: SuperclassId,
}

/// Static superclass table.
pub static SUPERCLASS_TABLE: &[SuperclassEntry] = &[
    SuperclassEntry { name: "list_head_sclass", id: SuperclassId::LIST_HEAD },
    SuperclassEntry { name: "interface", id: SuperclassId::INTERFACE },
    SuperclassEntry { name: "device", id: SuperclassId::DEVICE },
    SuperclassEntry { name: "scan", id: SuperclassId::SCAN },
    SuperclassEntry { name: "variable", id: SuperclassId::VARIABLE },
    SuperclassEntry { name: "server", id: SuperclassId::SERVER },
];

const fn class(name: &'static str, id: ClassId, superclass: SuperclassId) -> ClassEntry {
    ClassEntry {
        name,
        id,
        superclass,
    }
}

/// Static class table.
pub static CLASS_TABLE: &[ClassEntry] = &[
    class("list_head_class", ClassId::LIST_HEAD, SuperclassId::LIST_HEAD),
    // ===== Interface classes =====
    class("rs232", ClassId::RS232, SuperclassId::INTERFACE),
    class("gpib", ClassId::GPIB, SuperclassId::INTERFACE),
    class("controller", ClassId::CONTROLLER, SuperclassId::INTERFACE),
    class("generic", ClassId::CONTROLLER, SuperclassId::INTERFACE),
    class("portio", ClassId::PORTIO, SuperclassId::INTERFACE),
    class("vme", ClassId::VME, SuperclassId::INTERFACE),
    class("usb", ClassId::USB, SuperclassId::INTERFACE),
    // ===== Device classes =====
    class("analog_input", ClassId::ANALOG_INPUT, SuperclassId::DEVICE),
    class("analog_output", ClassId::ANALOG_OUTPUT, SuperclassId::DEVICE),
    class("digital_input", ClassId::DIGITAL_INPUT, SuperclassId::DEVICE),
    class("digital_output", ClassId::DIGITAL_OUTPUT, SuperclassId::DEVICE),
    class("motor", ClassId::MOTOR, SuperclassId::DEVICE),
    class("scaler", ClassId::SCALER, SuperclassId::DEVICE),
    class("timer", ClassId::TIMER, SuperclassId::DEVICE),
    class("amplifier", ClassId::AMPLIFIER, SuperclassId::DEVICE),
    class("relay", ClassId::RELAY, SuperclassId::DEVICE),
    class("mca", ClassId::MCA, SuperclassId::DEVICE),
    class("mcs", ClassId::MCS, SuperclassId::DEVICE),
    class("area_detector", ClassId::AREA_DETECTOR, SuperclassId::DEVICE),
    // ===== Scan classes =====
    class("linear_scan", ClassId::LINEAR_SCAN, SuperclassId::SCAN),
    // ===== Variable classes =====
    class("inline", ClassId::INLINE_VARIABLE, SuperclassId::VARIABLE),
    class("calc", ClassId::CALC_VARIABLE, SuperclassId::VARIABLE),
    // ===== Server classes =====
    class("network_server", ClassId::NETWORK_SERVER, SuperclassId::SERVER),
];

/// Find a superclass by name.
pub fn lookup_superclass_by_name(name: &str) -> Option<&'static SuperclassEntry> {
    SUPERCLASS_TABLE.iter().find(|entry| entry.name == name)
}

/// Find a superclass by id.
pub fn lookup_superclass_by_type(id: SuperclassId) -> Option<&'static SuperclassEntry> {
    SUPERCLASS_TABLE.iter().find(|entry| entry.id == id)
}

/// Find a class by name.
pub fn lookup_class_by_name(name: &str) -> Option<&'static ClassEntry> {
    CLASS_TABLE.iter().find(|entry| entry.name == name)
}

/// Find a class by id.
///
/// Several names may share one id ("controller" and "generic"); the first
/// entry wins so every caller sees the same descriptor.
pub fn lookup_class_by_type(id: ClassId) -> Option<&'static ClassEntry> {
    CLASS_TABLE.iter().find(|entry| entry.id == id)
}

impl fmt::Display for SuperclassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match lookup_superclass_by_type(*self) {
            Some(entry) => write!(f, "{}", entry.name),
            None => write!(f, "superclass#{}", self.0),
        }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match lookup_class_by_type(*self) {
            Some(entry) => write!(f, "{}", entry.name),
            None => write!(f, "class#{}", self.0),
        }
    }
}
