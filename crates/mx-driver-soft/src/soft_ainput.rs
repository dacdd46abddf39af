//! Simulated analog input.
//!
//! Reads a configured voltage plus uniform noise through a 16-bit, ±10 V
//! converter. `value` is `offset + scale * raw_value`.

use crate::common::{FaultInjector, SoftRng};
use async_trait::async_trait;
use mx_core::field::FieldFlags;
use mx_core::{
    standard_fields, unknown_label, ClassId, ConstructContext, Constructible, DeviceComponents,
    DriverEntry, FieldDefault, FieldProcessable, FieldType, FieldValue, MxResult, ProcessOp, Record,
    StorageLocation, SuperclassId,
};
use std::sync::Arc;

/// Static type id of `soft_ainput`.
pub const SOFT_AINPUT_TYPE: i64 = 40;

/// Converter counts per volt (16 bits over ±10 V).
pub const COUNTS_PER_VOLT: f64 = 3276.8;

const RAW_MIN: i64 = -32768;
const RAW_MAX: i64 = 32767;

/// Label values of the analog input fields.
pub mod label {
    /// `value`
    pub const VALUE: i64 = 2301;
    /// `raw_value`
    pub const RAW_VALUE: i64 = 2302;
}

static PROCESSED: &[i64] = &[label::VALUE, label::RAW_VALUE];

/// Analog input field layout.
pub fn fields() -> Vec<FieldDefault> {
    let mut fields = standard_fields();
    fields.extend([
        FieldDefault::new("value", FieldType::Double, StorageLocation::class(0x00))
            .label(label::VALUE)
            .flags(FieldFlags::IN_SUMMARY | FieldFlags::READ_ONLY | FieldFlags::POLL),
        FieldDefault::new("raw_value", FieldType::Long, StorageLocation::class(0x08))
            .label(label::RAW_VALUE)
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("scale", FieldType::Double, StorageLocation::class(0x10))
            .flags(FieldFlags::IN_DESCRIPTION),
        FieldDefault::new("offset", FieldType::Double, StorageLocation::class(0x18))
            .flags(FieldFlags::IN_DESCRIPTION),
        FieldDefault::new("voltage", FieldType::Double, StorageLocation::type_struct(0x00))
            .flags(FieldFlags::IN_DESCRIPTION),
        FieldDefault::new("noise", FieldType::Double, StorageLocation::type_struct(0x08))
            .flags(FieldFlags::IN_DESCRIPTION),
    ]);
    fields
}

/// Driver table entry for `soft_ainput`.
pub fn entry(faults: FaultInjector) -> DriverEntry {
    DriverEntry::new("soft_ainput", SuperclassId::DEVICE, ClassId::ANALOG_INPUT, SOFT_AINPUT_TYPE)
        .constructor(Arc::new(SoftAinputDriver { faults }))
        .fields(fields())
}

/// A simulated analog input channel.
pub struct SoftAinput {
    name: String,
    voltage: f64,
    noise: f64,
    faults: FaultInjector,
    rng: SoftRng,
}

impl SoftAinput {
    /// Converter count for one reading.
    pub fn read_raw(&self) -> i64 {
        let volts = self.voltage + self.rng.noise(self.noise);
        ((volts * COUNTS_PER_VOLT).round() as i64).clamp(RAW_MIN, RAW_MAX)
    }
}

#[async_trait]
impl FieldProcessable for SoftAinput {
    fn processed_labels(&self) -> &'static [i64] {
        PROCESSED
    }

    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
        let field = record.field(ordinal)?;
        let label_value = field.label_value;
        self.faults.check(&self.name, &format!("{} {}", op, field.name))?;

        match (label_value, op) {
            (label::VALUE | label::RAW_VALUE, ProcessOp::Get) => {
                let raw = self.read_raw();
                let value = record.f64_or("offset", 0.0) + record.f64_or("scale", 0.0) * raw as f64;
                record.set_value_by_name("raw_value", FieldValue::Long(raw))?;
                record.set_value_by_name("value", FieldValue::Double(value))
            }
            _ => unknown_label(record, ordinal, op),
        }
    }
}

struct SoftAinputDriver {
    faults: FaultInjector,
}

impl Constructible for SoftAinputDriver {
    fn create(&self, record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
        let input = SoftAinput {
            name: record.name.clone(),
            voltage: record.f64_or("voltage", 0.0),
            noise: record.f64_or("noise", 0.0).abs(),
            faults: self.faults.clone(),
            rng: SoftRng::default(),
        };
        Ok(DeviceComponents::new().with_processor(Arc::new(input)))
    }
}
