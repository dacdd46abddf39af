//! Simulated scaler: a counter that accumulates at a fixed rate.

use crate::common::{FaultInjector, SoftRng};
use async_trait::async_trait;
use mx_core::field::FieldFlags;
use mx_core::{
    standard_fields, unknown_label, ClassId, ConstructContext, Constructible, DeviceComponents,
    DriverEntry, FieldDefault, FieldProcessable, FieldType, FieldValue, MxResult, ProcessOp, Record,
    StorageLocation, SuperclassId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// Static type id of `soft_scaler`.
pub const SOFT_SCALER_TYPE: i64 = 20;

/// Counts at which the simulated 32-bit counter overflows.
pub const OVERFLOW_COUNTS: i64 = u32::MAX as i64;

/// Label values of the scaler fields.
pub mod label {
    /// `value`
    pub const VALUE: i64 = 2101;
    /// `clear`
    pub const CLEAR: i64 = 2102;
    /// `overflow_set`
    pub const OVERFLOW_SET: i64 = 2103;
}

static PROCESSED: &[i64] = &[label::VALUE, label::CLEAR, label::OVERFLOW_SET];

/// Scaler field layout.
pub fn fields() -> Vec<FieldDefault> {
    let mut fields = standard_fields();
    fields.extend([
        FieldDefault::new("value", FieldType::Long, StorageLocation::class(0x00))
            .label(label::VALUE)
            .flags(FieldFlags::IN_SUMMARY | FieldFlags::READ_ONLY | FieldFlags::POLL),
        FieldDefault::new("clear", FieldType::Bool, StorageLocation::class(0x08)).label(label::CLEAR),
        FieldDefault::new("overflow_set", FieldType::Bool, StorageLocation::class(0x0c))
            .label(label::OVERFLOW_SET)
            .flags(FieldFlags::READ_ONLY),
        FieldDefault::new("count_rate", FieldType::Double, StorageLocation::type_struct(0x00))
            .flags(FieldFlags::IN_DESCRIPTION),
    ]);
    fields
}

/// Driver table entry for `soft_scaler`.
pub fn entry(faults: FaultInjector) -> DriverEntry {
    DriverEntry::new("soft_scaler", SuperclassId::DEVICE, ClassId::SCALER, SOFT_SCALER_TYPE)
        .constructor(Arc::new(SoftScalerDriver { faults }))
        .fields(fields())
}

#[derive(Debug)]
struct Counter {
    counts: f64,
    last_read: Instant,
    overflow: bool,
}

/// A simulated scaler counting at `count_rate` counts per second.
pub struct SoftScaler {
    name: String,
    rate: f64,
    faults: FaultInjector,
    rng: SoftRng,
    counter: Mutex<Counter>,
}

impl SoftScaler {
    /// Counter starting at zero.
    pub fn new(name: impl Into<String>, rate: f64, faults: FaultInjector) -> Self {
        Self {
            name: name.into(),
            rate: rate.max(0.0),
            faults,
            rng: SoftRng::default(),
            counter: Mutex::new(Counter {
                counts: 0.0,
                last_read: Instant::now(),
                overflow: false,
            }),
        }
    }

    /// Accumulate counts since the last read and return the total.
    ///
    /// Each read adds up to half a count of jitter.
    pub fn read(&self) -> (i64, bool) {
        let mut counter = self.counter.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(counter.last_read).as_secs_f64();
        counter.last_read = now;
        if elapsed > 0.0 && self.rate > 0.0 {
            counter.counts += (self.rate * elapsed + self.rng.noise(0.5)).max(0.0);
        }
        if counter.counts >= OVERFLOW_COUNTS as f64 {
            counter.counts = OVERFLOW_COUNTS as f64;
            counter.overflow = true;
        }
        (counter.counts.round() as i64, counter.overflow)
    }

    /// Zero the counter and the overflow flag.
    pub fn clear(&self) {
        let mut counter = self.counter.lock();
        counter.counts = 0.0;
        counter.overflow = false;
        counter.last_read = Instant::now();
    }
}

#[async_trait]
impl FieldProcessable for SoftScaler {
    fn processed_labels(&self) -> &'static [i64] {
        PROCESSED
    }

    async fn process(&self, record: &mut Record, ordinal: usize, op: ProcessOp) -> MxResult<()> {
        let field = record.field(ordinal)?;
        let label_value = field.label_value;
        self.faults.check(&self.name, &format!("{} {}", op, field.name))?;

        match (label_value, op) {
            (label::VALUE | label::OVERFLOW_SET, ProcessOp::Get) => {
                let (counts, overflow) = self.read();
                record.set_value_by_name("value", FieldValue::Long(counts))?;
                record.set_value_by_name("overflow_set", FieldValue::Bool(overflow))
            }
            (label::CLEAR, ProcessOp::Put) => {
                if record.value(ordinal)?.as_bool() == Some(true) {
                    self.clear();
                    record.set_value(ordinal, FieldValue::Bool(false))?;
                    record.set_value_by_name("value", FieldValue::Long(0))?;
                    record.set_value_by_name("overflow_set", FieldValue::Bool(false))?;
                }
                Ok(())
            }
            _ => unknown_label(record, ordinal, op),
        }
    }
}

struct SoftScalerDriver {
    faults: FaultInjector,
}

impl Constructible for SoftScalerDriver {
    fn create(&self, record: &Record, _ctx: &ConstructContext) -> MxResult<DeviceComponents> {
        let scaler = SoftScaler::new(
            record.name.clone(),
            record.f64_or("count_rate", 0.0),
            self.faults.clone(),
        );
        Ok(DeviceComponents::new().with_processor(Arc::new(scaler)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::build_record;
    use mx_core::{get_field_value, put_field_value, MxError};
    use std::time::Duration;

    async fn scaler(rate: f64, faults: FaultInjector) -> Record {
        build_record(entry(faults), "sc1", &[("count_rate", FieldValue::Double(rate))]).await
    }

    async fn read_value(record: &mut Record) -> i64 {
        let ordinal = record.field_index("value").unwrap();
        get_field_value(record, ordinal).await.unwrap().as_i64().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn counts_accumulate_with_time() {
        let mut record = scaler(1000.0, FaultInjector::none()).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let first = read_value(&mut record).await;
        assert!((1999..=2001).contains(&first), "counts {}", first);

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = read_value(&mut record).await;
        assert!((2998..=3002).contains(&second), "counts {}", second);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_zeroes_and_resets_the_command() {
        let mut record = scaler(100.0, FaultInjector::none()).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(read_value(&mut record).await > 0);

        let clear = record.field_index("clear").unwrap();
        put_field_value(&mut record, clear, FieldValue::Bool(true))
            .await
            .unwrap();
        assert_eq!(record.value(clear).unwrap(), &FieldValue::Bool(false));
        assert_eq!(read_value(&mut record).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_saturates_and_flags_overflow() {
        let mut record = scaler(1.0e9, FaultInjector::none()).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(read_value(&mut record).await, OVERFLOW_COUNTS);
        assert_eq!(record.value_by_name("overflow_set").unwrap(), &FieldValue::Bool(true));
    }

    #[tokio::test(start_paused = true)]
    async fn value_is_read_only_to_clients() {
        let mut record = scaler(1.0, FaultInjector::none()).await;
        let value = record.field_index("value").unwrap();
        let err = put_field_value(&mut record, value, FieldValue::Long(5))
            .await
            .unwrap_err();
        assert!(matches!(err, MxError::PermissionDenied(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failure_on_clear() {
        let faults = FaultInjector::none();
        let mut record = scaler(1.0, faults.clone()).await;
        faults.fail_next("PUT clear");
        let clear = record.field_index("clear").unwrap();
        let err = put_field_value(&mut record, clear, FieldValue::Bool(true))
            .await
            .unwrap_err();
        assert!(matches!(err, MxError::DeviceIo(_)));
        assert_eq!(record.value(clear).unwrap(), &FieldValue::Bool(true));
    }
}
